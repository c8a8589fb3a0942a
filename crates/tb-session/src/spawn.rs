use std::path::PathBuf;

use async_trait::async_trait;
use tb_core::config::{AgentConfig, SessionConfig};
use tracing::debug;

use crate::pty::SpawnSpec;
use crate::registry::RegistryError;

/// Turns a logical key into the command a new session should run.
#[async_trait]
pub trait CommandResolver: Send + Sync {
    async fn resolve(&self, logical_key: &str) -> Result<SpawnSpec, RegistryError>;
}

#[async_trait]
impl<F> CommandResolver for F
where
    F: Fn(&str) -> Result<SpawnSpec, RegistryError> + Send + Sync,
{
    async fn resolve(&self, logical_key: &str) -> Result<SpawnSpec, RegistryError> {
        self(logical_key)
    }
}

/// Runs the same program for every key, each in its own working directory
/// `<workdir_root>/<logical_key>` (created on demand).
#[derive(Debug, Clone)]
pub struct StaticCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    workdir_root: PathBuf,
    rows: u16,
    cols: u16,
}

impl StaticCommand {
    pub fn new(program: impl Into<String>, workdir_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            workdir_root: workdir_root.into(),
            rows: 24,
            cols: 80,
        }
    }

    pub fn from_config(agent: &AgentConfig, session: &SessionConfig) -> Self {
        Self {
            program: agent.program.clone(),
            args: agent.args.clone(),
            env: agent
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            workdir_root: agent.workdir_root_path(),
            rows: session.rows,
            cols: session.cols,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn workdir_root(&self) -> &PathBuf {
        &self.workdir_root
    }
}

#[async_trait]
impl CommandResolver for StaticCommand {
    async fn resolve(&self, logical_key: &str) -> Result<SpawnSpec, RegistryError> {
        let cwd = self.workdir_root.join(logical_key);
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|e| RegistryError::Resolve(format!("{}: {e}", cwd.display())))?;
        debug!(logical_key, cwd = %cwd.display(), program = %self.program, "resolved spawn command");

        let mut spec = SpawnSpec::new(&self.program, cwd)
            .args(self.args.iter().cloned())
            .size(self.rows, self.cols);
        spec.env = self.env.clone();
        spec.env
            .push(("TERMBRIDGE_SESSION_KEY".to_string(), logical_key.to_string()));
        Ok(spec)
    }
}
