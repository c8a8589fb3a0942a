use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level configuration loaded from `~/.termbridge/config.toml`.
///
/// Every section is optional; missing sections and keys fall back to
/// defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Config {
    /// Load config from `~/.termbridge/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `TERMBRIDGE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("TERMBRIDGE_HOST") {
            self.daemon.host = host;
        }
        if let Some(port) = lookup("TERMBRIDGE_PORT") {
            self.daemon.port = port.parse().map_err(|_| {
                ConfigError::Validation(format!("TERMBRIDGE_PORT is not a port number: {port}"))
            })?;
        }
        if let Some(level) = lookup("TERMBRIDGE_LOG_LEVEL") {
            self.general.log_level = level;
        }
        if let Some(program) = lookup("TERMBRIDGE_AGENT_PROGRAM") {
            self.agent.program = program;
        }
        self.validate()
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.session.validate()?;
        self.input.validate()?;
        self.websocket.validate()?;
        self.agent.validate()?;
        if self.input.max_message_bytes > self.session.replay_buffer_bytes {
            return Err(ConfigError::Validation(format!(
                "input.max_message_bytes ({}) exceeds session.replay_buffer_bytes ({})",
                self.input.max_message_bytes, self.session.replay_buffer_bytes
            )));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        home_dir().join(".termbridge").join("config.toml")
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None if path == "~" => home_dir(),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn require_nonzero(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation(format!("{field} must be greater than zero")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "human" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be \"human\" or \"json\", got {other:?}"
            ))),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
        }
    }
}

impl DaemonConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    7681
}

/// Session lifetime and buffering knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_replay_buffer_bytes")]
    pub replay_buffer_bytes: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    #[serde(default = "default_output_queue_depth")]
    pub output_queue_depth: usize,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            replay_buffer_bytes: default_replay_buffer_bytes(),
            sweep_interval_secs: default_sweep_interval_secs(),
            close_grace_ms: default_close_grace_ms(),
            output_queue_depth: default_output_queue_depth(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("session.idle_timeout_secs", self.idle_timeout_secs)?;
        require_nonzero("session.replay_buffer_bytes", self.replay_buffer_bytes as u64)?;
        require_nonzero("session.sweep_interval_secs", self.sweep_interval_secs)?;
        require_nonzero("session.output_queue_depth", self.output_queue_depth as u64)?;
        require_nonzero("session.rows", self.rows.into())?;
        require_nonzero("session.cols", self.cols.into())?;
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_replay_buffer_bytes() -> usize {
    64 * 1024
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_close_grace_ms() -> u64 {
    500
}
fn default_output_queue_depth() -> usize {
    256
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl InputConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("input.max_message_bytes", self.max_message_bytes as u64)
    }
}

fn default_max_message_bytes() -> usize {
    2048
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_client_queue_depth")]
    pub client_queue_depth: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            client_queue_depth: default_client_queue_depth(),
        }
    }
}

impl WebSocketConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("websocket.heartbeat_interval_secs", self.heartbeat_interval_secs)?;
        require_nonzero("websocket.client_queue_depth", self.client_queue_depth as u64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_client_queue_depth() -> usize {
    256
}

/// The command spawned for each logical key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Each session runs in `<workdir_root>/<logical_key>`.
    #[serde(default = "default_workdir_root")]
    pub workdir_root: String,
    #[serde(default = "default_agent_env")]
    pub env: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            args: Vec::new(),
            workdir_root: default_workdir_root(),
            env: default_agent_env(),
        }
    }
}

impl AgentConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::Validation("agent.program must not be empty".into()));
        }
        Ok(())
    }

    pub fn workdir_root_path(&self) -> PathBuf {
        expand_home(&self.workdir_root)
    }
}

fn default_agent_program() -> String {
    "claude".into()
}
fn default_workdir_root() -> String {
    "~/.termbridge/work".into()
}
fn default_agent_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
    ])
}
