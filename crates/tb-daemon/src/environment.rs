use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tb_core::config::Config;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_VAR: &str = "TERMBRIDGE_CONFIG";

/// Load a `.env` file from the working directory or any parent.
///
/// A missing file is not an error. Returns the path that was loaded so the
/// caller can log it once logging is up.
pub fn load_dotenv() -> Result<Option<PathBuf>> {
    match dotenv::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e).context("failed to load .env file"),
    }
}

/// Config file named by `TERMBRIDGE_CONFIG`, if set.
pub fn config_path_override() -> Option<PathBuf> {
    std::env::var_os(CONFIG_PATH_VAR).map(PathBuf::from)
}

/// Load config from `path` (or `~/.termbridge/config.toml`), then apply
/// `TERMBRIDGE_*` overrides.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    config
        .apply_env_overrides()
        .context("invalid TERMBRIDGE_* override")?;
    Ok(config)
}
