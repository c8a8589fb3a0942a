//! termbridge daemon: serves persistent PTY sessions over WebSocket.

use anyhow::Result;
use tb_daemon::daemon::Daemon;
use tb_daemon::environment;
use tb_telemetry::logging::LogFormat;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv_path = environment::load_dotenv()?;
    let config = environment::load_config(environment::config_path_override().as_deref())?;

    let log_format: LogFormat = config.general.log_format.parse().unwrap_or_default();
    tb_telemetry::logging::init_logging("termbridge", &config.general.log_level, log_format);
    if let Some(path) = dotenv_path {
        info!(path = %path.display(), "loaded environment file");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "termbridge starting"
    );

    let daemon = Daemon::new(config)?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon execution failed");
        return Err(e);
    }
    Ok(())
}
