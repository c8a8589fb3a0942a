use std::sync::Arc;

use anyhow::{Context, Result};
use tb_bridge::http_api::{api_router, BridgeState};
use tb_core::config::Config;
use tb_core::shutdown::ShutdownSignal;
use tb_session::registry::{RegistryConfig, SessionRegistry};
use tb_session::spawn::{CommandResolver, StaticCommand};
use tracing::{info, warn};

/// The termbridge server.
///
/// Owns the session registry and the router state. Shuts down gracefully
/// when the `ShutdownSignal` is triggered (e.g. via ctrl-c): the listener
/// stops accepting, the sweeper exits, and every live session is closed.
pub struct Daemon {
    config: Config,
    registry: Arc<SessionRegistry>,
    state: Arc<BridgeState>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build a daemon that spawns `[agent]` for every new logical key.
    pub fn new(config: Config) -> Result<Self> {
        let resolver: Arc<dyn CommandResolver> =
            Arc::new(StaticCommand::from_config(&config.agent, &config.session));
        Self::with_resolver(config, resolver)
    }

    /// Build a daemon around a custom spawn collaborator.
    pub fn with_resolver(config: Config, resolver: Arc<dyn CommandResolver>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::from(&config.session)));
        let state = Arc::new(BridgeState::from_config(
            &config,
            Arc::clone(&registry),
            resolver,
        ));
        Ok(Self {
            config,
            registry,
            state,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Send the shutdown signal.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind `daemon.host:daemon.port` and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.config.daemon.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        let sweep_interval = self.config.session.sweep_interval();
        let sweeper = self
            .registry
            .spawn_sweeper(sweep_interval, self.shutdown.clone());

        info!(
            %bind_addr,
            idle_timeout_secs = self.config.session.idle_timeout_secs,
            sweep_interval_secs = self.config.session.sweep_interval_secs,
            agent = %self.config.agent.program,
            "termbridge listening"
        );

        let router = api_router(Arc::clone(&self.state));
        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await;

        // The server may also stop on its own error; make sure the sweeper follows.
        if !self.shutdown.is_shutting_down() {
            self.shutdown.trigger();
        }
        let closed = self.registry.shutdown().await;
        info!(closed, "sessions closed");
        if let Err(e) = sweeper.await {
            warn!(error = %e, "session sweeper task failed");
        }

        served.context("http server failed")?;
        info!("daemon stopped");
        Ok(())
    }
}
