use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tb_core::config::SessionConfig;
use tb_core::shutdown::ShutdownSignal;
use tb_core::types::{CloseReason, SessionSummary};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pty::{ProcessTerminal, PtyError, PtyOptions};
use crate::session::Session;
use crate::spawn::CommandResolver;

/// Longest logical key accepted by the registry.
pub const MAX_KEY_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid session key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("could not resolve command: {0}")]
    Resolve(String),

    #[error("session spawn failed: {0}")]
    Spawn(#[from] PtyError),

    #[error("session not found: {0}")]
    NotFound(Uuid),
}

/// Keys become path components downstream, so only a conservative
/// character set is accepted.
pub fn validate_logical_key(key: &str) -> Result<(), RegistryError> {
    let invalid = |reason| {
        Err(RegistryError::InvalidKey {
            key: key.chars().take(MAX_KEY_LEN).collect(),
            reason,
        })
    };
    if key.is_empty() {
        return invalid("empty");
    }
    if key.len() > MAX_KEY_LEN {
        return invalid("longer than 128 characters");
    }
    if key == "." || key == ".." {
        return invalid("reserved path component");
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return invalid("only ASCII letters, digits, '.', '_' and '-' are allowed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub idle_timeout: Duration,
    pub replay_capacity: usize,
    pub close_grace: Duration,
    pub output_queue_depth: usize,
    pub write_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            replay_capacity: 64 * 1024,
            close_grace: Duration::from_millis(500),
            output_queue_depth: 256,
            write_timeout: Duration::from_secs(2),
        }
    }
}

impl RegistryConfig {
    pub fn pty_options(&self) -> PtyOptions {
        PtyOptions {
            output_queue_depth: self.output_queue_depth,
            write_timeout: self.write_timeout,
            close_grace: self.close_grace,
        }
    }
}

impl From<&SessionConfig> for RegistryConfig {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            idle_timeout: cfg.idle_timeout(),
            replay_capacity: cfg.replay_buffer_bytes,
            close_grace: cfg.close_grace(),
            output_queue_depth: cfg.output_queue_depth,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Process-wide table of live sessions, addressable by id or logical key.
///
/// At most one live session exists per logical key. Creation for a key is
/// serialized through a per-key async gate; lookups only take DashMap shard
/// locks and never across an `.await`.
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: DashMap<Uuid, Arc<Session>>,
    by_key: DashMap<String, Uuid>,
    creation_gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        info!(
            idle_timeout = ?config.idle_timeout,
            replay_capacity = config.replay_capacity,
            "creating session registry"
        );
        Self {
            config,
            sessions: DashMap::new(),
            by_key: DashMap::new(),
            creation_gates: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the live session for `logical_key`, spawning one through
    /// `resolver` if there is none. Concurrent callers for the same key
    /// all receive the same session.
    pub async fn create_or_get(
        &self,
        logical_key: &str,
        resolver: &dyn CommandResolver,
    ) -> Result<Arc<Session>, RegistryError> {
        validate_logical_key(logical_key)?;
        if let Some(existing) = self.get_by_key(logical_key) {
            return Ok(existing);
        }

        let gate = Arc::clone(
            self.creation_gates
                .entry(logical_key.to_string())
                .or_default()
                .value(),
        );
        let creating = gate.lock().await;
        let result = self.create_locked(logical_key, resolver).await;
        drop(creating);
        drop(gate);
        // Drop the gate once no other creator holds or awaits it.
        self.creation_gates
            .remove_if(logical_key, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    async fn create_locked(
        &self,
        logical_key: &str,
        resolver: &dyn CommandResolver,
    ) -> Result<Arc<Session>, RegistryError> {
        // Another caller may have finished while we waited.
        if let Some(existing) = self.get_by_key(logical_key) {
            return Ok(existing);
        }

        let spec = resolver.resolve(logical_key).await?;
        let options = self.config.pty_options();
        let terminal = tokio::task::spawn_blocking(move || ProcessTerminal::spawn(spec, options))
            .await
            .map_err(|e| RegistryError::Spawn(PtyError::Internal(e.to_string())))??;

        let session = Session::start(
            logical_key,
            terminal,
            self.config.replay_capacity,
            self.config.idle_timeout,
        );
        self.sessions.insert(session.id(), Arc::clone(&session));
        self.by_key.insert(logical_key.to_string(), session.id());
        info!(session_id = %session.id(), logical_key, pid = ?session.terminal().pid(), "session created");
        Ok(session)
    }

    /// Live session by id. A dead entry found here is reaped.
    pub fn get(&self, session_id: Uuid) -> Option<Arc<Session>> {
        let session = self.sessions.get(&session_id).map(|s| Arc::clone(s.value()))?;
        self.alive_or_reap(session)
    }

    /// Live session by logical key. A dead entry found here is reaped.
    pub fn get_by_key(&self, logical_key: &str) -> Option<Arc<Session>> {
        let id = *self.by_key.get(logical_key)?.value();
        let Some(session) = self.sessions.get(&id).map(|s| Arc::clone(s.value())) else {
            self.by_key.remove_if(logical_key, |_, v| *v == id);
            return None;
        };
        self.alive_or_reap(session)
    }

    /// Reset a session's idle clock. Returns `false` for unknown sessions.
    pub fn touch(&self, session_id: Uuid) -> bool {
        match self.sessions.get(&session_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Append bytes to a session's replay buffer.
    pub fn append_to_buffer(&self, session_id: Uuid, data: &[u8]) -> bool {
        match self.sessions.get(&session_id) {
            Some(session) => {
                session.append_to_buffer(data);
                true
            }
            None => false,
        }
    }

    /// Full replay buffer of a session.
    pub fn replay(&self, session_id: Uuid) -> Option<Vec<u8>> {
        self.sessions.get(&session_id).map(|s| s.replay())
    }

    /// Terminate a session and forget it. Returns `false` if it was unknown.
    pub async fn close(&self, session_id: Uuid) -> bool {
        self.close_with(session_id, CloseReason::Explicit).await
    }

    async fn close_with(&self, session_id: Uuid, reason: CloseReason) -> bool {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return false;
        };
        self.forget_key(&session);
        session.close(reason).await;
        true
    }

    /// Summaries of every live session, oldest first.
    pub fn list_alive(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_alive())
            .map(|entry| entry.value().summary())
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    /// Close every session that is no longer alive. Returns how many.
    pub async fn sweep(&self) -> usize {
        let dead: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut reaped = 0;
        for session in dead {
            let reason = if session.terminal().has_exited() {
                CloseReason::Exited
            } else {
                CloseReason::IdleTimeout
            };
            if self.close_with(session.id(), reason).await {
                debug!(session_id = %session.id(), %reason, "swept session");
                reaped += 1;
            }
        }
        reaped
    }

    /// Run [`SessionRegistry::sweep`] every `interval` until shutdown.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => {
                        debug!("session sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = registry.sweep().await;
                        if reaped > 0 {
                            info!(reaped, remaining = registry.len(), "idle sweep closed sessions");
                        }
                    }
                }
            }
        })
    }

    /// Close every session. Returns how many were closed.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for id in ids {
            if self.close_with(id, CloseReason::Shutdown).await {
                closed += 1;
            }
        }
        info!(closed, "session registry shut down");
        closed
    }

    /// Number of tracked sessions, alive or awaiting reaping.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // -- internals ---------------------------------------------------------

    fn alive_or_reap(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        if session.is_alive() {
            return Some(session);
        }
        let removed = self
            .sessions
            .remove_if(&session.id(), |_, s| Arc::ptr_eq(s, &session))
            .is_some();
        if removed {
            self.forget_key(&session);
            let reason = if session.terminal().has_exited() {
                CloseReason::Exited
            } else {
                CloseReason::IdleTimeout
            };
            debug!(session_id = %session.id(), %reason, "reaping dead session on lookup");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        session.close(reason).await;
                    });
                }
                Err(_) => {
                    session.close_blocking(reason);
                }
            }
        }
        None
    }

    fn forget_key(&self, session: &Session) {
        let key = session.logical_key();
        self.by_key.remove_if(key, |_, id| *id == session.id());
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            warn!(sessions = self.sessions.len(), "session registry dropped with live sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        let longest = "x".repeat(MAX_KEY_LEN);
        let too_long = "x".repeat(MAX_KEY_LEN + 1);
        for key in ["ticket-42", "a", "A.b_c-1", longest.as_str()] {
            assert!(validate_logical_key(key).is_ok(), "{key}");
        }
        for key in ["", ".", "..", "a/b", "../etc", "with space", "ü", too_long.as_str()] {
            assert!(
                matches!(validate_logical_key(key), Err(RegistryError::InvalidKey { .. })),
                "{key:?}"
            );
        }
    }

    #[test]
    fn config_from_session_section() {
        let section = SessionConfig {
            idle_timeout_secs: 10,
            replay_buffer_bytes: 4096,
            close_grace_ms: 50,
            output_queue_depth: 16,
            ..SessionConfig::default()
        };
        let cfg = RegistryConfig::from(&section);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(10));
        assert_eq!(cfg.replay_capacity, 4096);
        assert_eq!(cfg.pty_options().close_grace, Duration::from_millis(50));
        assert_eq!(cfg.pty_options().output_queue_depth, 16);
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let id = Uuid::new_v4();
        assert!(registry.get(id).is_none());
        assert!(!registry.touch(id));
        assert!(!registry.append_to_buffer(id, b"x"));
        assert!(registry.replay(id).is_none());
        assert!(!registry.close(id).await);
        assert!(registry.is_empty());
    }
}
