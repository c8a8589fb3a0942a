use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tb_core::types::{CloseReason, SessionSummary, SignalName};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::pty::{ProcessTerminal, Result};
use crate::replay::ReplayBuffer;

/// How long the pump waits for an exit status once output has ended.
const EXIT_WAIT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Events & bindings
// ---------------------------------------------------------------------------

/// What a bound connection observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of process output, already recorded in the replay buffer.
    Output(Vec<u8>),
    /// The process ended. Always the last event of a binding.
    Exited { code: Option<i32> },
    /// The binding was cut by the server. No further events follow.
    Detached(CloseReason),
}

/// One connection's subscription to a session.
///
/// Created by [`Session::bind`]. The replay snapshot and the event queue
/// are taken under the same lock as output recording, so the connection
/// sees every byte exactly once: either in `replay` or as an event.
#[derive(Debug)]
pub struct Binding {
    id: u64,
    /// Replay buffer contents at bind time.
    pub replay: Vec<u8>,
    /// Whether another connection had been bound to this session before.
    pub resumed: bool,
    events: flume::Receiver<SessionEvent>,
    detach_reason: Arc<OnceLock<CloseReason>>,
}

impl Binding {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event for this connection. Yields [`SessionEvent::Detached`]
    /// once the session cuts the binding.
    pub async fn recv(&self) -> SessionEvent {
        match self.events.recv_async().await {
            Ok(event) => event,
            Err(_) => SessionEvent::Detached(
                self.detach_reason
                    .get()
                    .copied()
                    .unwrap_or(CloseReason::Explicit),
            ),
        }
    }
}

struct BindingSlot {
    id: u64,
    tx: flume::Sender<SessionEvent>,
    reason: Arc<OnceLock<CloseReason>>,
}

impl BindingSlot {
    /// Dropping the sender ends the receiver's queue once it is drained.
    fn detach(self, reason: CloseReason) {
        let _ = self.reason.set(reason);
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionState {
    replay: ReplayBuffer,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    binding: Option<BindingSlot>,
    binds: u64,
    exit: Option<Option<i32>>,
}

impl SessionState {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }
}

/// A process terminal plus the history and activity clock that let it
/// outlive any single connection.
pub struct Session {
    id: Uuid,
    logical_key: String,
    created_at: DateTime<Utc>,
    idle_timeout: Duration,
    terminal: Arc<ProcessTerminal>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

impl Session {
    /// Wrap a freshly spawned terminal and start recording its output.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(
        logical_key: impl Into<String>,
        terminal: ProcessTerminal,
        replay_capacity: usize,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let now = Utc::now();
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            logical_key: logical_key.into(),
            created_at: now,
            idle_timeout,
            terminal: Arc::new(terminal),
            state: Mutex::new(SessionState {
                replay: ReplayBuffer::new(replay_capacity),
                last_activity: Instant::now(),
                last_activity_at: now,
                binding: None,
                binds: 0,
                exit: None,
            }),
            closed: AtomicBool::new(false),
        });
        spawn_pump(&session);
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn logical_key(&self) -> &str {
        &self.logical_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn terminal(&self) -> &Arc<ProcessTerminal> {
        &self.terminal
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| {
            warn!(session_id = %self.id, "session state lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Reset the idle clock.
    pub fn touch(&self) {
        self.lock_state().touch();
    }

    /// Time since the last input, output or explicit touch.
    pub fn idle_for(&self) -> Duration {
        self.lock_state().last_activity.elapsed()
    }

    /// Alive means: not closed, process still running, and active within
    /// the idle timeout.
    pub fn is_alive(&self) -> bool {
        !self.is_closed() && !self.terminal.has_exited() && self.idle_for() < self.idle_timeout
    }

    /// Exit code once the process has ended.
    pub fn exit_code(&self) -> Option<i32> {
        let recorded = self.lock_state().exit;
        match recorded {
            Some(code) => code,
            None => self.terminal.exit_code(),
        }
    }

    /// Append to the replay buffer without notifying the bound connection.
    pub fn append_to_buffer(&self, data: &[u8]) {
        let mut state = self.lock_state();
        state.replay.push(data);
        state.touch();
    }

    /// Current replay buffer contents.
    pub fn replay(&self) -> Vec<u8> {
        self.lock_state().replay.snapshot()
    }

    pub fn buffer_len(&self) -> usize {
        self.lock_state().replay.len()
    }

    pub fn is_attached(&self) -> bool {
        self.lock_state().binding.is_some()
    }

    /// Attach a connection, evicting whichever connection was bound before.
    pub fn bind(&self, queue_depth: usize) -> Binding {
        let (tx, rx) = flume::bounded(queue_depth.max(1));
        let reason = Arc::new(OnceLock::new());

        let mut state = self.lock_state();
        if let Some(previous) = state.binding.take() {
            info!(session_id = %self.id, binding = previous.id, "evicting previous connection");
            previous.detach(CloseReason::Evicted);
        }

        state.binds += 1;
        let id = state.binds;
        let resumed = id > 1;
        let replay = state.replay.snapshot();

        if self.is_closed() {
            let _ = reason.set(CloseReason::Explicit);
            drop(tx);
        } else {
            if let Some(code) = state.exit {
                let _ = tx.try_send(SessionEvent::Exited { code });
            }
            state.binding = Some(BindingSlot {
                id,
                tx,
                reason: Arc::clone(&reason),
            });
        }
        state.touch();
        drop(state);

        debug!(session_id = %self.id, binding = id, resumed, replay_bytes = replay.len(), "connection bound");
        Binding {
            id,
            replay,
            resumed,
            events: rx,
            detach_reason: reason,
        }
    }

    /// Release a binding. A stale id (already evicted) is ignored.
    pub fn unbind(&self, binding_id: u64) {
        let mut state = self.lock_state();
        if state.binding.as_ref().is_some_and(|slot| slot.id == binding_id) {
            state.binding = None;
            debug!(session_id = %self.id, binding = binding_id, "connection released");
        }
    }

    /// Forward client input to the process.
    pub async fn write_input(&self, data: &[u8]) -> Result<()> {
        self.terminal.write(data).await?;
        self.touch();
        Ok(())
    }

    pub async fn send_eof(&self) -> Result<()> {
        self.terminal.send_eof().await?;
        self.touch();
        Ok(())
    }

    pub fn send_signal(&self, name: SignalName) -> Result<()> {
        self.terminal.send_signal(name)?;
        self.touch();
        Ok(())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> bool {
        self.touch();
        self.terminal.resize(rows, cols)
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.lock_state();
        SessionSummary {
            logical_key: self.logical_key.clone(),
            session_id: self.id,
            created_at: self.created_at,
            last_activity: state.last_activity_at,
            buffer_bytes: state.replay.len(),
            attached: state.binding.is_some(),
            pid: self.terminal.pid(),
        }
    }

    /// Cut the bound connection and terminate the process group.
    /// Returns `false` if the session was already closed.
    pub async fn close(&self, reason: CloseReason) -> bool {
        if !self.begin_close(reason) {
            return false;
        }
        let terminal = Arc::clone(&self.terminal);
        if let Err(e) = tokio::task::spawn_blocking(move || terminal.close()).await {
            warn!(session_id = %self.id, "terminal close task failed: {e}");
        }
        true
    }

    /// Blocking variant of [`Session::close`] for callers outside a runtime.
    pub fn close_blocking(&self, reason: CloseReason) -> bool {
        if !self.begin_close(reason) {
            return false;
        }
        self.terminal.close();
        true
    }

    fn begin_close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(slot) = self.lock_state().binding.take() {
            slot.detach(reason);
        }
        info!(session_id = %self.id, logical_key = %self.logical_key, %reason, "closing session");
        true
    }

    // -- output pump -------------------------------------------------------

    fn record_output(&self, chunk: Vec<u8>) {
        let mut state = self.lock_state();
        state.replay.push(&chunk);
        state.touch();

        let Some(slot) = state.binding.as_ref() else {
            return;
        };
        match slot.tx.try_send(SessionEvent::Output(chunk)) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(_)) => {
                if let Some(slot) = state.binding.take() {
                    warn!(session_id = %self.id, binding = slot.id, "connection lagging, detaching");
                    slot.detach(CloseReason::Lagged);
                }
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                state.binding = None;
            }
        }
    }

    fn record_exit(&self, code: Option<i32>) {
        let mut state = self.lock_state();
        state.exit = Some(code);
        if let Some(slot) = state.binding.as_ref() {
            if slot.tx.try_send(SessionEvent::Exited { code }).is_err() {
                if let Some(slot) = state.binding.take() {
                    slot.detach(CloseReason::Lagged);
                }
            }
        }
        drop(state);
        info!(session_id = %self.id, logical_key = %self.logical_key, ?code, "session process exited");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("logical_key", &self.logical_key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drain the terminal's output for the whole life of the session, so
/// output produced while nobody is attached still reaches the replay.
fn spawn_pump(session: &Arc<Session>) {
    let session = Arc::clone(session);
    let span = tracing::info_span!(
        "session_pump",
        session_id = %session.id,
        logical_key = %session.logical_key,
    );
    tokio::spawn(
        async move {
            let mut output = session.terminal.stream_output();
            while let Some(chunk) = output.next().await {
                session.record_output(chunk);
            }
            let code = session.terminal.wait_for_exit(EXIT_WAIT).await;
            session.record_exit(code);
        }
        .instrument(span),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{PtyOptions, SpawnSpec};

    fn shell(script: &str) -> ProcessTerminal {
        ProcessTerminal::spawn(
            SpawnSpec::new("/bin/sh", std::env::temp_dir())
                .arg("-c")
                .arg(script),
            PtyOptions::default(),
        )
        .expect("spawn /bin/sh")
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn output_is_buffered_without_a_binding() {
        let session = Session::start("buffered", shell("printf unattached; sleep 5"), 1024, Duration::from_secs(60));
        wait_until(|| session.replay().ends_with(b"unattached")).await;
        assert!(!session.is_attached());
        assert!(session.is_alive());
        session.close(CloseReason::Explicit).await;
    }

    #[tokio::test]
    async fn second_bind_evicts_first() {
        let session = Session::start("evict", shell("sleep 5"), 1024, Duration::from_secs(60));
        let first = session.bind(8);
        assert!(!first.resumed);
        let second = session.bind(8);
        assert!(second.resumed);
        assert_eq!(first.recv().await, SessionEvent::Detached(CloseReason::Evicted));

        session.unbind(first.id());
        assert!(session.is_attached(), "stale unbind must not release the new binding");
        session.unbind(second.id());
        assert!(!session.is_attached());
        session.close(CloseReason::Explicit).await;
    }

    #[tokio::test]
    async fn close_detaches_binding_with_reason() {
        let session = Session::start("closing", shell("sleep 5"), 1024, Duration::from_secs(60));
        let binding = session.bind(8);
        assert!(session.close(CloseReason::IdleTimeout).await);
        assert!(!session.close(CloseReason::Explicit).await);
        assert_eq!(binding.recv().await, SessionEvent::Detached(CloseReason::IdleTimeout));
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn exit_is_delivered_after_output() {
        let session = Session::start("exit", shell("sleep 0.3; printf done; exit 3"), 1024, Duration::from_secs(60));
        let binding = session.bind(64);
        let mut seen = binding.replay.clone();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), binding.recv()).await.expect("event") {
                SessionEvent::Output(chunk) => seen.extend(chunk),
                SessionEvent::Exited { code } => {
                    assert_eq!(code, Some(3));
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("done"));
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn idle_session_is_not_alive() {
        let session = Session::start("idle", shell("sleep 5"), 1024, Duration::from_millis(150));
        assert!(session.is_alive());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!session.is_alive());
        session.touch();
        assert!(session.is_alive());
        session.close(CloseReason::Explicit).await;
    }
}
