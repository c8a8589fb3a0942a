use std::io::{Read as IoRead, Write as IoWrite};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tb_core::types::SignalName;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bytes handed to the writer thread per `write_all` call.
const WRITE_CHUNK: usize = 512;
/// How long [`ProcessTerminal::close`] waits for the group to die after `SIGKILL`.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// End-of-transmission, what Ctrl-D sends in canonical mode.
const EOT: u8 = 0x04;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty spawn failed: {0}")]
    Spawn(String),

    #[error("process terminal is closed")]
    Closed,

    #[error("pty I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PtyError>;

// ---------------------------------------------------------------------------
// SpawnSpec / PtyOptions
// ---------------------------------------------------------------------------

/// What to run inside a new pseudoterminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }
}

/// Queue depths and timeouts for one process terminal.
#[derive(Debug, Clone, Copy)]
pub struct PtyOptions {
    /// Chunks buffered between the reader thread and the consumer before the
    /// reader blocks.
    pub output_queue_depth: usize,
    /// Longest a [`ProcessTerminal::write`] may wait for queue space.
    pub write_timeout: Duration,
    /// Time between `SIGTERM` and `SIGKILL` during [`ProcessTerminal::close`].
    pub close_grace: Duration,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            output_queue_depth: 256,
            write_timeout: Duration::from_secs(2),
            close_grace: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessGroup
// ---------------------------------------------------------------------------

/// The process group led by a spawned child.
///
/// The child is started as a session leader on its own pseudoterminal, so
/// its pid doubles as the group id and every descendant that does not leave
/// the group receives signals sent here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup(i32);

impl ProcessGroup {
    pub fn id(&self) -> i32 {
        self.0
    }

    #[cfg(unix)]
    pub fn signal(&self, signal: libc::c_int) -> std::io::Result<()> {
        // SAFETY: killpg has no memory-safety preconditions; a positive id
        // never addresses "every process" the way 0 or -1 would.
        let rc = unsafe { libc::killpg(self.0, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    pub fn signal(&self, _signal: i32) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process group signals require a unix host",
        ))
    }
}

#[cfg(unix)]
fn signal_number(name: SignalName) -> libc::c_int {
    match name {
        SignalName::Interrupt => libc::SIGINT,
        SignalName::Terminate => libc::SIGTERM,
    }
}

#[cfg(not(unix))]
fn signal_number(name: SignalName) -> i32 {
    match name {
        SignalName::Interrupt => 2,
        SignalName::Terminate => 15,
    }
}

#[cfg(unix)]
const SIGTERM: libc::c_int = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: libc::c_int = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

// ---------------------------------------------------------------------------
// OutputStream
// ---------------------------------------------------------------------------

/// Ordered stream of raw output chunks from a process terminal.
///
/// Ends once the process has closed its side of the terminal or the
/// terminal has been closed. Chunks already queued are still delivered
/// after a close.
pub struct OutputStream {
    rx: flume::Receiver<Vec<u8>>,
    closed: watch::Receiver<bool>,
}

impl OutputStream {
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        if let Ok(chunk) = self.rx.try_recv() {
            return Some(chunk);
        }
        tokio::select! {
            biased;
            chunk = self.rx.recv_async() => chunk.ok(),
            _ = self.closed.wait_for(|closed| *closed) => self.rx.try_recv().ok(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessTerminal
// ---------------------------------------------------------------------------

/// One child process attached to a pseudoterminal.
///
/// A dedicated reader thread drains the master side into a bounded channel
/// and a writer thread feeds queued input back in, so no async task ever
/// blocks on terminal I/O.
pub struct ProcessTerminal {
    id: Uuid,
    pid: Option<u32>,
    group: Option<ProcessGroup>,
    options: PtyOptions,
    input_tx: flume::Sender<Vec<u8>>,
    output_rx: flume::Receiver<Vec<u8>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    exit_code: OnceLock<i32>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl ProcessTerminal {
    /// Start `spec.program` on a fresh pseudoterminal.
    ///
    /// Blocking: opening the terminal and forking happen on the calling
    /// thread, so async callers should go through `spawn_blocking`.
    pub fn spawn(spec: SpawnSpec, options: PtyOptions) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let mut command = CommandBuilder::new(&spec.program);
        command.args(&spec.args);
        command.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| PtyError::Spawn(format!("{}: {e}", spec.program)))?;
        // The reader only sees EOF once every slave handle is gone.
        drop(pair.slave);

        let pid = child.process_id();
        let group = pid.and_then(|pid| i32::try_from(pid).ok()).map(ProcessGroup);
        let id = Uuid::new_v4();
        let short = &id.as_simple().to_string()[..8];

        info!(%id, program = %spec.program, ?pid, cwd = %spec.cwd.display(), "spawned process terminal");

        // -- output reader thread --
        let (read_tx, read_rx) = flume::bounded::<Vec<u8>>(options.output_queue_depth.max(1));
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        std::thread::Builder::new()
            .name(format!("pty-read-{short}"))
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            // Blocks when the consumer falls behind.
                            if read_tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // Linux reports EIO once the slave side is gone.
                            debug!("pty reader finished: {e}");
                            break;
                        }
                    }
                }
            })?;

        // -- input writer thread --
        let (write_tx, write_rx) = flume::bounded::<Vec<u8>>(options.output_queue_depth.max(1));
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        std::thread::Builder::new()
            .name(format!("pty-write-{short}"))
            .spawn(move || {
                while let Ok(data) = write_rx.recv() {
                    for chunk in data.chunks(WRITE_CHUNK) {
                        if let Err(e) = writer.write_all(chunk) {
                            debug!("pty writer finished: {e}");
                            return;
                        }
                    }
                    let _ = writer.flush();
                }
            })?;

        let (closed_tx, _) = watch::channel(false);

        Ok(Self {
            id,
            pid,
            group,
            options,
            input_tx: write_tx,
            output_rx: read_rx,
            child: Mutex::new(child),
            master: Mutex::new(Some(pair.master)),
            exit_code: OnceLock::new(),
            closed: AtomicBool::new(false),
            closed_tx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn process_group(&self) -> Option<ProcessGroup> {
        self.group
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue bytes for the process's input.
    ///
    /// Waits at most the configured write timeout for queue space. Fails
    /// with [`PtyError::Closed`] once the process has exited or the
    /// terminal was closed.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() || self.has_exited() {
            return Err(PtyError::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }
        match tokio::time::timeout(
            self.options.write_timeout,
            self.input_tx.send_async(data.to_vec()),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PtyError::Closed),
            Err(_) => Err(PtyError::Internal(format!(
                "input queue stayed full for {:?}",
                self.options.write_timeout
            ))),
        }
    }

    /// Deliver end-of-input the way Ctrl-D would in canonical mode.
    pub async fn send_eof(&self) -> Result<()> {
        self.write(&[EOT]).await
    }

    /// Subscribe to the process's output.
    ///
    /// Each chunk is delivered to exactly one stream; callers are expected
    /// to keep a single consumer.
    pub fn stream_output(&self) -> OutputStream {
        OutputStream {
            rx: self.output_rx.clone(),
            closed: self.closed_tx.subscribe(),
        }
    }

    /// Apply a new window size. Returns `false` when nothing was applied.
    pub fn resize(&self, rows: u16, cols: u16) -> bool {
        if rows == 0 || cols == 0 {
            return false;
        }
        let master = lock_or_recover(&self.master, "master");
        let Some(master) = master.as_ref() else {
            return false;
        };
        match master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(()) => {
                debug!(id = %self.id, rows, cols, "pty resized");
                true
            }
            Err(e) => {
                warn!(id = %self.id, rows, cols, "pty resize ignored: {e}");
                false
            }
        }
    }

    /// Send a signal to the whole process group.
    pub fn send_signal(&self, name: SignalName) -> Result<()> {
        if self.is_closed() || self.has_exited() {
            return Err(PtyError::Closed);
        }
        let group = self
            .group
            .ok_or_else(|| PtyError::Internal("child has no process id".into()))?;
        group.signal(signal_number(name))?;
        debug!(id = %self.id, pgid = group.id(), signal = %name, "signalled process group");
        Ok(())
    }

    /// Whether the child has exited. Reaps it if it has.
    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Exit code of the child, once it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        if let Some(code) = self.exit_code.get() {
            return Some(*code);
        }
        let mut child = lock_or_recover(&self.child, "child");
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = i32::try_from(status.exit_code()).unwrap_or(i32::MAX);
                Some(*self.exit_code.get_or_init(|| code))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(id = %self.id, "try_wait failed, treating child as gone: {e}");
                Some(*self.exit_code.get_or_init(|| -1))
            }
        }
    }

    /// Poll for the exit code for up to `timeout`.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(code) = self.exit_code() {
                return Some(code);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Terminate the process group and release the terminal.
    ///
    /// Sends `SIGTERM`, waits up to the close grace, then `SIGKILL`s whatever
    /// is left and reaps the child. Idempotent; blocks for at most the grace
    /// period plus a short reap window.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if !self.has_exited() {
            self.signal_group(SIGTERM);
            if !self.poll_exit(self.options.close_grace) {
                warn!(id = %self.id, grace = ?self.options.close_grace, "process ignored SIGTERM, killing group");
                self.signal_group(SIGKILL);
                {
                    let mut child = lock_or_recover(&self.child, "child");
                    let _ = child.kill();
                }
                if !self.poll_exit(REAP_TIMEOUT) {
                    warn!(id = %self.id, "child still not reaped after SIGKILL");
                }
            }
        }

        lock_or_recover(&self.master, "master").take();
        self.closed_tx.send_replace(true);
        info!(id = %self.id, exit_code = ?self.exit_code.get(), "process terminal closed");
    }

    fn signal_group(&self, signal: i32) {
        let Some(group) = self.group else {
            return;
        };
        if let Err(e) = group.signal(signal) {
            // ESRCH just means the group is already gone.
            debug!(id = %self.id, pgid = group.id(), signal, "group signal failed: {e}");
        }
    }

    fn poll_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_exited() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for ProcessTerminal {
    fn drop(&mut self) {
        if !self.is_closed() && !self.has_exited() {
            warn!(id = %self.id, "process terminal dropped without close, killing group");
            self.signal_group(SIGKILL);
            let _ = self.exit_code();
        }
    }
}

impl std::fmt::Debug for ProcessTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTerminal")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("{what} lock was poisoned, recovering");
        e.into_inner()
    })
}
