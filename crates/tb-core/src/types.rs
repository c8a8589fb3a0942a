use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SignalName
// ---------------------------------------------------------------------------

/// Signals a client may deliver to a session's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalName {
    /// `SIGINT`, what Ctrl-C would deliver through the line discipline.
    Interrupt,
    /// `SIGTERM`.
    Terminate,
}

impl SignalName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalName::Interrupt => "interrupt",
            SignalName::Terminate => "terminate",
        }
    }
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CloseReason
// ---------------------------------------------------------------------------

/// Why a session (or a connection's binding to it) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `close()` was called on the registry.
    Explicit,
    /// No input or output for longer than the idle timeout.
    IdleTimeout,
    /// The child process exited and the session was reaped.
    Exited,
    /// Another connection bound to the same session.
    Evicted,
    /// The connection could not keep up with the output rate.
    Lagged,
    /// The registry is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Explicit => "explicit",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Exited => "exited",
            CloseReason::Evicted => "evicted",
            CloseReason::Lagged => "lagged",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Whether this reason ends the session itself, not just one binding.
    pub fn ends_session(&self) -> bool {
        !matches!(self, CloseReason::Evicted | CloseReason::Lagged)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SessionSummary
// ---------------------------------------------------------------------------

/// Read-only view of a live session, exposed for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub logical_key: String,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub buffer_bytes: usize,
    pub attached: bool,
    pub pid: Option<u32>,
}
