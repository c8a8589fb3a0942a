//! Persistent PTY sessions for termbridge.
//!
//! A session wraps one child process attached to a pseudoterminal and
//! outlives any single client connection: output keeps flowing into a
//! bounded replay buffer while nobody is attached, and a reconnecting client
//! is caught up from it.
//!
//! Key components:
//! - [`pty`]: process terminal: spawn, write, output stream, resize,
//!   process-group signals, close
//! - [`validator`]: size and control-sequence checks on client input
//! - [`replay`]: FIFO-evicting replay buffer
//! - [`session`]: one live session and its connection binding
//! - [`registry`]: keyed session table with idle sweeping
//! - [`spawn`]: resolves a logical key to the command to spawn

pub mod pty;
pub mod registry;
pub mod replay;
pub mod session;
pub mod spawn;
pub mod validator;
