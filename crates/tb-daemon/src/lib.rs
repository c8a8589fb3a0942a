//! Daemon wiring for termbridge.
//!
//! Turns a loaded [`tb_core::config::Config`] into a running server: the
//! session registry, its idle sweeper, and the HTTP/WebSocket router, all
//! stopped together by one shutdown signal.

pub mod daemon;
pub mod environment;
