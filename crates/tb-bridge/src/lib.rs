//! Network surface of termbridge.
//!
//! Binds WebSocket connections to persistent sessions and exposes a small
//! HTTP API for observing and closing them.
//!
//! Key modules:
//! - [`session_ws`]: per-connection session handler
//! - [`protocol`]: JSON wire messages
//! - [`http_api`]: Axum router and shared state
//! - [`api_error`]: HTTP error responses

pub mod api_error;
pub mod http_api;
pub mod protocol;
pub mod session_ws;
