//! Observability setup for termbridge services.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Tracing**: trace ID generation, per-connection spans, and an axum
//!   middleware that propagates `X-Request-Id`

pub mod logging;
pub mod tracing_setup;
