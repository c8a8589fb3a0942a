//! Shared foundations for termbridge.
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`shutdown`]: cooperative shutdown signal shared by background loops
//! - [`types`]: plain data types shared between the session and bridge crates

pub mod config;
pub mod shutdown;
pub mod types;
