//! Tollgate Server
//!
//! The HTTP surface of the egress accounting service: the invocation
//! endpoint, receipt lookup, metrics scrape, and the service
//! configuration and startup wiring.

pub mod config;
pub mod methods;
pub mod presets;
pub mod routes;

pub use config::{Config, ConfigError};
pub use routes::{router, AppState};
