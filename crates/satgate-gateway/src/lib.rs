//! SatGate gateway: the HTTP data plane, admin plane, and everything that
//! turns a compiled route table into decisions and proxied bytes.
//!
//! The token and payment primitives live in the [`satgate`] crate; this crate
//! owns configuration, policy evaluation, metering, and the reverse proxy.

pub mod config;
pub mod cors;
pub mod error;
pub mod meter;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod routes;
pub mod state;

pub use config::{ConfigError, GatewayConfig, Secrets};
pub use error::GatewayError;
pub use meter::Meter;
pub use policy::{decide, Decision, RequestFacts};
pub use state::AppState;
