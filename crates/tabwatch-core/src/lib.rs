pub mod breaker;
pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod session;

pub use breaker::BreakerState;
pub use config::Config;
pub use errors::IngestError;

/// Target for audit-trail events (`info!(target: AUDIT_TARGET, ...)`).
pub const AUDIT_TARGET: &str = "audit";
