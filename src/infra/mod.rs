//! Infrastructure - configuration and metrics
//!
//! - `config` - Application configuration (TOML loading, env overrides, validation)
//! - `metrics` - Lock-free metrics collection

pub mod config;
pub mod metrics;

// Re-export commonly used types
pub use config::Config;
pub use metrics::Metrics;
