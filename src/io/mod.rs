//! IO modules - external system interfaces
//!
//! - `mission_stream` - websocket client for completed-mission events
//! - `influx` - InfluxDB v2 HTTP adapter (aggregate queries, classification writes)
//! - `http` - health and Prometheus metrics endpoint

pub mod http;
pub mod influx;
pub mod mission_stream;

// Re-export commonly used types
pub use http::start_http_server;
pub use influx::InfluxClient;
pub use mission_stream::{ConnectionState, MissionStream, ReconnectPolicy};
