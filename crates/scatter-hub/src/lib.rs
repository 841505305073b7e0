//! scatter-hub: central coordinator of the scatter distributed proxy.
//!
//! The hub terminates HTTP proxy traffic from clients, picks a probe for
//! each connection round-robin, splices the client socket to a forward
//! stream with accounting, and broadcasts telemetry to subscribers.

pub mod config;
pub mod core;
pub mod http_api;
pub mod probes;
pub mod telemetry_api;

pub use self::config::Config;
pub use self::core::{HubCore, TelemetrySink};
pub use self::http_api::HttpProxy;
pub use self::probes::ProbeClient;
pub use self::telemetry_api::TelemetryServer;
