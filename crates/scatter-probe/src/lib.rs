//! scatter-probe: egress node for the scatter distributed proxy.
//!
//! A probe accepts forward streams from any hub, dials the requested
//! target over TCP, and relays bytes between the stream and the target.

pub mod config;
pub mod server;
pub mod service;

pub use config::Config;
pub use server::ForwardServer;
pub use service::{ForwardService, NetDialer, TcpDialer, DIAL_TIMEOUT};
