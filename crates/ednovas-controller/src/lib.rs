//! Control-plane client for the EdNovas proxy core.
//!
//! The proxy core is a Clash-compatible engine that exposes a local REST and
//! WebSocket API on `127.0.0.1:<port>`. This crate waits for that API to come
//! up after a spawn and then queries and mutates the core's runtime state:
//! outbound mode, selector groups, node latency and live traffic.

pub mod client;
pub mod error;
mod latency;
mod traffic;
pub mod types;

pub use client::{
    order_groups, place_global, ControlClient, LatencyPolicy, ReadyPolicy, GLOBAL_GROUP,
    SENTINEL_NODES,
};
pub use error::{ControlError, Result};
pub use types::{Latency, Mode, ProxyGroup, Traffic, VersionInfo};
