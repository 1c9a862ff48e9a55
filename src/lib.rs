//! mikrotik-admin - hybrid client library for MikroTik RouterOS devices
//!
//! Speaks both the legacy binary API (length-prefixed sentences over
//! TCP/TLS, multiplexed by tags) and the modern REST interface behind one
//! uniform surface. On top of transport it layers live collection mirrors
//! with diff/throttle/join pipelines, an adaptive rate limiter, a circuit
//! breaker, a short-TTL read cache, an offline queue, and multi-router
//! fan-out (pool and swarm).

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod limits;
pub mod live;
pub mod parse;
pub mod pool;
pub mod prelude;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod rows;
pub mod swarm;
pub mod transport;

// Re-export commonly used types
pub use client::{Client, SystemResource, WriteOptions, WriteOutcome};
pub use config::{ClientConfig, Protocol};
pub use error::{Error, Result};
