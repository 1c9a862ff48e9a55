// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Prelude module for convenient imports
//!
//! This module re-exports commonly used types and traits for convenient use.
//! Users of the library can import everything they need with:
//!
//! ```rust
//! use mikrotik_admin::prelude::*;
//! ```

// Core types
pub use crate::config::{ClientConfig, Protocol};
pub use crate::error::{Error, Result};

// Client surface
pub use crate::client::{
    Client, CollectionHandle, SystemResource, Transaction, WriteOptions, WriteOutcome,
};

// Streaming and live collections
pub use crate::live::{
    JoinSpec, SnapshotDiff, SnapshotEvent, SnapshotOptions, SnapshotSubscription,
};
pub use crate::router::{StreamHandle, StreamRequest};

// Multi-router fan-out
pub use crate::pool::ConnectionPool;
pub use crate::swarm::{Swarm, SwarmOutcome};

// Row helpers
pub use crate::parse::{parse_row, parse_rows, parse_value};
pub use crate::protocol::Row;
pub use crate::rows::{group_by, index_by, paginate, sort_by};
