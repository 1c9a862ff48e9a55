// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Short-TTL read cache with path-prefix invalidation
//!
//! Entries are keyed by host, command path, and the canonicalized parameter
//! map. Any successful write to a path evicts every entry under that path
//! prefix on the same host.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::protocol::Row;

/// How long a cached read stays servable.
pub const READ_TTL: Duration = Duration::from_secs(5);

/// Chance that a read also sweeps expired entries.
const PRUNE_PROBABILITY: f64 = 0.05;

struct CacheEntry {
    rows: Vec<Row>,
    expires: Instant,
}

/// TTL map shared by every caller of a facade.
#[derive(Clone, Default)]
pub struct ReadCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl ReadCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable key: host, path, then parameters sorted by key.
    fn key(host: &str, path: &str, params: &[(String, String)]) -> String {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();
        let query = sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{host}\u{1f}{path}\u{1f}{query}")
    }

    fn prefix(host: &str, path: &str) -> String {
        format!("{host}\u{1f}{path}")
    }

    /// Look up a fresh entry, returning a logical copy of its rows.
    pub async fn get(&self, host: &str, path: &str, params: &[(String, String)]) -> Option<Vec<Row>> {
        if rand::random::<f64>() < PRUNE_PROBABILITY {
            self.prune().await;
        }
        let key = Self::key(host, path, params);
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        Some(entry.rows.clone())
    }

    pub async fn insert(&self, host: &str, path: &str, params: &[(String, String)], rows: Vec<Row>) {
        let key = Self::key(host, path, params);
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CacheEntry {
                rows,
                expires: Instant::now() + READ_TTL,
            },
        );
    }

    /// Evict every entry whose key begins with (host, path).
    pub async fn invalidate_prefix(&self, host: &str, path: &str) {
        let prefix = Self::prefix(host, path);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(&prefix));
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} cached read(s) under {}", evicted, path);
        }
    }

    async fn prune(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires > now);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
