// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Parallel fan-out across a fleet of routers
//!
//! A swarm holds independently connected clients under node identifiers and
//! runs the same command on many of them concurrently. One node failing
//! never cancels the others; fan-out itself never fails, it reports
//! per-node outcomes.

use std::collections::HashMap;

use futures_util::future::join_all;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::protocol::Row;

/// What happened on one node.
#[derive(Debug)]
pub struct SwarmOutcome {
    pub node_id: String,
    pub result: Result<Vec<Row>>,
}

impl SwarmOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Default)]
pub struct Swarm {
    nodes: HashMap<String, Client>,
}

impl Swarm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under a node id. Duplicate ids are refused so
    /// outcomes stay attributable.
    pub fn add_node(&mut self, node_id: impl Into<String>, client: Client) -> Result<()> {
        let node_id = node_id.into();
        if self.nodes.contains_key(&node_id) {
            return Err(Error::Config(format!(
                "duplicate swarm node id {node_id:?}"
            )));
        }
        self.nodes.insert(node_id, client);
        Ok(())
    }

    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&Client> {
        self.nodes.get(node_id)
    }

    #[must_use]
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Connect every node concurrently, reporting per-node outcomes.
    pub async fn connect_all(&self) -> Vec<SwarmOutcome> {
        join_all(self.nodes.iter().map(|(node_id, client)| async move {
            SwarmOutcome {
                node_id: node_id.clone(),
                result: client.connect().await.map(|()| Vec::new()),
            }
        }))
        .await
    }

    /// Run one command on every node.
    pub async fn broadcast(
        &self,
        command: &str,
        params: &[(String, String)],
    ) -> Vec<SwarmOutcome> {
        let node_ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        self.fan_out(&node_ids, command, params).await
    }

    /// Run one command on the named nodes. Unknown ids produce failed
    /// outcomes rather than being skipped silently.
    pub async fn multicast(
        &self,
        node_ids: &[&str],
        command: &str,
        params: &[(String, String)],
    ) -> Vec<SwarmOutcome> {
        self.fan_out(node_ids, command, params).await
    }

    async fn fan_out(
        &self,
        node_ids: &[&str],
        command: &str,
        params: &[(String, String)],
    ) -> Vec<SwarmOutcome> {
        join_all(node_ids.iter().map(|node_id| async move {
            let result = match self.nodes.get(*node_id) {
                Some(client) => client.write(command, params).await,
                None => Err(Error::Config(format!("unknown swarm node {node_id:?}"))),
            };
            if let Err(e) = &result {
                tracing::warn!("Swarm node {} failed {}: {}", node_id, command, e);
            }
            SwarmOutcome {
                node_id: (*node_id).to_string(),
                result,
            }
        }))
        .await
    }
}
