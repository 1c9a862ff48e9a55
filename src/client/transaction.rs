// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Batched writes
//!
//! A transaction collects commands and runs them either sequentially with
//! stop-on-error, or concurrently. This is batching, not atomicity:
//! commands that completed before a failure stay applied.

use futures_util::future::join_all;

use crate::error::Result;
use crate::protocol::Row;

use super::Client;

type Op = (String, Vec<(String, String)>);

pub struct Transaction {
    client: Client,
    ops: Vec<Op>,
}

impl Transaction {
    pub(super) fn new(client: Client) -> Self {
        Self {
            client,
            ops: Vec::new(),
        }
    }

    /// Append one command to the batch.
    #[must_use]
    pub fn op(mut self, command: impl Into<String>, params: Vec<(String, String)>) -> Self {
        self.ops.push((command.into(), params));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Run commands in order, stopping at the first failure.
    pub async fn run_sequential(self) -> Result<Vec<Vec<Row>>> {
        let mut results = Vec::with_capacity(self.ops.len());
        for (command, params) in &self.ops {
            match self.client.write(command, params).await {
                Ok(rows) => results.push(rows),
                Err(e) => {
                    tracing::warn!(
                        "Transaction stopped at {} after {} completed op(s): {}",
                        command,
                        results.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    /// Run all commands concurrently. Every command executes; the first
    /// error (in batch order) is returned once all have settled.
    pub async fn run_parallel(self) -> Result<Vec<Vec<Row>>> {
        let client = self.client.clone();
        let outcomes = join_all(self.ops.iter().map(|(command, params)| {
            let client = client.clone();
            async move { client.write(command, params).await }
        }))
        .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            results.push(outcome?);
        }
        Ok(results)
    }
}
