// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Round-robin pool of identically configured clients
//!
//! Spreads independent operations across several connections to one router.
//! Streams stay bound to the client that scheduled them.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::join_all;

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::Row;

pub struct ConnectionPool {
    clients: Vec<Client>,
    next: AtomicUsize,
}

impl ConnectionPool {
    /// Build `size` clients from one configuration.
    pub fn new(config: &ClientConfig, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("pool size must be at least 1".to_string()));
        }
        let clients = (0..size)
            .map(|_| Client::new(config.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    /// Connect every pooled client concurrently; all must succeed.
    pub async fn connect(&self) -> Result<()> {
        let results = join_all(self.clients.iter().map(Client::connect)).await;
        for (index, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                tracing::error!("Pool member {} failed to connect: {}", index, e);
                return Err(e);
            }
        }
        tracing::info!("Connection pool of {} ready", self.clients.len());
        Ok(())
    }

    /// The next client in round-robin order.
    #[must_use]
    pub fn scheduled_client(&self) -> &Client {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[index]
    }

    /// Read on one scheduled client.
    pub async fn read(&self, path: &str, query: &[(String, String)]) -> Result<Vec<Row>> {
        self.scheduled_client().read(path, query).await
    }

    /// Write on one scheduled client.
    pub async fn write(&self, command: &str, params: &[(String, String)]) -> Result<Vec<Row>> {
        self.scheduled_client().write(command, params).await
    }

    pub async fn close(&self) {
        join_all(self.clients.iter().map(Client::close)).await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
