// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! High-level router client with hybrid transport routing
//!
//! One client owns a transport backend (binary socket, REST, or REST with a
//! socket side-channel for streams), the stability envelope (circuit
//! breaker, adaptive rate limiter, read cache, offline queue), and the set
//! of live mirrors. Whatever the transport, every successful response is a
//! list of string-valued rows.

mod transaction;

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;

use crate::cache::ReadCache;
use crate::config::{ClientConfig, Protocol};
use crate::error::{Error, Result};
use crate::limits::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
use crate::live::{
    follow_words, mirror_key, CollectionReader, LiveMirror, MirrorRegistry, SnapshotOptions,
    SnapshotSubscription,
};
use crate::protocol::Row;
use crate::queue::{DeferredAction, OfflineQueue};
use crate::router::{Router, StreamHandle, StreamRequest};
use crate::transport::{RestConfig, RestTransport, SocketConfig, SocketTransport};

pub use transaction::Transaction;

/// System identity captured from `/system/resource` on connect.
#[derive(Debug, Clone)]
pub struct SystemResource {
    pub uptime: String,
    pub cpu_load: u64,
    pub free_memory: u64,
    pub total_memory: u64,
    pub version: String,
    pub board_name: String,
}

impl SystemResource {
    pub(crate) fn from_rows(rows: &[Row]) -> Self {
        let first_opt = rows.iter().find(|s| s.contains_key("version"));
        let empty = Row::new();
        let first = first_opt.unwrap_or(&empty);
        Self {
            uptime: first
                .get("uptime")
                .cloned()
                .unwrap_or_else(|| "0s".to_string()),
            cpu_load: first
                .get("cpu-load")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            free_memory: first
                .get("free-memory")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            total_memory: first
                .get("total-memory")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            version: first
                .get("version")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            board_name: first
                .get("board-name")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Options for one write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Recover duplicates on create by querying the existing object back.
    pub idempotent: bool,
    /// Field used for duplicate recovery; defaults to `name`.
    pub idempotency_key: Option<String>,
    /// Defer the write to the offline queue when disconnected.
    pub persistent: bool,
}

/// Result of one write: rows, or the offline-queue sentinel.
#[derive(Debug)]
pub enum WriteOutcome {
    Rows(Vec<Row>),
    QueuedOffline { task_id: u64 },
}

impl WriteOutcome {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::QueuedOffline { .. })
    }

    /// The rows of a dispatched write; empty for a queued one.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::QueuedOffline { .. } => Vec::new(),
        }
    }
}

enum Backend {
    Socket {
        router: Arc<Router>,
    },
    Rest {
        rest: Arc<RestTransport>,
        /// Side-channel reserved exclusively for follow-mode streams.
        stream_router: Option<Arc<Router>>,
    },
}

/// `MikroTik` `RouterOS` administration client.
///
/// Cheap to clone; clones share the connection, cache, and mirrors.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    backend: Mutex<Option<Backend>>,
    breaker: CircuitBreaker,
    limiter: Arc<RateLimiter>,
    cache: ReadCache,
    queue: OfflineQueue,
    mirrors: Arc<MirrorRegistry>,
    system: Mutex<Option<SystemResource>>,
}

impl Client {
    /// Build a client. Environment variables override the given config;
    /// the result is validated before anything connects.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                backend: Mutex::new(None),
                breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
                limiter: Arc::new(RateLimiter::new(RateLimiterConfig::default())),
                cache: ReadCache::new(),
                queue: OfflineQueue::new(),
                mirrors: Arc::new(Mutex::new(HashMap::new())),
                system: Mutex::new(None),
            }),
        })
    }

    /// Connect according to the configured protocol, authenticate, probe
    /// the router identity, and drain any offline queue.
    ///
    /// The whole handshake runs inside the circuit breaker.
    pub async fn connect(&self) -> Result<()> {
        let inner = self.inner.clone();
        self.inner
            .breaker
            .execute(async move { inner.establish().await })
            .await?;
        self.inner.drain_offline_queue().await;
        tracing::info!(
            "Client ready for {} over {:?}",
            self.inner.config.host,
            self.inner.config.protocol
        );
        Ok(())
    }

    /// Close the connection. Pending operations are cancelled; active
    /// mirrors are shut down.
    pub async fn close(&self) {
        self.inner.shutdown().await;
    }

    /// Whether a usable backend is currently attached.
    pub async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    /// Router identity captured during connect.
    pub async fn system_resource(&self) -> Option<SystemResource> {
        self.inner.system.lock().await.clone()
    }

    /// Read-through print of a menu path. Served from the cache when a
    /// fresh entry exists.
    pub async fn read(&self, path: &str, query: &[(String, String)]) -> Result<Vec<Row>> {
        self.inner.read(path, query).await
    }

    /// Execute a command (full path including the action word).
    pub async fn write(&self, command: &str, params: &[(String, String)]) -> Result<Vec<Row>> {
        Ok(self
            .inner
            .write_with(command, params, &WriteOptions::default())
            .await?
            .into_rows())
    }

    /// Execute a command with explicit idempotency/persistence options.
    pub async fn write_with(
        &self,
        command: &str,
        params: &[(String, String)],
        options: &WriteOptions,
    ) -> Result<WriteOutcome> {
        self.inner.write_with(command, params, options).await
    }

    /// Open a follow-mode stream from a command or preformed words.
    pub async fn stream(&self, request: StreamRequest) -> Result<StreamHandle> {
        self.inner.stream(request).await
    }

    /// Handle on one collection path for reads and snapshots.
    #[must_use]
    pub fn collection(&self, path: impl Into<String>) -> CollectionHandle {
        CollectionHandle {
            client: self.clone(),
            path: path.into(),
            query: Vec::new(),
        }
    }

    /// Start a batch of writes executed together.
    #[must_use]
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    /// Number of deferred writes waiting for reconnect.
    pub async fn offline_queue_len(&self) -> usize {
        self.inner.queue.len().await
    }

    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }
}

impl ClientInner {
    async fn establish(&self) -> Result<()> {
        let backend = match self.config.protocol {
            Protocol::Socket => {
                let router = self.connect_router(self.config.socket_port()).await?;
                Backend::Socket { router }
            }
            Protocol::Rest => {
                let rest = Arc::new(RestTransport::new(&RestConfig {
                    host: self.config.host.clone(),
                    port: self.config.rest_port(),
                    username: self.config.username.clone(),
                    password: self.config.password.clone(),
                    accept_invalid_certs: self.config.accept_invalid_certs,
                    timeout: self.config.request_timeout,
                })?);
                let stream_router = match self.config.hybrid_stream_port() {
                    Some(port) => Some(self.connect_router(port).await?),
                    None => None,
                };
                Backend::Rest {
                    rest,
                    stream_router,
                }
            }
        };

        *self.backend.lock().await = Some(backend);

        // Reachability probe doubling as the identity read
        let rows = self.dispatch("/system/resource/print", &[], None).await?;
        *self.system.lock().await = Some(SystemResource::from_rows(&rows));
        Ok(())
    }

    async fn connect_router(&self, port: u16) -> Result<Arc<Router>> {
        let socket_config = SocketConfig {
            host: self.config.host.clone(),
            port,
            tls: self.config.tls_options(),
            connect_timeout: self.config.connect_timeout,
        };
        let (transport, events) = SocketTransport::connect(&socket_config).await?;
        let router = Router::new(transport, events, Some(self.limiter.clone()));
        router
            .login(&self.config.username, &self.config.password)
            .await?;
        Ok(router)
    }

    async fn shutdown(&self) {
        let mirrors: Vec<Arc<LiveMirror>> = {
            let mut registry = self.mirrors.lock().await;
            registry.drain().map(|(_, m)| m).collect()
        };
        for mirror in mirrors {
            mirror.shutdown().await;
        }

        let backend = self.backend.lock().await.take();
        match backend {
            Some(Backend::Socket { router }) => router.close().await,
            Some(Backend::Rest { stream_router, .. }) => {
                if let Some(router) = stream_router {
                    router.close().await;
                }
            }
            None => {}
        }
    }

    async fn is_connected(&self) -> bool {
        match self.backend.lock().await.as_ref() {
            Some(Backend::Socket { router }) => router.is_connected(),
            Some(Backend::Rest { .. }) => true,
            None => false,
        }
    }

    async fn read(&self, path: &str, query: &[(String, String)]) -> Result<Vec<Row>> {
        if let Some(rows) = self.cache.get(&self.config.host, path, query).await {
            tracing::trace!("Cache hit for {}", path);
            return Ok(rows);
        }

        let command = format!("{path}/print");
        let rows = self.guarded_dispatch(&command, query, None).await?;
        self.cache
            .insert(&self.config.host, path, query, rows.clone())
            .await;
        Ok(rows)
    }

    async fn write_with(
        &self,
        command: &str,
        params: &[(String, String)],
        options: &WriteOptions,
    ) -> Result<WriteOutcome> {
        if options.persistent && !self.is_connected().await {
            if let Some((path, action)) = DeferredAction::from_command(command) {
                let task_id = self
                    .queue
                    .push(path.to_string(), action, params.to_vec())
                    .await;
                return Ok(WriteOutcome::QueuedOffline { task_id });
            }
            return Err(Error::ConnectionLost);
        }

        let idempotency_key = options
            .idempotent
            .then(|| options.idempotency_key.as_deref().unwrap_or("name"));
        let rows = self
            .guarded_dispatch(command, params, idempotency_key)
            .await?;

        if let Some((path, _)) = DeferredAction::from_command(command) {
            self.cache.invalidate_prefix(&self.config.host, path).await;
        }
        Ok(WriteOutcome::Rows(rows))
    }

    /// Breaker around limiter around transport.
    async fn guarded_dispatch(
        &self,
        command: &str,
        params: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<Vec<Row>> {
        self.breaker
            .execute(async {
                self.limiter.acquire().await?;
                self.dispatch(command, params, idempotency_key).await
            })
            .await
    }

    async fn dispatch(
        &self,
        command: &str,
        params: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<Vec<Row>> {
        enum Target {
            Router(Arc<Router>),
            Rest(Arc<RestTransport>),
        }
        let target = {
            let backend = self.backend.lock().await;
            match backend.as_ref() {
                Some(Backend::Socket { router }) => Target::Router(router.clone()),
                Some(Backend::Rest { rest, .. }) => Target::Rest(rest.clone()),
                None => return Err(Error::ConnectionLost),
            }
        };
        match target {
            Target::Router(router) => router.submit(command, params).await,
            Target::Rest(rest) => rest.execute(command, params, idempotency_key).await,
        }
    }

    async fn stream(&self, request: StreamRequest) -> Result<StreamHandle> {
        let router = {
            let backend = self.backend.lock().await;
            match backend.as_ref() {
                Some(Backend::Socket { router }) => router.clone(),
                Some(Backend::Rest {
                    stream_router: Some(router),
                    ..
                }) => router.clone(),
                Some(Backend::Rest {
                    stream_router: None,
                    ..
                }) => {
                    return Err(Error::Config(
                        "follow-mode streams need a socket side-channel; \
                         configure a stream port alongside REST"
                            .to_string(),
                    ))
                }
                None => return Err(Error::ConnectionLost),
            }
        };
        router.open_stream(request).await
    }

    /// Replay deferred writes in order. Best-effort: failures are logged
    /// and dropped, later tasks still run.
    async fn drain_offline_queue(&self) {
        let tasks = self.queue.drain().await;
        if tasks.is_empty() {
            return;
        }
        tracing::info!("Draining {} deferred write(s)", tasks.len());
        for task in tasks {
            let command = task.command();
            if let Err(e) = self
                .write_with(&command, &task.params, &WriteOptions::default())
                .await
            {
                tracing::warn!("Deferred write #{} ({}) failed: {}", task.id, command, e);
            }
        }
    }

    async fn on_snapshot(
        self: &Arc<Self>,
        path: &str,
        query: &[(String, String)],
        options: SnapshotOptions,
    ) -> Result<SnapshotSubscription> {
        let key = mirror_key(path, query);
        let mut registry = self.mirrors.lock().await;
        if let Some(mirror) = registry.get(&key) {
            return Ok(mirror.attach(options).await);
        }

        let self_dyn: Arc<dyn CollectionReader> = self.clone();
        let reader: std::sync::Weak<dyn CollectionReader> = Arc::downgrade(&self_dyn);
        let mirror = LiveMirror::new(key.clone(), reader, Arc::downgrade(&self.mirrors));
        let handle = self
            .stream(StreamRequest::Words(follow_words(path, query)))
            .await?;
        mirror.start(handle);
        registry.insert(key, mirror.clone());
        Ok(mirror.attach(options).await)
    }
}

impl CollectionReader for ClientInner {
    fn read_collection<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<Row>>> {
        Box::pin(self.read(path, &[]))
    }
}

/// Fluent handle on one menu path.
pub struct CollectionHandle {
    client: Client,
    path: String,
    query: Vec<(String, String)>,
}

impl CollectionHandle {
    /// Add a query predicate (`?field=value`).
    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((format!("?{}", field.into()), value.into()));
        self
    }

    /// Limit the properties the router sends.
    #[must_use]
    pub fn proplist(mut self, fields: &[&str]) -> Self {
        self.query
            .push((".proplist".to_string(), fields.join(",")));
        self
    }

    /// One-shot read through the cache.
    pub async fn print(&self) -> Result<Vec<Row>> {
        self.client.inner().read(&self.path, &self.query).await
    }

    /// Attach to the live mirror of this collection, starting its follow
    /// stream when this is the first subscription.
    pub async fn on_snapshot(&self, options: SnapshotOptions) -> Result<SnapshotSubscription> {
        self.client
            .inner()
            .on_snapshot(&self.path, &self.query, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_resource_from_rows() {
        let mut row = Row::new();
        row.insert("version".to_string(), "7.10".to_string());
        row.insert("uptime".to_string(), "1w2d3h4m5s".to_string());
        row.insert("cpu-load".to_string(), "25".to_string());
        row.insert("free-memory".to_string(), "524288000".to_string());
        row.insert("total-memory".to_string(), "1073741824".to_string());
        row.insert("board-name".to_string(), "RB5009".to_string());

        let system = SystemResource::from_rows(&[row]);
        assert_eq!(system.version, "7.10");
        assert_eq!(system.cpu_load, 25);
        assert_eq!(system.board_name, "RB5009");
    }

    #[test]
    fn test_system_resource_defaults_on_empty() {
        let system = SystemResource::from_rows(&[]);
        assert_eq!(system.version, "unknown");
        assert_eq!(system.uptime, "0s");
        assert_eq!(system.cpu_load, 0);
    }

    #[test]
    fn test_insecure_config_refused_at_construction() {
        let config = ClientConfig::new("192.168.88.1", "admin", "hardcoded");
        assert!(Client::new(config).is_err());
    }

    #[tokio::test]
    async fn test_write_outcome_rows() {
        let outcome = WriteOutcome::Rows(vec![Row::new()]);
        assert!(!outcome.is_queued());
        assert_eq!(outcome.into_rows().len(), 1);

        let queued = WriteOutcome::QueuedOffline { task_id: 1 };
        assert!(queued.is_queued());
        assert!(queued.into_rows().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_write_queues_when_disconnected() {
        let mut config = ClientConfig::new("192.168.88.1", "admin", "");
        config.allow_insecure = true;
        let client = Client::new(config).unwrap();

        let outcome = client
            .write_with(
                "/ip/address/add",
                &[("address".to_string(), "10.0.0.1/24".to_string())],
                &WriteOptions {
                    persistent: true,
                    ..WriteOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.is_queued());
        assert_eq!(client.offline_queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_non_persistent_write_fails_when_disconnected() {
        let mut config = ClientConfig::new("192.168.88.1", "admin", "");
        config.allow_insecure = true;
        let client = Client::new(config).unwrap();

        let err = client.write("/ip/address/add", &[]).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost));
    }
}
