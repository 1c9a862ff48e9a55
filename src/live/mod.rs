// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Live collection engine
//!
//! A [`LiveMirror`] owns exactly one follow-mode stream per (path, query)
//! and keeps a keyed local copy of the collection coherent with the
//! router's differential packets. Subscribers attach through snapshot
//! pipelines; the first subscription starts the stream, the last detachment
//! stops it and clears the cache.

mod subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::protocol::Row;
use crate::router::StreamHandle;

pub use subscription::{
    diff_snapshots, identity_key, JoinSpec, SnapshotDiff, SnapshotEvent, SnapshotOptions,
    SnapshotSubscription,
};

/// Read access to foreign collections, used by join pipelines. Implemented
/// by the client facade; held weakly so a closed client tears down cleanly.
pub(crate) trait CollectionReader: Send + Sync {
    fn read_collection<'a>(&'a self, path: &'a str) -> BoxFuture<'a, crate::error::Result<Vec<Row>>>;
}

/// Registry of active mirrors, owned by the facade.
pub(crate) type MirrorRegistry = Mutex<HashMap<String, Arc<LiveMirror>>>;

/// Canonical registry key for one (path, query) pair.
#[must_use]
pub(crate) fn mirror_key(path: &str, query: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = query.iter().collect();
    sorted.sort();
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{path}?{query}")
}

/// Preformed follow-mode words for a mirror stream. A configured property
/// list is extended with `.id` and `.dead` so identity and deletion stay
/// observable.
#[must_use]
pub(crate) fn follow_words(path: &str, query: &[(String, String)]) -> Vec<String> {
    let mut words = vec![format!("{path}/print"), "=follow=".to_string()];
    for (key, value) in query {
        if key == ".proplist" {
            let mut props: Vec<&str> = value.split(',').collect();
            for required in [".id", ".dead"] {
                if !props.contains(&required) {
                    props.push(required);
                }
            }
            words.push(format!("=.proplist={}", props.join(",")));
        } else if key.starts_with('?') {
            words.push(format!("{key}={value}"));
        } else {
            words.push(format!("={key}={value}"));
        }
    }
    words
}

/// Keyed local copy of one followed collection.
pub struct LiveMirror {
    key: String,
    entries: Mutex<HashMap<String, Row>>,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<Row>>>>,
    next_subscriber: AtomicU64,
    pump_cancel: CancellationToken,
    reader: Weak<dyn CollectionReader>,
    registry: Weak<MirrorRegistry>,
}

impl LiveMirror {
    pub(crate) fn new(
        key: String,
        reader: Weak<dyn CollectionReader>,
        registry: Weak<MirrorRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            entries: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            pump_cancel: CancellationToken::new(),
            reader,
            registry,
        })
    }

    /// Start pumping the follow stream into this mirror.
    pub(crate) fn start(self: &Arc<Self>, mut stream: StreamHandle) {
        let mirror = self.clone();
        let cancel = self.pump_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = stream.recv() => match maybe {
                        Some(Ok(row)) => mirror.apply_packet(row).await,
                        Some(Err(e)) => {
                            tracing::warn!("Follow stream for {} failed: {}", mirror.key, e);
                        }
                        None => {
                            tracing::debug!("Follow stream for {} ended", mirror.key);
                            break;
                        }
                    },
                    () = cancel.cancelled() => {
                        stream.stop().await;
                        break;
                    }
                }
            }
        });
    }

    /// Apply one inbound packet and broadcast the updated snapshot.
    ///
    /// Identity comes from `.id`, falling back to `name`; packets with
    /// neither are dropped. A truthy `.dead` removes the entry; anything
    /// else merges field-by-field with the leading dot stripped from keys.
    pub(crate) async fn apply_packet(&self, packet: Row) {
        let Some(id) = packet
            .get(".id")
            .or_else(|| packet.get("name"))
            .cloned()
        else {
            tracing::trace!("Dropping follow packet without identity");
            return;
        };

        {
            let mut entries = self.entries.lock().await;
            let dead = packet
                .get(".dead")
                .is_some_and(|v| matches!(v.as_str(), "true" | "yes"));
            if dead {
                entries.remove(&id);
            } else {
                let entry = entries.entry(id).or_default();
                for (key, value) in packet {
                    let key = key.strip_prefix('.').unwrap_or(&key).to_string();
                    entry.insert(key, value);
                }
            }
        }
        self.broadcast().await;
    }

    async fn broadcast(&self) {
        let snapshot = self.snapshot().await;
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|_, sink| sink.send(snapshot.clone()).is_ok());
    }

    pub(crate) async fn snapshot(&self) -> Vec<Row> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub(crate) async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Attach one subscriber. New subscribers receive an immediate replay
    /// of the current snapshot.
    pub(crate) async fn attach(self: &Arc<Self>, options: SnapshotOptions) -> SnapshotSubscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(subscription::pipeline_task(
            input_rx,
            event_tx,
            options,
            self.reader.clone(),
            cancel.clone(),
        ));

        let _ = input_tx.send(self.snapshot().await);
        self.subscribers.lock().await.insert(id, input_tx);

        SnapshotSubscription {
            id,
            mirror: self.clone(),
            events: event_rx,
            cancel,
            stopped: false,
        }
    }

    /// Stop the pump and drop all state. Used when the owning facade
    /// closes; subscribers observe the end of their event streams.
    pub(crate) async fn shutdown(&self) {
        self.pump_cancel.cancel();
        self.entries.lock().await.clear();
        self.subscribers.lock().await.clear();
    }

    /// Detach one subscriber. The last detachment cancels the follow
    /// stream, clears the cache, and removes the mirror from the facade
    /// registry before the subscription releases it.
    pub(crate) async fn detach(&self, id: u64) {
        let remaining = {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.remove(&id);
            subscribers.len()
        };
        if remaining > 0 {
            return;
        }

        tracing::debug!("Last subscriber left {}, stopping follow stream", self.key);
        self.pump_cancel.cancel();
        self.entries.lock().await.clear();
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().await.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    struct NoReader;

    impl CollectionReader for NoReader {
        fn read_collection<'a>(
            &'a self,
            _path: &'a str,
        ) -> BoxFuture<'a, crate::error::Result<Vec<Row>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn detached_mirror() -> Arc<LiveMirror> {
        let reader: Weak<dyn CollectionReader> = Weak::<NoReader>::new();
        LiveMirror::new(mirror_key("/ip/address", &[]), reader, Weak::new())
    }

    #[tokio::test]
    async fn test_packet_merge_and_identity() {
        let mirror = detached_mirror();
        mirror
            .apply_packet(row(&[(".id", "*1"), ("address", "10.0.0.1")]))
            .await;
        mirror
            .apply_packet(row(&[(".id", "*1"), ("comment", "uplink")]))
            .await;

        let snapshot = mirror.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        let entry = &snapshot[0];
        assert_eq!(entry.get("id").map(String::as_str), Some("*1"));
        assert_eq!(entry.get("address").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(entry.get("comment").map(String::as_str), Some("uplink"));
    }

    #[tokio::test]
    async fn test_dead_packet_removes_entry() {
        let mirror = detached_mirror();
        mirror
            .apply_packet(row(&[(".id", "*1"), ("name", "x")]))
            .await;
        mirror
            .apply_packet(row(&[(".id", "*1"), (".dead", "true")]))
            .await;
        assert!(mirror.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_packet_without_identity_dropped() {
        let mirror = detached_mirror();
        mirror.apply_packet(row(&[("address", "10.0.0.1")])).await;
        assert!(mirror.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_name_fallback_identity() {
        let mirror = detached_mirror();
        mirror
            .apply_packet(row(&[("name", "ether1"), ("mtu", "1500")]))
            .await;
        mirror
            .apply_packet(row(&[("name", "ether1"), ("mtu", "9000")]))
            .await;

        let snapshot = mirror.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].get("mtu").map(String::as_str), Some("9000"));
    }

    #[tokio::test]
    async fn test_subscriber_gets_replay_and_updates() {
        let mirror = detached_mirror();
        mirror
            .apply_packet(row(&[(".id", "*1"), ("name", "a")]))
            .await;

        let mut sub = mirror.attach(SnapshotOptions::default()).await;
        match sub.recv().await.unwrap() {
            SnapshotEvent::Snapshot(rows) => assert_eq!(rows.len(), 1),
            SnapshotEvent::Diff(_) => panic!("expected snapshot"),
        }

        mirror
            .apply_packet(row(&[(".id", "*2"), ("name", "b")]))
            .await;
        match sub.recv().await.unwrap() {
            SnapshotEvent::Snapshot(rows) => assert_eq!(rows.len(), 2),
            SnapshotEvent::Diff(_) => panic!("expected snapshot"),
        }
        sub.stop().await;
    }

    #[tokio::test]
    async fn test_last_detach_clears_cache() {
        let mirror = detached_mirror();
        mirror
            .apply_packet(row(&[(".id", "*1"), ("name", "a")]))
            .await;

        let mut first = mirror.attach(SnapshotOptions::default()).await;
        let mut second = mirror.attach(SnapshotOptions::default()).await;
        assert_eq!(mirror.subscriber_count().await, 2);

        first.stop().await;
        assert_eq!(mirror.subscriber_count().await, 1);
        assert!(!mirror.snapshot().await.is_empty());

        second.stop().await;
        assert_eq!(mirror.subscriber_count().await, 0);
        assert!(mirror.snapshot().await.is_empty());
    }

    #[test]
    fn test_follow_words_extend_proplist() {
        let words = follow_words(
            "/ip/address",
            &[
                ("?interface".to_string(), "ether1".to_string()),
                (".proplist".to_string(), "address,interface".to_string()),
            ],
        );
        assert_eq!(words[0], "/ip/address/print");
        assert_eq!(words[1], "=follow=");
        assert!(words.contains(&"?interface=ether1".to_string()));
        assert!(words.contains(&"=.proplist=address,interface,.id,.dead".to_string()));
    }

    #[test]
    fn test_mirror_key_is_canonical() {
        let a = mirror_key(
            "/ip/address",
            &[("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())],
        );
        let b = mirror_key(
            "/ip/address",
            &[("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())],
        );
        assert_eq!(a, b);
    }
}
