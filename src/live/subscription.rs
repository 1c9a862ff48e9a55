// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Per-subscriber snapshot pipeline: throttle, join, diff
//!
//! Every subscription runs its own pump task fed by the live mirror. The
//! throttle gates emissions on both edges: the first update after an idle
//! window fires immediately, a burst is coalesced into the latest value and
//! delivered when the window elapses. Joins read the foreign collection once
//! per emission. Diff mode compares against the previously emitted snapshot
//! and stays silent when nothing changed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::Row;

use super::{CollectionReader, LiveMirror};

/// Join configuration: attach the foreign row whose `foreign_field` equals
/// the local row's `local_field` under `attribute`.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub path: String,
    pub local_field: String,
    pub foreign_field: String,
    pub attribute: String,
}

/// Pipeline configuration for one subscription.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    /// Emit only differential updates.
    pub diff: bool,
    /// Minimum interval between emissions; zero disables throttling.
    pub throttle: Duration,
    pub join: Option<JoinSpec>,
}

/// Differential update between two snapshots.
#[derive(Debug, Clone, Default)]
pub struct SnapshotDiff {
    pub added: Vec<Row>,
    pub modified: Vec<Row>,
    pub removed: Vec<Row>,
    pub current: Vec<Row>,
}

impl SnapshotDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// One pipeline emission.
#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    Snapshot(Vec<Row>),
    Diff(SnapshotDiff),
}

/// Handle to one attached subscriber.
///
/// Dropping the handle without [`stop`](Self::stop) leaves the mirror
/// attached until the receiver closes; call `stop` to detach promptly and
/// let the mirror reference-count down.
pub struct SnapshotSubscription {
    pub(super) id: u64,
    pub(super) mirror: Arc<LiveMirror>,
    pub(super) events: mpsc::UnboundedReceiver<SnapshotEvent>,
    pub(super) cancel: CancellationToken,
    pub(super) stopped: bool,
}

impl SnapshotSubscription {
    /// Next emission, or `None` after the pipeline has shut down.
    pub async fn recv(&mut self) -> Option<SnapshotEvent> {
        self.events.recv().await
    }

    /// Detach from the mirror. Idempotent. The last detachment stops the
    /// underlying follow stream and clears the mirror cache.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel.cancel();
        self.mirror.detach(self.id).await;
    }
}

/// Identity key for diff purposes: `.id`, falling back to the name, with
/// the full serialized row as a last resort. Mirror rows have the leading
/// dot already stripped, so plain `id` counts too.
#[must_use]
pub fn identity_key(row: &Row) -> String {
    if let Some(id) = row.get(".id").or_else(|| row.get("id")) {
        return id.clone();
    }
    if let Some(name) = row.get("name") {
        return format!("name:{name}");
    }
    serialize_row(row)
}

/// Stable serialization for structural comparison.
fn serialize_row(row: &Row) -> String {
    let sorted: BTreeMap<&String, &String> = row.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

/// Compare two snapshots by identity key.
#[must_use]
pub fn diff_snapshots(previous: &[Row], current: &[Row]) -> SnapshotDiff {
    let mut diff = SnapshotDiff {
        current: current.to_vec(),
        ..SnapshotDiff::default()
    };
    let previous_by_id: HashMap<String, &Row> =
        previous.iter().map(|r| (identity_key(r), r)).collect();
    let mut seen = std::collections::HashSet::new();

    for row in current {
        let key = identity_key(row);
        seen.insert(key.clone());
        match previous_by_id.get(&key) {
            None => diff.added.push(row.clone()),
            Some(old) if serialize_row(old) != serialize_row(row) => {
                diff.modified.push(row.clone());
            }
            Some(_) => {}
        }
    }
    for row in previous {
        if !seen.contains(&identity_key(row)) {
            diff.removed.push(row.clone());
        }
    }
    diff
}

/// Run one subscription's pipeline until the mirror input closes or the
/// subscription is cancelled.
pub(super) async fn pipeline_task(
    mut input: mpsc::UnboundedReceiver<Vec<Row>>,
    output: mpsc::UnboundedSender<SnapshotEvent>,
    options: SnapshotOptions,
    reader: std::sync::Weak<dyn CollectionReader>,
    cancel: CancellationToken,
) {
    let mut state = PipelineState {
        output,
        options,
        reader,
        previous: None,
        join_warned: false,
    };
    let mut last_emit: Option<Instant> = None;
    let mut pending: Option<Vec<Row>> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            maybe = input.recv() => {
                let Some(rows) = maybe else { break };
                if state.options.throttle.is_zero() {
                    state.emit(rows).await;
                    continue;
                }
                let now = Instant::now();
                match last_emit {
                    Some(at) if now.duration_since(at) < state.options.throttle => {
                        // Within the window: keep only the latest value
                        pending = Some(rows);
                        if deadline.is_none() {
                            deadline = Some(at + state.options.throttle);
                        }
                    }
                    _ => {
                        state.emit(rows).await;
                        last_emit = Some(now);
                    }
                }
            }
            () = sleep_until_opt(deadline), if deadline.is_some() => {
                deadline = None;
                if let Some(rows) = pending.take() {
                    state.emit(rows).await;
                    last_emit = Some(Instant::now());
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct PipelineState {
    output: mpsc::UnboundedSender<SnapshotEvent>,
    options: SnapshotOptions,
    reader: std::sync::Weak<dyn CollectionReader>,
    /// Reference snapshot for diffing, refreshed on every emission so that
    /// enabling diff later starts from an accurate baseline.
    previous: Option<Vec<Row>>,
    join_warned: bool,
}

impl PipelineState {
    async fn emit(&mut self, rows: Vec<Row>) {
        let join_spec = self.options.join.clone();
        let rows = match join_spec {
            Some(spec) => self.join(rows, &spec).await,
            None => rows,
        };

        if self.options.diff {
            let diff = diff_snapshots(self.previous.as_deref().unwrap_or(&[]), &rows);
            self.previous = Some(rows);
            if !diff.is_empty() {
                let _ = self.output.send(SnapshotEvent::Diff(diff));
            }
        } else {
            self.previous = Some(rows.clone());
            let _ = self.output.send(SnapshotEvent::Snapshot(rows));
        }
    }

    /// Left join: unmatched local rows get a `null` attachment. A failing
    /// foreign read falls back to the un-joined rows and logs once.
    async fn join(&mut self, rows: Vec<Row>, spec: &JoinSpec) -> Vec<Row> {
        let Some(reader) = self.reader.upgrade() else {
            return rows;
        };
        let foreign = match reader.read_collection(&spec.path).await {
            Ok(foreign) => foreign,
            Err(e) => {
                if !self.join_warned {
                    tracing::warn!("Join read of {} failed: {}", spec.path, e);
                    self.join_warned = true;
                }
                return rows;
            }
        };

        let by_field: HashMap<&String, &Row> = foreign
            .iter()
            .filter_map(|row| row.get(&spec.foreign_field).map(|v| (v, row)))
            .collect();

        rows.into_iter()
            .map(|mut row| {
                let attached = row
                    .get(&spec.local_field)
                    .and_then(|v| by_field.get(v).copied())
                    .map_or_else(|| "null".to_string(), serialize_row);
                row.insert(spec.attribute.clone(), attached);
                row
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    struct NoReader;

    fn no_reader() -> Weak<dyn CollectionReader> {
        Weak::<NoReader>::new()
    }

    impl CollectionReader for NoReader {
        fn read_collection<'a>(
            &'a self,
            _path: &'a str,
        ) -> futures_util::future::BoxFuture<'a, crate::error::Result<Vec<Row>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    struct FixedReader(Vec<Row>);

    impl CollectionReader for FixedReader {
        fn read_collection<'a>(
            &'a self,
            _path: &'a str,
        ) -> futures_util::future::BoxFuture<'a, crate::error::Result<Vec<Row>>> {
            let rows = self.0.clone();
            Box::pin(async move { Ok(rows) })
        }
    }

    struct Pipeline {
        input: mpsc::UnboundedSender<Vec<Row>>,
        output: mpsc::UnboundedReceiver<SnapshotEvent>,
        cancel: CancellationToken,
    }

    fn spawn_pipeline(options: SnapshotOptions, reader: Weak<dyn CollectionReader>) -> Pipeline {
        let (input, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(pipeline_task(
            input_rx,
            output_tx,
            options,
            reader,
            cancel.clone(),
        ));
        Pipeline {
            input,
            output,
            cancel,
        }
    }

    fn snapshot_of(event: SnapshotEvent) -> Vec<Row> {
        match event {
            SnapshotEvent::Snapshot(rows) => rows,
            SnapshotEvent::Diff(_) => panic!("expected full snapshot"),
        }
    }

    #[tokio::test]
    async fn test_throttle_leading_and_trailing_edge() {
        let mut pipeline = spawn_pipeline(
            SnapshotOptions {
                throttle: Duration::from_millis(100),
                ..SnapshotOptions::default()
            },
            no_reader(),
        );
        let start = std::time::Instant::now();

        // Burst at t=0, t=30, t=60, then silence
        pipeline.input.send(vec![row(&[("id", "*1"), ("v", "0")])]).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pipeline.input.send(vec![row(&[("id", "*1"), ("v", "1")])]).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pipeline.input.send(vec![row(&[("id", "*1"), ("v", "2")])]).unwrap();

        // Leading edge: v0 fires immediately
        let first = snapshot_of(pipeline.output.recv().await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(90));
        assert_eq!(first[0].get("v").map(String::as_str), Some("0"));

        // Trailing edge at ~100ms delivers the latest buffered value, v2
        let second = snapshot_of(pipeline.output.recv().await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(95));
        assert_eq!(second[0].get("v").map(String::as_str), Some("2"));

        // v1 was coalesced away: nothing further arrives
        let extra =
            tokio::time::timeout(Duration::from_millis(150), pipeline.output.recv()).await;
        assert!(extra.is_err());
        pipeline.cancel.cancel();
    }

    #[tokio::test]
    async fn test_zero_throttle_emits_everything() {
        let mut pipeline = spawn_pipeline(
            SnapshotOptions::default(),
            no_reader(),
        );
        for v in ["0", "1", "2"] {
            pipeline.input.send(vec![row(&[("id", "*1"), ("v", v)])]).unwrap();
        }
        for v in ["0", "1", "2"] {
            let rows = snapshot_of(pipeline.output.recv().await.unwrap());
            assert_eq!(rows[0].get("v").map(String::as_str), Some(v));
        }
        pipeline.cancel.cancel();
    }

    #[tokio::test]
    async fn test_diff_mode_stays_silent_without_changes() {
        let mut pipeline = spawn_pipeline(
            SnapshotOptions {
                diff: true,
                ..SnapshotOptions::default()
            },
            no_reader(),
        );

        let snapshot = vec![row(&[("id", "*1"), ("v", "a")])];
        pipeline.input.send(snapshot.clone()).unwrap();
        match pipeline.output.recv().await.unwrap() {
            SnapshotEvent::Diff(diff) => {
                assert_eq!(diff.added.len(), 1);
                assert!(diff.modified.is_empty());
            }
            SnapshotEvent::Snapshot(_) => panic!("expected diff"),
        }

        // Identical snapshot: no emission
        pipeline.input.send(snapshot).unwrap();
        pipeline.input.send(vec![row(&[("id", "*1"), ("v", "b")])]).unwrap();
        match pipeline.output.recv().await.unwrap() {
            SnapshotEvent::Diff(diff) => {
                assert!(diff.added.is_empty());
                assert_eq!(diff.modified.len(), 1);
                assert_eq!(
                    diff.modified[0].get("v").map(String::as_str),
                    Some("b")
                );
            }
            SnapshotEvent::Snapshot(_) => panic!("expected diff"),
        }
        pipeline.cancel.cancel();
    }

    #[tokio::test]
    async fn test_join_attaches_foreign_rows() {
        let reader: std::sync::Arc<dyn CollectionReader> = std::sync::Arc::new(FixedReader(vec![
            row(&[("name", "ether1"), ("mtu", "1500")]),
        ]));
        let mut pipeline = spawn_pipeline(
            SnapshotOptions {
                join: Some(JoinSpec {
                    path: "/interface".to_string(),
                    local_field: "interface".to_string(),
                    foreign_field: "name".to_string(),
                    attribute: "interfaceDetail".to_string(),
                }),
                ..SnapshotOptions::default()
            },
            std::sync::Arc::downgrade(&reader),
        );

        pipeline
            .input
            .send(vec![
                row(&[("id", "*1"), ("interface", "ether1")]),
                row(&[("id", "*2"), ("interface", "ether9")]),
            ])
            .unwrap();

        let rows = snapshot_of(pipeline.output.recv().await.unwrap());
        let matched = rows.iter().find(|r| r.get("id").map(String::as_str) == Some("*1")).unwrap();
        assert!(matched
            .get("interfaceDetail")
            .unwrap()
            .contains("\"mtu\":\"1500\""));
        let unmatched = rows.iter().find(|r| r.get("id").map(String::as_str) == Some("*2")).unwrap();
        assert_eq!(unmatched.get("interfaceDetail").map(String::as_str), Some("null"));
        pipeline.cancel.cancel();
    }

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_identity_prefers_id() {
        assert_eq!(identity_key(&row(&[(".id", "*1"), ("name", "x")])), "*1");
        assert_eq!(identity_key(&row(&[("id", "*2"), ("name", "x")])), "*2");
        assert_eq!(identity_key(&row(&[("name", "x")])), "name:x");
    }

    #[test]
    fn test_diff_added_modified_removed() {
        let previous = vec![
            row(&[("id", "*1"), ("address", "10.0.0.1")]),
            row(&[("id", "*2"), ("address", "10.0.0.2")]),
        ];
        let current = vec![
            row(&[("id", "*1"), ("address", "10.0.0.99")]),
            row(&[("id", "*3"), ("address", "10.0.0.3")]),
        ];

        let diff = diff_snapshots(&previous, &current);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].get("id").map(String::as_str), Some("*3"));
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(
            diff.modified[0].get("address").map(String::as_str),
            Some("10.0.0.99")
        );
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].get("id").map(String::as_str), Some("*2"));
        assert_eq!(diff.current.len(), 2);
    }

    #[test]
    fn test_diff_empty_when_unchanged() {
        let snapshot = vec![row(&[("id", "*1"), ("address", "10.0.0.1")])];
        let diff = diff_snapshots(&snapshot, &snapshot.clone());
        assert!(diff.is_empty());
    }

    #[test]
    fn test_diff_applying_changes_reproduces_current() {
        let previous = vec![
            row(&[("id", "*1"), ("v", "a")]),
            row(&[("id", "*2"), ("v", "b")]),
        ];
        let current = vec![
            row(&[("id", "*2"), ("v", "b2")]),
            row(&[("id", "*4"), ("v", "d")]),
        ];
        let diff = diff_snapshots(&previous, &current);

        // previous - removed + added, with modified replacing by identity
        let mut reconstructed: HashMap<String, Row> = previous
            .iter()
            .map(|r| (identity_key(r), r.clone()))
            .collect();
        for r in &diff.removed {
            reconstructed.remove(&identity_key(r));
        }
        for r in diff.added.iter().chain(diff.modified.iter()) {
            reconstructed.insert(identity_key(r), r.clone());
        }
        let expected: HashMap<String, Row> = current
            .iter()
            .map(|r| (identity_key(r), r.clone()))
            .collect();
        assert_eq!(reconstructed, expected);
    }
}
