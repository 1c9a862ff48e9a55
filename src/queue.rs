// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! In-memory offline queue for deferred writes
//!
//! Commands marked persistent are appended here when the underlying
//! connection is down and drained in order on reconnect. Drain is
//! best-effort, not transactional, and nothing survives a process restart.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

/// Mutating actions that may be deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredAction {
    Add,
    Set,
    Remove,
}

impl DeferredAction {
    /// Split a command into its menu path and deferrable action, if the
    /// trailing word is one of `add`/`set`/`remove`.
    #[must_use]
    pub fn from_command(command: &str) -> Option<(&str, Self)> {
        let (path, action) = command.rsplit_once('/')?;
        let action = match action {
            "add" => Self::Add,
            "set" => Self::Set,
            "remove" => Self::Remove,
            _ => return None,
        };
        Some((path, action))
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Set => "set",
            Self::Remove => "remove",
        }
    }
}

/// A write waiting for the connection to come back.
#[derive(Debug, Clone)]
pub struct DeferredTask {
    pub id: u64,
    /// Menu path, without the action word.
    pub path: String,
    pub action: DeferredAction,
    pub params: Vec<(String, String)>,
    pub queued_at: Instant,
}

impl DeferredTask {
    /// Rebuild the full command word.
    #[must_use]
    pub fn command(&self) -> String {
        format!("{}/{}", self.path, self.action.as_str())
    }
}

#[derive(Default)]
struct QueueInner {
    next_id: u64,
    tasks: Vec<DeferredTask>,
}

/// Per-facade deferred-command store.
///
/// Instance state rather than a process-wide singleton: deferral depends on
/// which router is offline.
#[derive(Clone, Default)]
pub struct OfflineQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl OfflineQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task, returning its queue id.
    pub async fn push(
        &self,
        path: String,
        action: DeferredAction,
        params: Vec<(String, String)>,
    ) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        tracing::info!("Queued offline {} on {} (task #{})", action.as_str(), path, id);
        inner.tasks.push(DeferredTask {
            id,
            path,
            action,
            params,
            queued_at: Instant::now(),
        });
        id
    }

    /// Take every queued task, oldest first.
    pub async fn drain(&self) -> Vec<DeferredTask> {
        let mut inner = self.inner.lock().await;
        std::mem::take(&mut inner.tasks)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_from_command() {
        assert_eq!(
            DeferredAction::from_command("/ip/address/add"),
            Some(("/ip/address", DeferredAction::Add))
        );
        assert_eq!(
            DeferredAction::from_command("/ip/firewall/filter/set"),
            Some(("/ip/firewall/filter", DeferredAction::Set))
        );
        assert_eq!(DeferredAction::from_command("/ip/address/print"), None);
        assert_eq!(DeferredAction::from_command("add"), None);
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let queue = OfflineQueue::new();
        queue
            .push("/ip/address".to_string(), DeferredAction::Add, vec![])
            .await;
        queue
            .push("/ip/route".to_string(), DeferredAction::Set, vec![])
            .await;

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].path, "/ip/address");
        assert_eq!(drained[0].command(), "/ip/address/add");
        assert_eq!(drained[1].path, "/ip/route");
        assert!(drained[0].id < drained[1].id);
        assert!(queue.is_empty().await);
    }
}
