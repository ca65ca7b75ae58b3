//! Buffered reconciliation of the shared state partitions.
//!
//! Updates are queued as they arrive and applied in one batch per tick:
//!
//! ```text
//!  enqueue_update ──▸ pending ──(tick: drain all)──▸ apply in enqueue order
//!                                                     │
//!        conversation / surface ──▸ conflict::detect ─┤─ none ──▸ shallow merge
//!                                                     └─ some ──▸ conflict::merge
//!        user / system ──────────▸ shallow merge (last writer wins)
//!                                                     │
//!                                    sync_version += 1, SyncCompleted
//! ```
//!
//! A tick holds the state lock for its whole run, so ticks never overlap and
//! readers only ever observe complete versions.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::conflict::{self, Partition};
use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus};
use crate::message::{now_millis, Action, Message};

/// Deep copy of the reconciled state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub conversation_context: Partition,
    /// Canvas / editor state
    pub surface_context: Partition,
    pub user_context: Partition,
    pub system_context: Partition,
    pub last_sync_at: Option<u64>,
    pub sync_version: u64,
    /// Updates received but not yet applied, in arrival order.
    pub pending_updates: Vec<Message>,
}

/// Summary of one reconciliation tick that applied at least one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub version: u64,
    pub timestamp: u64,
    pub updates_applied: usize,
    pub conflicts_resolved: usize,
}

#[derive(Default)]
struct Partitions {
    conversation: Partition,
    surface: Partition,
    user: Partition,
    system: Partition,
    last_sync_at: Option<u64>,
    sync_version: u64,
}

pub struct StateSynchronizer {
    state: Mutex<Partitions>,
    pending: Mutex<VecDeque<Arc<Message>>>,
    events: EventBus,
}

impl StateSynchronizer {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Mutex::new(Partitions::default()),
            pending: Mutex::new(VecDeque::new()),
            events,
        }
    }

    /// Buffer a state-update message for the next tick.
    pub async fn enqueue_update(&self, message: Arc<Message>) -> Result<(), BridgeError> {
        if !message.action().is_state_update() {
            return Err(BridgeError::NotAnUpdate(message.action().clone()));
        }
        self.pending.lock().await.push_back(message);
        Ok(())
    }

    /// Apply everything pending. Returns `None` when nothing was applied.
    pub async fn tick(&self) -> Option<TickReport> {
        let mut state = self.state.lock().await;
        let drained: Vec<Arc<Message>> = self.pending.lock().await.drain(..).collect();
        if drained.is_empty() {
            return None;
        }

        let mut applied = 0;
        let mut conflicts_resolved = 0;
        for update in &drained {
            let Some(partial) = update.payload().as_object() else {
                log::warn!(
                    "Skipping update {} ('{}'): payload is not an object",
                    update.id(),
                    update.action()
                );
                continue;
            };

            match update.action() {
                Action::ConversationUpdate => {
                    let resolved = reconcile(&mut state.conversation, partial);
                    conflicts_resolved += resolved;
                    self.events.publish(BridgeEvent::ConversationSynced {
                        conflicts_resolved: resolved,
                    });
                }
                Action::SurfaceUpdate => {
                    let resolved = reconcile(&mut state.surface, partial);
                    conflicts_resolved += resolved;
                    self.events.publish(BridgeEvent::SurfaceSynced {
                        conflicts_resolved: resolved,
                    });
                }
                Action::UserUpdate => shallow_merge(&mut state.user, partial),
                Action::SystemUpdate => shallow_merge(&mut state.system, partial),
                other => {
                    log::warn!("Skipping update {}: '{other}' is not a state update", update.id());
                    continue;
                }
            }
            applied += 1;
        }

        if applied == 0 {
            return None;
        }

        let timestamp = now_millis();
        state.last_sync_at = Some(timestamp);
        state.sync_version += 1;
        let version = state.sync_version;
        drop(state);

        log::trace!("Sync tick applied {applied} updates, version {version}");
        self.events.publish(BridgeEvent::SyncCompleted {
            version,
            timestamp,
            updates_applied: applied,
        });

        Some(TickReport {
            version,
            timestamp,
            updates_applied: applied,
            conflicts_resolved,
        })
    }

    /// Run one tick now; waits for any tick already in progress.
    pub async fn force_sync(&self) -> Option<TickReport> {
        self.tick().await
    }

    pub async fn snapshot(&self) -> SyncState {
        let state = self.state.lock().await;
        let pending = self.pending.lock().await;
        SyncState {
            conversation_context: state.conversation.clone(),
            surface_context: state.surface.clone(),
            user_context: state.user.clone(),
            system_context: state.system.clone(),
            last_sync_at: state.last_sync_at,
            sync_version: state.sync_version,
            pending_updates: pending.iter().map(|m| Message::clone(m)).collect(),
        }
    }

    pub async fn sync_version(&self) -> u64 {
        self.state.lock().await.sync_version
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn shallow_merge(target: &mut Partition, partial: &Partition) {
    for (key, value) in partial {
        target.insert(key.clone(), value.clone());
    }
}

/// Merge with conflict resolution. Returns the number of conflicts resolved.
fn reconcile(target: &mut Partition, partial: &Partition) -> usize {
    let conflicts = conflict::detect(target, partial);
    if conflicts.is_empty() {
        shallow_merge(target, partial);
        return 0;
    }
    let (merged, conflicts) = conflict::merge(target, partial);
    *target = merged;
    conflicts.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Endpoint, Priority};
    use serde_json::{json, Value};

    fn update(action: &str, payload: Value) -> Arc<Message> {
        Arc::new(Message::new(action, payload, Priority::Medium, Endpoint::Producer, Endpoint::Consumer))
    }

    #[tokio::test]
    async fn test_two_updates_one_tick() {
        let sync = StateSynchronizer::new(EventBus::new(16));
        sync.enqueue_update(update("conversation-update", json!({"a": 1}))).await.unwrap();
        sync.enqueue_update(update("conversation-update", json!({"a": 2}))).await.unwrap();

        let report = sync.tick().await.unwrap();
        assert_eq!(report.updates_applied, 2);
        assert_eq!(report.version, 1);

        let state = sync.snapshot().await;
        assert_eq!(state.conversation_context["a"], json!(2));
        assert_eq!(state.sync_version, 1);
        assert!(state.pending_updates.is_empty());
        assert!(state.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_array_fields_union() {
        let sync = StateSynchronizer::new(EventBus::new(16));
        sync.enqueue_update(update("canvas-update", json!({"tags": ["x"]}))).await.unwrap();
        sync.enqueue_update(update("surface-update", json!({"tags": ["y"]}))).await.unwrap();

        let report = sync.tick().await.unwrap();
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(sync.snapshot().await.surface_context["tags"], json!(["x", "y"]));
    }

    #[tokio::test]
    async fn test_user_and_system_overwrite() {
        let sync = StateSynchronizer::new(EventBus::new(16));
        sync.enqueue_update(update("user-update", json!({"prefs": ["dark"]}))).await.unwrap();
        sync.enqueue_update(update("user-update", json!({"prefs": ["light"]}))).await.unwrap();
        sync.enqueue_update(update("system-update", json!({"mode": "edit"}))).await.unwrap();
        sync.tick().await.unwrap();

        let state = sync.snapshot().await;
        assert_eq!(state.user_context["prefs"], json!(["light"]));
        assert_eq!(state.system_context["mode"], json!("edit"));
    }

    #[tokio::test]
    async fn test_idle_tick_keeps_version() {
        let sync = StateSynchronizer::new(EventBus::new(16));
        assert!(sync.tick().await.is_none());
        assert_eq!(sync.sync_version().await, 0);

        // non-object payloads are skipped without a version bump
        sync.enqueue_update(update("user-update", json!("nope"))).await.unwrap();
        assert!(sync.tick().await.is_none());
        assert_eq!(sync.sync_version().await, 0);
        assert_eq!(sync.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_version_increments_once_per_tick() {
        let sync = StateSynchronizer::new(EventBus::new(64));
        for n in 0..5u64 {
            sync.enqueue_update(update("system-update", json!({"n": n}))).await.unwrap();
            sync.enqueue_update(update("user-update", json!({"n": n}))).await.unwrap();
            let report = sync.tick().await.unwrap();
            assert_eq!(report.version, n + 1);
        }
        assert_eq!(sync.sync_version().await, 5);
    }

    #[tokio::test]
    async fn test_rejects_non_update_actions() {
        let sync = StateSynchronizer::new(EventBus::new(16));
        let err = sync.enqueue_update(update("heartbeat", json!({}))).await.unwrap_err();
        assert_eq!(err, BridgeError::NotAnUpdate(Action::Heartbeat));
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy_and_shows_pending() {
        let sync = StateSynchronizer::new(EventBus::new(16));
        sync.enqueue_update(update("conversation-update", json!({"k": 1}))).await.unwrap();

        let mut snapshot = sync.snapshot().await;
        assert_eq!(snapshot.pending_updates.len(), 1);
        snapshot.conversation_context.insert("k".into(), json!(99));

        sync.tick().await.unwrap();
        assert_eq!(sync.snapshot().await.conversation_context["k"], json!(1));
    }

    #[tokio::test]
    async fn test_tick_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let sync = StateSynchronizer::new(bus);

        sync.enqueue_update(update("conversation-update", json!({"a": 1}))).await.unwrap();
        sync.enqueue_update(update("surface-update", json!({"b": 1}))).await.unwrap();
        sync.tick().await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), BridgeEvent::ConversationSynced { conflicts_resolved: 0 }));
        assert!(matches!(rx.recv().await.unwrap(), BridgeEvent::SurfaceSynced { conflicts_resolved: 0 }));
        match rx.recv().await.unwrap() {
            BridgeEvent::SyncCompleted { version, updates_applied, .. } => {
                assert_eq!(version, 1);
                assert_eq!(updates_applied, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_ticks_do_not_overlap() {
        let sync = Arc::new(StateSynchronizer::new(EventBus::new(256)));
        for n in 0..20 {
            sync.enqueue_update(update("conversation-update", json!({"n": n}))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let sync = sync.clone();
            handles.push(tokio::spawn(async move { sync.tick().await }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            if let Some(report) = handle.await.unwrap() {
                versions.push(report.version);
            }
        }

        // all 20 land in whichever tick ran first; the rest find nothing
        assert_eq!(versions, vec![1]);
        assert_eq!(sync.snapshot().await.conversation_context["n"], json!(19));
    }
}
