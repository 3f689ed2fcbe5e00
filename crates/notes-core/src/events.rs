//! Event infrastructure for notes-core.
//!
//! Provides `SyncEvent` for progress reporting and `EventBus` for
//! subscriptions. Hosts subscribe to render the phase indicator and the
//! status line; the engine never waits on subscribers.

use crate::error::Operation;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Coarse progress of the running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Merging,
    Pushing,
    /// Merge finished without conflicts.
    Clean,
    /// Merge left conflicts behind.
    Conflicted,
    /// Conflict markers were committed.
    Reconciled,
}

/// Events emitted during engine operations.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// The running operation entered a new phase.
    PhaseChanged {
        operation: Operation,
        phase: SyncPhase,
        /// Milliseconds since Unix epoch.
        timestamp: i64,
    },
    /// An operation finished; `label` is the short status string.
    StatusChanged {
        operation: Operation,
        label: String,
        ok: bool,
        timestamp: i64,
    },
    /// The in-memory note list was rebuilt from disk.
    NotesReloaded { count: usize, timestamp: i64 },
    /// Conflicted files were committed with their markers.
    ConflictCommitted {
        paths: Vec<String>,
        revision: String,
        timestamp: i64,
    },
}

/// Current time in milliseconds since Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing engine events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock during unwinding
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn phase(&self, operation: Operation, phase: SyncPhase) {
        self.emit(SyncEvent::PhaseChanged {
            operation,
            phase,
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let subscription = bus.subscribe(move |event| sink.lock().unwrap().push(event));

        bus.phase(Operation::Pull, SyncPhase::Fetching);
        drop(subscription);
        bus.phase(Operation::Pull, SyncPhase::Idle);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            seen[0],
            SyncEvent::PhaseChanged {
                phase: SyncPhase::Fetching,
                ..
            }
        ));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SyncEvent::StatusChanged {
            operation: Operation::Publish,
            label: "pushed".into(),
            ok: true,
            timestamp: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "statusChanged");
        assert_eq!(json["operation"], "publish");
        assert_eq!(json["label"], "pushed");
    }
}
