//! Bounded in-process event bus.
//!
//! Events get strictly monotone identifiers in emission order and live in a
//! bounded FIFO ring (oldest dropped first, silently, behind a counter).
//! Consumers either poll with `events strictly after id X` filters or
//! subscribe to the broadcast fan-out; the IPC supervisor's result waiting is
//! a select over such a subscription and a timeout.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::models::event::{EmitOpts, EventSeverity, LoopEvent};

/// Persisted form of a bus history dump, written at the end of a run so
/// external consumers can poll the stream after the process exits.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EventsFile {
    pub events: Vec<LoopEvent>,
}

/// Well-known event type names.
pub mod types {
    pub const TASK_COMPLETE: &str = "task:complete";
    pub const TASK_FAILED: &str = "task:failed";
    pub const TASK_BLOCKED: &str = "task:blocked";
    pub const TASK_UNBLOCKED: &str = "task:unblocked";
    pub const TASK_FIX_CREATED: &str = "task:fix_created";
    pub const VALIDATION_ERROR: &str = "validation:error_with_suggestion";
    pub const VALIDATION_WARNING: &str = "validation:warning";
    pub const IPC_CONNECTION_RETRY: &str = "ipc:connection_retry";
    pub const IPC_CONNECTION_FAILED: &str = "ipc:connection_failed";
    pub const IPC_HEALTH_CHECK: &str = "ipc:health_check";
    pub const CHECKPOINT_CREATED: &str = "checkpoint:created";
    pub const CHECKPOINT_ROLLED_BACK: &str = "checkpoint:rolled_back";
    pub const INTERVENTION_TRIGGERED: &str = "intervention:triggered";
    pub const INTERVENTION_SUCCESSFUL: &str = "intervention:successful";
    pub const INTERVENTION_FAILED: &str = "intervention:failed";
    pub const INTERVENTION_ROLLED_BACK: &str = "intervention:rolled_back";
}

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default `poll` result limit.
pub const DEFAULT_POLL_LIMIT: usize = 100;

/// Poll filters: events with id strictly greater than `since`, matching any
/// of the provided type/severity sets.
#[derive(Debug, Clone, Default)]
pub struct PollQuery {
    pub since: u64,
    pub types: Option<Vec<String>>,
    pub severity: Option<Vec<EventSeverity>>,
    pub limit: Option<usize>,
}

impl PollQuery {
    pub fn since(id: u64) -> Self {
        Self {
            since: id,
            ..Self::default()
        }
    }

    pub fn with_types(mut self, types: &[&str]) -> Self {
        self.types = Some(types.iter().map(|t| (*t).to_string()).collect());
        self
    }

    pub fn with_severity(mut self, severity: &[EventSeverity]) -> Self {
        self.severity = Some(severity.to_vec());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &LoopEvent) -> bool {
        if event.id <= self.since {
            return false;
        }
        if let Some(ref types) = self.types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(ref severity) = self.severity {
            if !severity.contains(&event.severity) {
                return false;
            }
        }
        true
    }
}

struct Inner {
    ring: std::collections::VecDeque<LoopEvent>,
    last_id: u64,
    dropped: u64,
}

/// The bus. The only process-wide shared mutable state in the loop; emit and
/// poll hold the internal lock only for the duration of the ring operation.
pub struct EventBus {
    inner: Mutex<Inner>,
    capacity: usize,
    sender: broadcast::Sender<LoopEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.clamp(16, 4096));
        Self {
            inner: Mutex::new(Inner {
                ring: std::collections::VecDeque::with_capacity(capacity.min(1024)),
                last_id: 0,
                dropped: 0,
            }),
            capacity,
            sender,
        }
    }

    /// Emit an event; returns its assigned id.
    pub fn emit(&self, event_type: &str, payload: serde_json::Value, opts: EmitOpts) -> u64 {
        let event = {
            let mut inner = self.inner.lock().expect("event bus lock");
            inner.last_id += 1;
            let event = LoopEvent {
                id: inner.last_id,
                event_type: event_type.to_string(),
                severity: opts.severity,
                timestamp: Utc::now(),
                task_id: opts.task_id,
                prd_id: opts.prd_id,
                payload,
            };
            inner.ring.push_back(event.clone());
            if inner.ring.len() > self.capacity {
                inner.ring.pop_front();
                inner.dropped += 1;
            }
            event
        };
        // No subscribers is fine; polling consumers read the ring.
        let _ = self.sender.send(event.clone());
        event.id
    }

    /// Shorthand for an info-severity emit with no correlation ids.
    pub fn emit_info(&self, event_type: &str, payload: serde_json::Value) -> u64 {
        self.emit(event_type, payload, EmitOpts::default())
    }

    /// Events matching the query, in id order.
    pub fn poll(&self, query: &PollQuery) -> Vec<LoopEvent> {
        let limit = query.limit.unwrap_or(DEFAULT_POLL_LIMIT);
        let inner = self.inner.lock().expect("event bus lock");
        inner
            .ring
            .iter()
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The most recently assigned id (0 if nothing has been emitted).
    pub fn last_id(&self) -> u64 {
        self.inner.lock().expect("event bus lock").last_id
    }

    /// How many events have been silently dropped by the ring bound.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("event bus lock").dropped
    }

    /// `task:blocked` events not superseded by a later `task:unblocked` for
    /// the same task.
    pub fn blocked_tasks(&self) -> Vec<LoopEvent> {
        let inner = self.inner.lock().expect("event bus lock");
        let mut latest: HashMap<String, LoopEvent> = HashMap::new();
        for event in inner.ring.iter() {
            let Some(task_id) = event.task_id.clone() else {
                continue;
            };
            match event.event_type.as_str() {
                types::TASK_BLOCKED => {
                    latest.insert(task_id, event.clone());
                }
                types::TASK_UNBLOCKED => {
                    latest.remove(&task_id);
                }
                _ => {}
            }
        }
        let mut blocked: Vec<LoopEvent> = latest.into_values().collect();
        blocked.sort_by_key(|e| e.id);
        blocked
    }

    /// Empty the ring and reset the id counter.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("event bus lock");
        inner.ring.clear();
        inner.last_id = 0;
        inner.dropped = 0;
    }

    /// Subscribe to the broadcast fan-out of every subsequent emit.
    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.sender.subscribe()
    }

    /// Every event currently held by the ring, in id order.
    pub fn snapshot(&self) -> Vec<LoopEvent> {
        let inner = self.inner.lock().expect("event bus lock");
        inner.ring.iter().cloned().collect()
    }

    /// Rebuild a bus from a persisted history dump. Ids are kept as recorded
    /// so `poll` filters behave exactly as they would have against the live
    /// bus; subsequent emits continue after the highest recorded id.
    pub fn from_history(mut events: Vec<LoopEvent>) -> Self {
        events.sort_by_key(|e| e.id);
        let bus = Self::new(DEFAULT_CAPACITY.max(events.len()));
        {
            let mut inner = bus.inner.lock().expect("event bus lock");
            inner.last_id = events.last().map(|e| e.id).unwrap_or(0);
            inner.ring.extend(events);
        }
        bus
    }
}
