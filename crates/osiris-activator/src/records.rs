//! Single-flight activation records.
//!
//! One record exists per workload at a time; every request that needs
//! the workload awake either creates the record (and with it the one
//! activation task) or joins the existing one. State changes are
//! broadcast over a `watch` channel so any number of waiters wake
//! without polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use osiris_core::{App, WorkloadRef};

/// Lifecycle of one activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationState {
    Pending,
    Activating,
    Ready,
    Failed(String),
}

impl ActivationState {
    /// Whether waiters can stop waiting.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActivationState::Ready | ActivationState::Failed(_))
    }
}

/// Tracks one in-progress (or briefly completed) activation.
pub struct ActivationRecord {
    pub app: Arc<App>,
    state: watch::Sender<ActivationState>,
}

impl ActivationRecord {
    fn new(app: Arc<App>) -> Self {
        let (state, _) = watch::channel(ActivationState::Pending);
        Self { app, state }
    }

    /// Subscribe to state changes. The receiver's current value is the
    /// record's present state.
    pub fn subscribe(&self) -> watch::Receiver<ActivationState> {
        self.state.subscribe()
    }

    /// Broadcast a state change to all waiters.
    pub fn set_state(&self, state: ActivationState) {
        self.state.send_replace(state);
    }

    /// Current state snapshot.
    pub fn state(&self) -> ActivationState {
        self.state.borrow().clone()
    }
}

/// The record map: at most one record per workload key.
pub struct ActivationTracker {
    records: Mutex<HashMap<WorkloadRef, Arc<ActivationRecord>>>,
    /// How long a Ready record lingers so concurrent arrivals
    /// short-circuit instead of re-running the protocol.
    ready_ttl: Duration,
}

impl ActivationTracker {
    pub fn new(ready_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            ready_ttl,
        })
    }

    /// Join the workload's record, creating it when none exists.
    ///
    /// Returns the record and whether this caller created it; the
    /// creator is responsible for starting the activation task.
    pub fn join(&self, app: &Arc<App>) -> (Arc<ActivationRecord>, bool) {
        let key = app.workload();
        let mut records = self.records.lock().expect("records lock");
        if let Some(record) = records.get(&key) {
            return (record.clone(), false);
        }
        let record = Arc::new(ActivationRecord::new(app.clone()));
        records.insert(key.clone(), record.clone());
        debug!(workload = %key, "created activation record");
        (record, true)
    }

    /// Mark the record Ready and schedule its eviction after the TTL.
    pub fn finish_ready(self: &Arc<Self>, key: &WorkloadRef) {
        let record = {
            let records = self.records.lock().expect("records lock");
            records.get(key).cloned()
        };
        let Some(record) = record else { return };
        record.set_state(ActivationState::Ready);

        let tracker = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.ready_ttl).await;
            tracker.evict(&key, &record);
        });
    }

    /// Mark the record Failed (waking every waiter with the cause) and
    /// evict it so the next request retries from scratch.
    pub fn finish_failed(&self, key: &WorkloadRef, cause: String) {
        let record = {
            let mut records = self.records.lock().expect("records lock");
            records.remove(key)
        };
        if let Some(record) = record {
            debug!(workload = %key, %cause, "activation failed");
            record.set_state(ActivationState::Failed(cause));
        }
    }

    /// Remove `record` from the map, unless a newer record has already
    /// replaced it.
    fn evict(&self, key: &WorkloadRef, record: &Arc<ActivationRecord>) {
        let mut records = self.records.lock().expect("records lock");
        if let Some(current) = records.get(key) {
            if Arc::ptr_eq(current, record) {
                records.remove(key);
                debug!(workload = %key, "evicted ready activation record");
            }
        }
    }

    /// Number of live records (for introspection and tests).
    pub fn len(&self) -> usize {
        self.records.lock().expect("records lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
