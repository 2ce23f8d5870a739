//! Generic guarded state machine.
//!
//! A machine owns a static transition table keyed by (state, event). Events
//! are serialized per instance; guards can reject an event without a state
//! change, actions can abort the transition, and listeners observe commits
//! and failures without being able to corrupt the machine.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Bounded length of both the event and the transition history.
const MAX_HISTORY: usize = 100;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("no transition from {state} on {event}")]
    TransitionRejected { state: String, event: String },

    #[error("guard rejected {event} in state {state}")]
    GuardRejected { state: String, event: String },

    #[error("action failed during {event}: {message}")]
    ActionFailed { event: String, message: String },

    #[error("state machine {0} not found")]
    MachineNotFound(String),
}

/// Read-only view handed to guards and actions.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSnapshot {
    pub machine_id: String,
    pub state: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: HashMap<String, Value>,
}

pub type Guard = Arc<dyn Fn(&MachineSnapshot, &Value) -> bool + Send + Sync>;
pub type Action =
    Arc<dyn Fn(MachineSnapshot, Value) -> BoxFuture<'static, mano_core::Result<()>> + Send + Sync>;

/// Notification delivered to listeners. Listener panics are contained and do
/// not affect the machine.
#[derive(Debug, Clone)]
pub enum MachineNotice {
    Transitioned {
        machine_id: String,
        from: String,
        to: String,
        event: String,
    },
    Failed {
        machine_id: String,
        state: String,
        event: String,
        error: String,
    },
}

pub type Listener = Arc<dyn Fn(&MachineNotice) + Send + Sync>;

struct Transition {
    target: String,
    guard: Option<Guard>,
    action: Option<Action>,
    /// Whether committing this transition counts against the retry budget.
    records_retry: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub event: String,
    pub accepted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineRecord {
    pub id: String,
    pub current_state: String,
    pub previous_state: Option<String>,
    pub initial_state: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub from: String,
    pub to: String,
    pub event: String,
    pub duration: Duration,
}

struct Inner {
    current_state: String,
    previous_state: Option<String>,
    retry_count: u32,
    last_error: Option<String>,
    metadata: HashMap<String, Value>,
    event_history: VecDeque<EventRecord>,
    state_history: VecDeque<TransitionRecord>,
    entered_at: Instant,
    updated_at: DateTime<Utc>,
}

impl Inner {
    fn push_event(&mut self, event: &str, accepted: bool) {
        if self.event_history.len() >= MAX_HISTORY {
            self.event_history.pop_front();
        }
        self.event_history.push_back(EventRecord {
            event: event.to_string(),
            accepted,
            timestamp: Utc::now(),
        });
    }

    fn push_transition(&mut self, record: TransitionRecord) {
        if self.state_history.len() >= MAX_HISTORY {
            self.state_history.pop_front();
        }
        self.state_history.push_back(record);
    }
}

pub struct StateMachine {
    id: String,
    initial_state: String,
    max_retries: u32,
    transitions: HashMap<(String, String), Transition>,
    listeners: std::sync::RwLock<Vec<Listener>>,
    inner: Mutex<Inner>,
    created_at: DateTime<Utc>,
}

impl StateMachine {
    pub fn builder(id: impl Into<String>, initial_state: impl Into<String>) -> StateMachineBuilder {
        StateMachineBuilder {
            id: id.into(),
            initial_state: initial_state.into(),
            max_retries: 3,
            transitions: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn current_state(&self) -> String {
        self.inner.lock().await.current_state.clone()
    }

    pub async fn previous_state(&self) -> Option<String> {
        self.inner.lock().await.previous_state.clone()
    }

    pub async fn retry_count(&self) -> u32 {
        self.inner.lock().await.retry_count
    }

    pub async fn reset_retries(&self) {
        self.inner.lock().await.retry_count = 0;
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    pub async fn set_metadata(&self, key: &str, value: Value) {
        let mut inner = self.inner.lock().await;
        inner.metadata.insert(key.to_string(), value);
    }

    pub async fn metadata(&self, key: &str) -> Option<Value> {
        self.inner.lock().await.metadata.get(key).cloned()
    }

    pub async fn state_history(&self) -> Vec<TransitionRecord> {
        self.inner.lock().await.state_history.iter().cloned().collect()
    }

    pub async fn event_history(&self) -> Vec<EventRecord> {
        self.inner.lock().await.event_history.iter().cloned().collect()
    }

    /// Full serializable view of the machine for status surfaces.
    pub async fn record(&self) -> MachineRecord {
        let inner = self.inner.lock().await;
        MachineRecord {
            id: self.id.clone(),
            current_state: inner.current_state.clone(),
            previous_state: inner.previous_state.clone(),
            initial_state: self.initial_state.clone(),
            retry_count: inner.retry_count,
            max_retries: self.max_retries,
            last_error: inner.last_error.clone(),
            metadata: inner.metadata.clone(),
            created_at: self.created_at,
            updated_at: inner.updated_at,
        }
    }

    pub fn add_listener(&self, listener: Listener) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Whether `event` has a transition out of the current state. Guards are
    /// not evaluated.
    pub async fn can_fire(&self, event: &str) -> bool {
        let state = self.inner.lock().await.current_state.clone();
        self.transitions.contains_key(&(state, event.to_string()))
    }

    /// Deliver an event. Serialized per machine: concurrent senders queue on
    /// the machine lock and observe a total order.
    pub async fn send(&self, event: &str, data: Value) -> Result<TransitionOutcome, LifecycleError> {
        let mut inner = self.inner.lock().await;

        let key = (inner.current_state.clone(), event.to_string());
        let transition = match self.transitions.get(&key) {
            Some(t) => t,
            None => {
                inner.push_event(event, false);
                return Err(LifecycleError::TransitionRejected {
                    state: key.0,
                    event: key.1,
                });
            }
        };

        let snapshot = MachineSnapshot {
            machine_id: self.id.clone(),
            state: inner.current_state.clone(),
            retry_count: inner.retry_count,
            max_retries: self.max_retries,
            metadata: inner.metadata.clone(),
        };

        if let Some(guard) = &transition.guard {
            if !guard(&snapshot, &data) {
                inner.push_event(event, false);
                return Err(LifecycleError::GuardRejected {
                    state: key.0,
                    event: key.1,
                });
            }
        }

        if let Some(action) = &transition.action {
            if let Err(err) = action(snapshot, data).await {
                let message = err.to_string();
                inner.last_error = Some(message.clone());
                inner.push_event(event, false);
                let notice = MachineNotice::Failed {
                    machine_id: self.id.clone(),
                    state: inner.current_state.clone(),
                    event: event.to_string(),
                    error: message.clone(),
                };
                drop(inner);
                self.notify(&notice);
                return Err(LifecycleError::ActionFailed {
                    event: event.to_string(),
                    message,
                });
            }
        }

        let duration = inner.entered_at.elapsed();
        let from = inner.current_state.clone();
        let to = transition.target.clone();

        inner.previous_state = Some(from.clone());
        inner.current_state = to.clone();
        inner.entered_at = Instant::now();
        inner.updated_at = Utc::now();
        if transition.records_retry {
            inner.retry_count += 1;
        }
        inner.push_event(event, true);
        inner.push_transition(TransitionRecord {
            from: from.clone(),
            to: to.clone(),
            event: event.to_string(),
            timestamp: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        });
        drop(inner);

        self.notify(&MachineNotice::Transitioned {
            machine_id: self.id.clone(),
            from: from.clone(),
            to: to.clone(),
            event: event.to_string(),
        });

        Ok(TransitionOutcome {
            from,
            to,
            event: event.to_string(),
            duration,
        })
    }

    fn notify(&self, notice: &MachineNotice) {
        let listeners = self.listeners.read().expect("listener lock poisoned");
        for listener in listeners.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| listener(notice)));
            if result.is_err() {
                tracing::warn!(machine = %self.id, "state machine listener panicked");
            }
        }
    }
}

pub struct StateMachineBuilder {
    id: String,
    initial_state: String,
    max_retries: u32,
    transitions: HashMap<(String, String), Transition>,
    listeners: Vec<Listener>,
}

impl StateMachineBuilder {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn transition(self, from: &str, event: &str, to: &str) -> Self {
        self.insert(from, event, to, None, None, false)
    }

    pub fn guarded(self, from: &str, event: &str, to: &str, guard: Guard) -> Self {
        self.insert(from, event, to, Some(guard), None, false)
    }

    pub fn with_action(self, from: &str, event: &str, to: &str, action: Action) -> Self {
        self.insert(from, event, to, None, Some(action), false)
    }

    /// A retry edge: guarded by the remaining retry budget and counted
    /// against it when committed.
    pub fn retry_edge(self, from: &str, event: &str, to: &str) -> Self {
        let guard: Guard = Arc::new(|snap, _| snap.retry_count < snap.max_retries);
        self.insert(from, event, to, Some(guard), None, true)
    }

    /// Attach an action to an already-declared transition.
    pub fn action(mut self, from: &str, event: &str, action: Action) -> Self {
        if let Some(t) = self
            .transitions
            .get_mut(&(from.to_string(), event.to_string()))
        {
            t.action = Some(action);
        }
        self
    }

    pub fn listener(mut self, listener: Listener) -> Self {
        self.listeners.push(listener);
        self
    }

    fn insert(
        mut self,
        from: &str,
        event: &str,
        to: &str,
        guard: Option<Guard>,
        action: Option<Action>,
        records_retry: bool,
    ) -> Self {
        self.transitions.insert(
            (from.to_string(), event.to_string()),
            Transition {
                target: to.to_string(),
                guard,
                action,
                records_retry,
            },
        );
        self
    }

    pub fn build(self) -> StateMachine {
        StateMachine {
            id: self.id,
            initial_state: self.initial_state.clone(),
            max_retries: self.max_retries,
            transitions: self.transitions,
            listeners: std::sync::RwLock::new(self.listeners),
            inner: Mutex::new(Inner {
                current_state: self.initial_state,
                previous_state: None,
                retry_count: 0,
                last_error: None,
                metadata: HashMap::new(),
                event_history: VecDeque::new(),
                state_history: VecDeque::new(),
                entered_at: Instant::now(),
                updated_at: Utc::now(),
            }),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn two_state_machine() -> StateMachine {
        StateMachine::builder("m1", "Idle")
            .transition("Idle", "Start", "Running")
            .transition("Running", "Stop", "Idle")
            .build()
    }

    #[tokio::test]
    async fn send_commits_target_state_and_appends_history() {
        let machine = two_state_machine();
        let outcome = machine.send("Start", Value::Null).await.unwrap();
        assert_eq!(outcome.from, "Idle");
        assert_eq!(outcome.to, "Running");
        assert_eq!(machine.current_state().await, "Running");
        assert_eq!(machine.previous_state().await.as_deref(), Some("Idle"));

        let history = machine.state_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event, "Start");
    }

    #[tokio::test]
    async fn unknown_event_is_rejected_without_state_change() {
        let machine = two_state_machine();
        let err = machine.send("Stop", Value::Null).await.unwrap_err();
        assert!(matches!(err, LifecycleError::TransitionRejected { .. }));
        assert_eq!(machine.current_state().await, "Idle");
        assert!(machine.state_history().await.is_empty());
    }

    #[tokio::test]
    async fn guard_rejection_preserves_state() {
        let machine = StateMachine::builder("m2", "Idle")
            .guarded("Idle", "Start", "Running", Arc::new(|_, data| {
                data.get("allowed").and_then(Value::as_bool).unwrap_or(false)
            }))
            .build();

        let err = machine.send("Start", json!({"allowed": false})).await.unwrap_err();
        assert!(matches!(err, LifecycleError::GuardRejected { .. }));
        assert_eq!(machine.current_state().await, "Idle");

        machine.send("Start", json!({"allowed": true})).await.unwrap();
        assert_eq!(machine.current_state().await, "Running");
    }

    #[tokio::test]
    async fn failing_action_aborts_transition_and_records_error() {
        let machine = StateMachine::builder("m3", "Idle")
            .with_action("Idle", "Start", "Running", Arc::new(|_, _| {
                Box::pin(async { Err(mano_core::ManoError::Internal("boom".into())) })
            }))
            .build();

        let err = machine.send("Start", Value::Null).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ActionFailed { .. }));
        assert_eq!(machine.current_state().await, "Idle");
        assert!(machine.last_error().await.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn retry_edge_is_bounded_by_budget() {
        let machine = StateMachine::builder("m4", "Failed")
            .max_retries(2)
            .retry_edge("Failed", "Retry", "Working")
            .transition("Working", "Fail", "Failed")
            .build();

        machine.send("Retry", Value::Null).await.unwrap();
        machine.send("Fail", Value::Null).await.unwrap();
        machine.send("Retry", Value::Null).await.unwrap();
        machine.send("Fail", Value::Null).await.unwrap();

        let err = machine.send("Retry", Value::Null).await.unwrap_err();
        assert!(matches!(err, LifecycleError::GuardRejected { .. }));
        assert_eq!(machine.retry_count().await, 2);
    }

    #[tokio::test]
    async fn listener_panic_does_not_corrupt_machine() {
        let machine = two_state_machine();
        machine.add_listener(Arc::new(|_| panic!("bad listener")));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        machine.add_listener(Arc::new(move |notice| {
            if matches!(notice, MachineNotice::Transitioned { .. }) {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));

        machine.send("Start", Value::Null).await.unwrap();
        assert_eq!(machine.current_state().await, "Running");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn record_reflects_machine_state() {
        let machine = two_state_machine();
        machine.set_metadata("owner", json!("slice-a")).await;
        machine.send("Start", Value::Null).await.unwrap();

        let record = machine.record().await;
        assert_eq!(record.id, "m1");
        assert_eq!(record.current_state, "Running");
        assert_eq!(record.previous_state.as_deref(), Some("Idle"));
        assert_eq!(record.initial_state, "Idle");
        assert_eq!(record.metadata.get("owner"), Some(&json!("slice-a")));
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn histories_are_bounded() {
        let machine = two_state_machine();
        for _ in 0..120 {
            machine.send("Start", Value::Null).await.unwrap();
            machine.send("Stop", Value::Null).await.unwrap();
        }
        assert_eq!(machine.state_history().await.len(), MAX_HISTORY);
        assert_eq!(machine.event_history().await.len(), MAX_HISTORY);
    }
}
