//! Workflow history events and batch construction.
//!
//! History is an append-only log per workflow run. Events are produced in
//! batches: each persistence transaction appends one contiguous batch (plus
//! an optional transient batch for speculative decision events that may be
//! discarded on replay). Batches are serialized as JSON blobs; the store
//! treats them as opaque.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event ID of the first event in any run's history.
pub const FIRST_EVENT_ID: i64 = 1;

/// History event kinds. The engine only inspects `event_id` and ordering;
/// the kind and attributes are carried for consumers (deciders, pollers,
/// replication receivers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionTimedOut,
    WorkflowExecutionTerminated,
    WorkflowExecutionCanceled,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionCancelRequested,
    WorkflowExecutionSignaled,
    DecisionTaskScheduled,
    DecisionTaskStarted,
    DecisionTaskCompleted,
    DecisionTaskTimedOut,
    DecisionTaskFailed,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    ActivityTaskCancelRequested,
    ActivityTaskCanceled,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    MarkerRecorded,
    StartChildWorkflowExecutionInitiated,
    ChildWorkflowExecutionStarted,
    ChildWorkflowExecutionCompleted,
    ChildWorkflowExecutionFailed,
    RequestCancelExternalWorkflowExecutionInitiated,
    ExternalWorkflowExecutionCancelRequested,
    SignalExternalWorkflowExecutionInitiated,
    ExternalWorkflowExecutionSignaled,
}

/// A single history event.
///
/// `version` is the failover version of the cluster that generated the
/// event; local-only domains carry [`crate::mutable_state::EMPTY_VERSION`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub event_type: EventType,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub attributes: Value,
}

impl HistoryEvent {
    pub fn new(event_id: i64, event_type: EventType, version: i64, attributes: Value) -> Self {
        Self {
            event_id,
            event_type,
            version,
            timestamp: Utc::now(),
            attributes,
        }
    }
}

/// Accumulates the history batches produced by one update session.
///
/// `history` is the main batch; `transient_history` holds speculative
/// decision events that are appended as a separate batch, before the main
/// one, under the same transaction ID.
#[derive(Debug, Clone, Default)]
pub struct HistoryBuilder {
    history: Vec<HistoryEvent>,
    transient_history: Vec<HistoryEvent>,
}

impl HistoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a history builder around an already-formed batch. Used on the
    /// replication apply path, where the events arrive from the source
    /// cluster instead of being generated locally.
    pub fn from_events(events: Vec<HistoryEvent>) -> Self {
        Self {
            history: events,
            transient_history: Vec::new(),
        }
    }

    pub fn push(&mut self, event: HistoryEvent) {
        self.history.push(event);
    }

    pub fn push_transient(&mut self, event: HistoryEvent) {
        self.transient_history.push(event);
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    pub fn transient_history(&self) -> &[HistoryEvent] {
        &self.transient_history
    }

    pub fn has_transient_events(&self) -> bool {
        !self.transient_history.is_empty()
    }

    pub fn first_event(&self) -> Option<&HistoryEvent> {
        self.history.first()
    }

    /// Serialize a batch for storage. The store only ever sees the encoded
    /// form; [`deserialize_events`] is the inverse.
    pub fn serialize_events(events: &[HistoryEvent]) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(events)
    }

    pub fn deserialize_events(data: &[u8]) -> Result<Vec<HistoryEvent>, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
