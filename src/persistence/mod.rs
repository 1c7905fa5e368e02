//! Persistence contracts for workflow executions.
//!
//! This module defines the data model shared by every execution store and
//! the [`ExecutionStore`] trait the engine is written against. Two stores
//! ship with the crate:
//! - `memory`: a lock-protected in-process store used by tests and local
//!   development
//! - `postgres`: the production store (sqlx, one transaction per update)
//!
//! Every write is condition-checked: the request carries the
//! `next_event_id` the caller last observed, and the store rejects the
//! write with [`StoreError::ConditionFailed`] when the stored value moved.

pub mod memory;
pub mod postgres;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::history::HistoryEvent;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a workflow domain (namespace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId(pub Uuid);

impl DomainId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DomainId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one run of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (workflow ID, run ID) pair naming one execution of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: RunId,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, run_id: RunId) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}

impl std::fmt::Display for WorkflowExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

// ============================================================================
// Execution state
// ============================================================================

/// Lifecycle state of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Running,
    Completed,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// How a completed execution closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    None,
    Completed,
    Failed,
    Canceled,
    Terminated,
    ContinuedAsNew,
    TimedOut,
}

/// The durable core of a workflow execution, mirrored in memory by the
/// mutable state and persisted on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionInfo {
    pub domain_id: DomainId,
    pub workflow_id: String,
    pub run_id: RunId,
    pub workflow_type: String,
    pub task_list: String,
    /// Opaque blob bridging decider state across decisions.
    pub execution_context: Vec<u8>,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
    pub next_event_id: i64,
    pub last_first_event_id: i64,
    pub last_processed_event_id: i64,
    pub start_timestamp: DateTime<Utc>,
    pub last_updated_timestamp: DateTime<Utc>,
}

/// Cross-cluster failover bookkeeping for globally replicated domains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationState {
    pub current_version: i64,
    pub start_version: i64,
    pub last_write_version: i64,
    pub last_write_event_id: i64,
    /// Per-source-cluster progress, keyed by cluster name.
    pub last_replication_info: HashMap<String, ReplicationInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    pub version: i64,
    pub last_event_id: i64,
}

// ============================================================================
// Pending records
// ============================================================================

/// A scheduled (and possibly started) activity, keyed by schedule event ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub schedule_id: i64,
    pub started_id: i64,
    pub activity_id: String,
    pub activity_type: String,
    pub input: Value,
    pub schedule_to_close_timeout_seconds: i32,
    pub heartbeat_timeout_seconds: i32,
    pub last_heartbeat: DateTime<Utc>,
}

/// A pending user timer, keyed by its user-visible timer ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub timer_id: String,
    pub started_id: i64,
    pub expiry: DateTime<Utc>,
    pub task_created: bool,
}

/// A child workflow initiated by this execution, keyed by initiated event ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    pub initiated_id: i64,
    pub started_id: i64,
    pub create_request_id: String,
    pub workflow_type: String,
    pub execution: Option<WorkflowExecution>,
}

/// An outstanding cancel request against an external execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelInfo {
    pub initiated_id: i64,
    pub cancel_request_id: String,
}

/// An outstanding signal to an external execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub initiated_id: i64,
    pub signal_request_id: String,
    pub signal_name: String,
    pub input: Value,
}

/// A replication batch buffered because it arrived out of order, keyed by
/// its first event ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedReplicationTask {
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub version: i64,
    pub events: Vec<HistoryEvent>,
}

// ============================================================================
// Tasks
// ============================================================================

/// A queued transfer task (decision dispatch, activity dispatch, close
/// propagation, …). The payload is opaque to the store; `version` routes
/// the task to the owning cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    pub payload: Value,
    pub version: i64,
}

impl TransferTask {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            version: 0,
        }
    }
}

/// A queued timer task, fired by the shard's timer queue at `fire_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerTask {
    pub fire_at: DateTime<Utc>,
    pub payload: Value,
    pub version: i64,
}

impl TimerTask {
    pub fn new(fire_at: DateTime<Utc>, payload: Value) -> Self {
        Self {
            fire_at,
            payload,
            version: 0,
        }
    }
}

/// An instruction to ship the event range `[first_event_id, next_event_id)`
/// to replica clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub version: i64,
    pub last_replication_info: HashMap<String, ReplicationInfo>,
}

// ============================================================================
// Snapshots & requests
// ============================================================================

/// Full durable state of one execution: the execution info plus every
/// pending-record map. Returned by reads, consumed whole by resets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub execution_info: WorkflowExecutionInfo,
    pub replication_state: Option<ReplicationState>,
    pub activity_infos: HashMap<i64, ActivityInfo>,
    pub timer_infos: HashMap<String, TimerInfo>,
    pub child_execution_infos: HashMap<i64, ChildExecutionInfo>,
    pub request_cancel_infos: HashMap<i64, RequestCancelInfo>,
    pub signal_infos: HashMap<i64, SignalInfo>,
    pub signal_requested_ids: HashSet<String>,
    pub buffered_events: Vec<HistoryEvent>,
    pub buffered_replication_tasks: HashMap<i64, BufferedReplicationTask>,
}

impl WorkflowSnapshot {
    pub fn new(
        execution_info: WorkflowExecutionInfo,
        replication_state: Option<ReplicationState>,
    ) -> Self {
        Self {
            execution_info,
            replication_state,
            activity_infos: HashMap::new(),
            timer_infos: HashMap::new(),
            child_execution_infos: HashMap::new(),
            request_cancel_infos: HashMap::new(),
            signal_infos: HashMap::new(),
            signal_requested_ids: HashSet::new(),
            buffered_events: Vec::new(),
            buffered_replication_tasks: HashMap::new(),
        }
    }

    pub fn execution(&self) -> WorkflowExecution {
        WorkflowExecution::new(
            self.execution_info.workflow_id.clone(),
            self.execution_info.run_id,
        )
    }
}

#[derive(Debug, Clone)]
pub struct GetWorkflowExecutionRequest {
    pub domain_id: DomainId,
    pub execution: WorkflowExecution,
}

#[derive(Debug, Clone)]
pub struct GetWorkflowExecutionResponse {
    pub state: WorkflowSnapshot,
}

/// Creates a brand-new execution: its record, its current-run pointer, and
/// its initial task queue entries. The first history batch is appended
/// separately, before this request commits.
#[derive(Debug, Clone)]
pub struct CreateWorkflowExecutionRequest {
    pub execution_info: WorkflowExecutionInfo,
    pub replication_state: Option<ReplicationState>,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
}

/// The one-shot, condition-checked commit of an update session. Field for
/// field this is what one history transaction writes.
#[derive(Debug, Clone)]
pub struct UpdateWorkflowExecutionRequest {
    pub execution_info: WorkflowExecutionInfo,
    pub replication_state: Option<ReplicationState>,
    pub transfer_tasks: Vec<TransferTask>,
    pub replication_tasks: Vec<ReplicationTask>,
    pub timer_tasks: Vec<TimerTask>,
    /// The `next_event_id` observed at load (or last successful commit).
    /// The store rejects the write when the stored value differs.
    pub condition: i64,
    pub delete_timer_task: Option<TimerTask>,
    pub upsert_activity_infos: Vec<ActivityInfo>,
    pub delete_activity_infos: Vec<i64>,
    pub upsert_timer_infos: Vec<TimerInfo>,
    pub delete_timer_infos: Vec<String>,
    pub upsert_child_execution_infos: Vec<ChildExecutionInfo>,
    pub delete_child_execution_info: Option<i64>,
    pub upsert_request_cancel_infos: Vec<RequestCancelInfo>,
    pub delete_request_cancel_info: Option<i64>,
    pub upsert_signal_infos: Vec<SignalInfo>,
    pub delete_signal_info: Option<i64>,
    pub upsert_signal_requested_ids: Vec<String>,
    pub delete_signal_requested_id: Option<String>,
    pub new_buffered_events: Vec<HistoryEvent>,
    pub clear_buffered_events: bool,
    pub new_buffered_replication_task: Option<BufferedReplicationTask>,
    pub delete_buffered_replication_task: Option<i64>,
    /// When the session ended in continue-as-new, the successor run is
    /// created in the same transaction that completes this one.
    pub continue_as_new: Option<Box<CreateWorkflowExecutionRequest>>,
    pub finish_execution: bool,
    /// Seconds after which the store expires the current-run pointer for a
    /// finished execution. Only meaningful with `finish_execution`.
    pub finished_execution_ttl: i32,
}

impl UpdateWorkflowExecutionRequest {
    /// Fold this request's record deltas into a stored snapshot: the
    /// execution info, replication state, every pending-record map, and the
    /// buffered-event changes. Tasks and current-run bookkeeping are store
    /// concerns and stay outside.
    pub fn apply_record_changes(&self, snapshot: &mut WorkflowSnapshot) {
        snapshot.execution_info = self.execution_info.clone();
        snapshot.replication_state = self.replication_state.clone();

        for activity in &self.upsert_activity_infos {
            snapshot
                .activity_infos
                .insert(activity.schedule_id, activity.clone());
        }
        for schedule_id in &self.delete_activity_infos {
            snapshot.activity_infos.remove(schedule_id);
        }
        for timer in &self.upsert_timer_infos {
            snapshot.timer_infos.insert(timer.timer_id.clone(), timer.clone());
        }
        for timer_id in &self.delete_timer_infos {
            snapshot.timer_infos.remove(timer_id);
        }
        for child in &self.upsert_child_execution_infos {
            snapshot
                .child_execution_infos
                .insert(child.initiated_id, child.clone());
        }
        if let Some(initiated_id) = self.delete_child_execution_info {
            snapshot.child_execution_infos.remove(&initiated_id);
        }
        for cancel in &self.upsert_request_cancel_infos {
            snapshot
                .request_cancel_infos
                .insert(cancel.initiated_id, cancel.clone());
        }
        if let Some(initiated_id) = self.delete_request_cancel_info {
            snapshot.request_cancel_infos.remove(&initiated_id);
        }
        for signal in &self.upsert_signal_infos {
            snapshot.signal_infos.insert(signal.initiated_id, signal.clone());
        }
        if let Some(initiated_id) = self.delete_signal_info {
            snapshot.signal_infos.remove(&initiated_id);
        }
        for request_id in &self.upsert_signal_requested_ids {
            snapshot.signal_requested_ids.insert(request_id.clone());
        }
        if let Some(request_id) = &self.delete_signal_requested_id {
            snapshot.signal_requested_ids.remove(request_id);
        }

        if self.clear_buffered_events {
            snapshot.buffered_events.clear();
        }
        snapshot
            .buffered_events
            .extend(self.new_buffered_events.iter().cloned());
        if let Some(task) = &self.new_buffered_replication_task {
            snapshot
                .buffered_replication_tasks
                .insert(task.first_event_id, task.clone());
        }
        if let Some(first_event_id) = self.delete_buffered_replication_task {
            snapshot.buffered_replication_tasks.remove(&first_event_id);
        }
    }
}

/// Replaces the full mutable state of an execution under a condition.
#[derive(Debug, Clone)]
pub struct ResetWorkflowExecutionRequest {
    pub snapshot: WorkflowSnapshot,
    pub condition: i64,
}

/// Appends one serialized, contiguous event batch.
#[derive(Debug, Clone)]
pub struct AppendHistoryEventsRequest {
    pub domain_id: DomainId,
    pub execution: WorkflowExecution,
    pub transaction_id: i64,
    pub first_event_id: i64,
    pub events: Vec<u8>,
}

/// The current-run pointer for a workflow ID.
#[derive(Debug, Clone)]
pub struct CurrentExecution {
    pub run_id: RunId,
    pub expires_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller's condition no longer matches the stored record.
    #[error("condition failed: {0}")]
    ConditionFailed(String),

    #[error("workflow execution already exists: {0}")]
    AlreadyExists(String),

    #[error("workflow execution not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out: {0}")]
    Timeout(String),

    #[error("store busy: {0}")]
    Busy(String),

    #[error("internal store error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the persistence retry policy may retry this failure.
    /// Condition failures and serialization failures never are.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) | Self::Busy(_) => true,
            Self::Sqlx(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Store contract
// ============================================================================

/// The execution store every shard fronts. Implementations must apply each
/// request atomically and enforce the condition semantics documented on the
/// request types.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_workflow_execution(
        &self,
        request: &CreateWorkflowExecutionRequest,
    ) -> StoreResult<()>;

    async fn get_workflow_execution(
        &self,
        request: &GetWorkflowExecutionRequest,
    ) -> StoreResult<GetWorkflowExecutionResponse>;

    async fn update_workflow_execution(
        &self,
        request: &UpdateWorkflowExecutionRequest,
    ) -> StoreResult<()>;

    async fn reset_workflow_execution(
        &self,
        request: &ResetWorkflowExecutionRequest,
    ) -> StoreResult<()>;

    async fn append_history_events(&self, request: &AppendHistoryEventsRequest)
        -> StoreResult<()>;

    /// Resolve the current run for a workflow ID. Expired pointers (a
    /// finished execution past its retention TTL) resolve to `NotFound`.
    async fn get_current_execution(
        &self,
        domain_id: DomainId,
        workflow_id: &str,
    ) -> StoreResult<CurrentExecution>;
}
