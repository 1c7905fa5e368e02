//! In-memory mutable state for one workflow execution.
//!
//! `MutableState` is the authoritative in-memory view of a run, distinct
//! from its append-only history. Mutations accumulate in an update session;
//! closing the session produces the deltas and the new event batches that
//! one persistence transaction will commit. Buffered events (events whose
//! IDs must wait, e.g. while a decision is in flight) receive their IDs
//! only when the session close flushes them, so `next_event_id` is not
//! final until after the close.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;

use crate::history::{EventType, HistoryBuilder, HistoryEvent, FIRST_EVENT_ID};
use crate::persistence::{
    ActivityInfo, BufferedReplicationTask, ChildExecutionInfo, CloseStatus,
    CreateWorkflowExecutionRequest, DomainId, ReplicationInfo, ReplicationState, ReplicationTask,
    RequestCancelInfo, RunId, SignalInfo, TimerInfo, WorkflowExecutionInfo, WorkflowSnapshot,
    WorkflowState,
};

/// Version carried by events of domains that are not globally replicated.
pub const EMPTY_VERSION: i64 = 0;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("workflow execution is already completed")]
    AlreadyCompleted,

    #[error("run has no start history to create an execution from")]
    EmptyHistory,
}

/// Deltas accumulated since the last session close.
#[derive(Debug, Default)]
struct SessionDeltas {
    upsert_activities: HashMap<i64, ActivityInfo>,
    delete_activities: HashSet<i64>,
    upsert_timers: HashMap<String, TimerInfo>,
    delete_timers: HashSet<String>,
    upsert_children: HashMap<i64, ChildExecutionInfo>,
    delete_child: Option<i64>,
    upsert_cancels: HashMap<i64, RequestCancelInfo>,
    delete_cancel: Option<i64>,
    upsert_signals: HashMap<i64, SignalInfo>,
    delete_signal: Option<i64>,
    upsert_signal_requested: HashSet<String>,
    delete_signal_requested: Option<String>,
    new_buffered: Vec<HistoryEvent>,
    new_buffered_replication: Option<BufferedReplicationTask>,
    delete_buffered_replication: Option<i64>,
    continue_as_new: Option<Box<CreateWorkflowExecutionRequest>>,
}

/// Everything one session close hands to the commit path.
#[derive(Debug, Default)]
pub struct SessionUpdates {
    pub events_builder: HistoryBuilder,
    pub continue_as_new: Option<Box<CreateWorkflowExecutionRequest>>,
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
}

#[derive(Debug)]
pub struct MutableState {
    pub execution_info: WorkflowExecutionInfo,
    pub replication_state: Option<ReplicationState>,
    pending_activities: HashMap<i64, ActivityInfo>,
    pending_timers: HashMap<String, TimerInfo>,
    pending_children: HashMap<i64, ChildExecutionInfo>,
    pending_cancels: HashMap<i64, RequestCancelInfo>,
    pending_signals: HashMap<i64, SignalInfo>,
    signal_requested_ids: HashSet<String>,
    buffered_events: Vec<HistoryEvent>,
    buffered_replication_tasks: HashMap<i64, BufferedReplicationTask>,
    decision_pending: bool,
    history_builder: HistoryBuilder,
    session: SessionDeltas,
}

impl MutableState {
    /// A fresh run that has produced no events yet.
    pub fn new_run(
        domain_id: DomainId,
        workflow_id: impl Into<String>,
        run_id: RunId,
        workflow_type: impl Into<String>,
        task_list: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_info: WorkflowExecutionInfo {
                domain_id,
                workflow_id: workflow_id.into(),
                run_id,
                workflow_type: workflow_type.into(),
                task_list: task_list.into(),
                execution_context: Vec::new(),
                state: WorkflowState::Created,
                close_status: CloseStatus::None,
                next_event_id: FIRST_EVENT_ID,
                last_first_event_id: FIRST_EVENT_ID,
                last_processed_event_id: 0,
                start_timestamp: now,
                last_updated_timestamp: now,
            },
            replication_state: None,
            pending_activities: HashMap::new(),
            pending_timers: HashMap::new(),
            pending_children: HashMap::new(),
            pending_cancels: HashMap::new(),
            pending_signals: HashMap::new(),
            signal_requested_ids: HashSet::new(),
            buffered_events: Vec::new(),
            buffered_replication_tasks: HashMap::new(),
            decision_pending: false,
            history_builder: HistoryBuilder::new(),
            session: SessionDeltas::default(),
        }
    }

    /// Attach replication bookkeeping for a globally replicated domain.
    pub fn with_replication(mut self, start_version: i64) -> Self {
        self.replication_state = Some(ReplicationState {
            current_version: start_version,
            start_version,
            last_write_version: start_version,
            last_write_event_id: 0,
            last_replication_info: HashMap::new(),
        });
        self
    }

    /// Rehydrate from a stored snapshot.
    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Self {
        Self {
            execution_info: snapshot.execution_info,
            replication_state: snapshot.replication_state,
            pending_activities: snapshot.activity_infos,
            pending_timers: snapshot.timer_infos,
            pending_children: snapshot.child_execution_infos,
            pending_cancels: snapshot.request_cancel_infos,
            pending_signals: snapshot.signal_infos,
            signal_requested_ids: snapshot.signal_requested_ids,
            buffered_events: snapshot.buffered_events,
            buffered_replication_tasks: snapshot.buffered_replication_tasks,
            decision_pending: false,
            history_builder: HistoryBuilder::new(),
            session: SessionDeltas::default(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    pub fn last_first_event_id(&self) -> i64 {
        self.execution_info.last_first_event_id
    }

    pub fn current_version(&self) -> i64 {
        self.replication_state
            .as_ref()
            .map(|rs| rs.current_version)
            .unwrap_or(EMPTY_VERSION)
    }

    pub fn is_workflow_execution_running(&self) -> bool {
        self.execution_info.state != WorkflowState::Completed
    }

    pub fn execution(&self) -> crate::persistence::WorkflowExecution {
        crate::persistence::WorkflowExecution::new(
            self.execution_info.workflow_id.clone(),
            self.execution_info.run_id,
        )
    }

    pub fn history_builder(&self) -> &HistoryBuilder {
        &self.history_builder
    }

    pub fn get_activity(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.pending_activities.get(&schedule_id)
    }

    pub fn get_user_timer(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.pending_timers.get(timer_id)
    }

    pub fn buffered_event_count(&self) -> usize {
        self.buffered_events.len()
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Append an event with its ID assigned immediately. Returns the ID.
    pub fn add_event(&mut self, event_type: EventType, attributes: Value) -> Result<i64, StateError> {
        if !self.is_workflow_execution_running() {
            return Err(StateError::AlreadyCompleted);
        }
        let event_id = self.execution_info.next_event_id;
        self.execution_info.next_event_id += 1;
        self.history_builder.push(HistoryEvent::new(
            event_id,
            event_type,
            self.current_version(),
            attributes,
        ));
        Ok(event_id)
    }

    /// Record an event whose ID assignment must wait. While a decision is
    /// in flight the event stays buffered (and is persisted buffered);
    /// otherwise it is flushed, with a real ID, on session close.
    pub fn buffer_event(&mut self, event_type: EventType, attributes: Value) -> Result<(), StateError> {
        if !self.is_workflow_execution_running() {
            return Err(StateError::AlreadyCompleted);
        }
        self.session.new_buffered.push(HistoryEvent::new(
            0,
            event_type,
            self.current_version(),
            attributes,
        ));
        Ok(())
    }

    /// Append a speculative decision event. Transient events ride along in
    /// a separate batch and never advance `next_event_id`.
    pub fn add_transient_event(&mut self, event_type: EventType, attributes: Value) -> i64 {
        let event_id =
            self.execution_info.next_event_id + self.history_builder.transient_history().len() as i64;
        self.history_builder.push_transient(HistoryEvent::new(
            event_id,
            event_type,
            self.current_version(),
            attributes,
        ));
        event_id
    }

    pub fn set_decision_pending(&mut self, pending: bool) {
        self.decision_pending = pending;
    }

    pub fn add_started_event(&mut self, attributes: Value) -> Result<i64, StateError> {
        let event_id = self.add_event(EventType::WorkflowExecutionStarted, attributes)?;
        self.execution_info.state = WorkflowState::Running;
        Ok(event_id)
    }

    pub fn add_completed_event(&mut self, result: Value) -> Result<i64, StateError> {
        let event_id =
            self.add_event(EventType::WorkflowExecutionCompleted, json!({ "result": result }))?;
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = CloseStatus::Completed;
        Ok(event_id)
    }

    pub fn add_failed_event(&mut self, reason: impl Into<String>) -> Result<i64, StateError> {
        let event_id = self.add_event(
            EventType::WorkflowExecutionFailed,
            json!({ "reason": reason.into() }),
        )?;
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = CloseStatus::Failed;
        Ok(event_id)
    }

    /// Close this run as continued-as-new and stage the successor run's
    /// creation for the same transaction. The successor must already carry
    /// its start history; its first batch is appended before the commit.
    pub fn add_continued_as_new_event(&mut self, successor: &MutableState) -> Result<i64, StateError> {
        if successor.history_builder.first_event().is_none() {
            return Err(StateError::EmptyHistory);
        }
        let event_id = self.add_event(
            EventType::WorkflowExecutionContinuedAsNew,
            json!({ "new_run_id": successor.execution_info.run_id.to_string() }),
        )?;
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = CloseStatus::ContinuedAsNew;
        self.session.continue_as_new = Some(Box::new(CreateWorkflowExecutionRequest {
            execution_info: successor.execution_info.clone(),
            replication_state: successor.replication_state.clone(),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
        }));
        Ok(event_id)
    }

    pub fn set_execution_context(&mut self, context: Vec<u8>) {
        self.execution_info.execution_context = context;
    }

    // ========================================================================
    // Pending records
    // ========================================================================

    pub fn update_activity(&mut self, info: ActivityInfo) {
        self.session.upsert_activities.insert(info.schedule_id, info.clone());
        self.pending_activities.insert(info.schedule_id, info);
    }

    pub fn delete_activity(&mut self, schedule_id: i64) {
        self.pending_activities.remove(&schedule_id);
        self.session.upsert_activities.remove(&schedule_id);
        self.session.delete_activities.insert(schedule_id);
    }

    pub fn update_user_timer(&mut self, info: TimerInfo) {
        self.session.upsert_timers.insert(info.timer_id.clone(), info.clone());
        self.pending_timers.insert(info.timer_id.clone(), info);
    }

    pub fn delete_user_timer(&mut self, timer_id: &str) {
        self.pending_timers.remove(timer_id);
        self.session.upsert_timers.remove(timer_id);
        self.session.delete_timers.insert(timer_id.to_string());
    }

    pub fn update_child_execution(&mut self, info: ChildExecutionInfo) {
        self.session.upsert_children.insert(info.initiated_id, info.clone());
        self.pending_children.insert(info.initiated_id, info);
    }

    pub fn delete_child_execution(&mut self, initiated_id: i64) {
        self.pending_children.remove(&initiated_id);
        self.session.upsert_children.remove(&initiated_id);
        self.session.delete_child = Some(initiated_id);
    }

    pub fn update_request_cancel(&mut self, info: RequestCancelInfo) {
        self.session.upsert_cancels.insert(info.initiated_id, info.clone());
        self.pending_cancels.insert(info.initiated_id, info);
    }

    pub fn delete_request_cancel(&mut self, initiated_id: i64) {
        self.pending_cancels.remove(&initiated_id);
        self.session.upsert_cancels.remove(&initiated_id);
        self.session.delete_cancel = Some(initiated_id);
    }

    pub fn update_signal(&mut self, info: SignalInfo) {
        self.session.upsert_signals.insert(info.initiated_id, info.clone());
        self.pending_signals.insert(info.initiated_id, info);
    }

    pub fn delete_signal(&mut self, initiated_id: i64) {
        self.pending_signals.remove(&initiated_id);
        self.session.upsert_signals.remove(&initiated_id);
        self.session.delete_signal = Some(initiated_id);
    }

    pub fn add_signal_requested(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.signal_requested_ids.insert(request_id.clone());
        self.session.upsert_signal_requested.insert(request_id);
    }

    pub fn delete_signal_requested(&mut self, request_id: &str) {
        self.signal_requested_ids.remove(request_id);
        self.session.upsert_signal_requested.remove(request_id);
        self.session.delete_signal_requested = Some(request_id.to_string());
    }

    /// Stash an out-of-order replication batch for later apply.
    pub fn buffer_replication_task(&mut self, task: BufferedReplicationTask) {
        self.buffered_replication_tasks.insert(task.first_event_id, task.clone());
        self.session.new_buffered_replication = Some(task);
    }

    pub fn remove_buffered_replication_task(&mut self, first_event_id: i64) {
        self.buffered_replication_tasks.remove(&first_event_id);
        self.session.delete_buffered_replication = Some(first_event_id);
    }

    pub fn get_buffered_replication_task(&self, first_event_id: i64) -> Option<&BufferedReplicationTask> {
        self.buffered_replication_tasks.get(&first_event_id)
    }

    // ========================================================================
    // Replication state
    // ========================================================================

    pub fn update_replication_state_version(&mut self, version: i64) {
        if let Some(rs) = &mut self.replication_state {
            rs.current_version = version;
        }
    }

    /// Record the write watermark after a session close. `source_cluster`
    /// is empty for locally generated events and names the origin cluster
    /// when applying replicated ones.
    pub fn update_replication_state_last_event_id(
        &mut self,
        source_cluster: &str,
        last_write_version: i64,
        last_event_id: i64,
    ) {
        if let Some(rs) = &mut self.replication_state {
            rs.last_write_version = last_write_version;
            rs.last_write_event_id = last_event_id;
            if !source_cluster.is_empty() {
                rs.last_replication_info.insert(
                    source_cluster.to_string(),
                    ReplicationInfo {
                        version: last_write_version,
                        last_event_id,
                    },
                );
            }
        }
    }

    /// The replication task shipping everything this transaction wrote.
    /// `None` for executions without replication state.
    pub fn create_replication_task(&self) -> Option<ReplicationTask> {
        self.replication_state.as_ref().map(|rs| ReplicationTask {
            first_event_id: self.execution_info.last_first_event_id,
            next_event_id: self.execution_info.next_event_id,
            version: rs.current_version,
            last_replication_info: rs.last_replication_info.clone(),
        })
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Close the update session: flush buffered events (unless a decision
    /// is in flight), and hand back every accumulated delta plus the event
    /// batches to append. `next_event_id` is final only after this returns.
    pub fn close_update_session(&mut self) -> Result<SessionUpdates, StateError> {
        let mut new_buffered_events = Vec::new();
        let mut clear_buffered_events = false;
        if self.decision_pending {
            new_buffered_events = std::mem::take(&mut self.session.new_buffered);
            self.buffered_events.extend(new_buffered_events.iter().cloned());
        } else {
            clear_buffered_events = self.flush_buffered_events();
        }

        let deltas = std::mem::take(&mut self.session);
        let events_builder = std::mem::take(&mut self.history_builder);

        Ok(SessionUpdates {
            events_builder,
            continue_as_new: deltas.continue_as_new,
            upsert_activity_infos: deltas.upsert_activities.into_values().collect(),
            delete_activity_infos: deltas.delete_activities.into_iter().collect(),
            upsert_timer_infos: deltas.upsert_timers.into_values().collect(),
            delete_timer_infos: deltas.delete_timers.into_iter().collect(),
            upsert_child_execution_infos: deltas.upsert_children.into_values().collect(),
            delete_child_execution_info: deltas.delete_child,
            upsert_request_cancel_infos: deltas.upsert_cancels.into_values().collect(),
            delete_request_cancel_info: deltas.delete_cancel,
            upsert_signal_infos: deltas.upsert_signals.into_values().collect(),
            delete_signal_info: deltas.delete_signal,
            upsert_signal_requested_ids: deltas.upsert_signal_requested.into_iter().collect(),
            delete_signal_requested_id: deltas.delete_signal_requested,
            new_buffered_events,
            clear_buffered_events,
            new_buffered_replication_task: deltas.new_buffered_replication,
            delete_buffered_replication_task: deltas.delete_buffered_replication,
        })
    }

    /// Assign IDs to every buffered event, in arrival order, and move them
    /// into the pending history batch. Returns whether previously persisted
    /// buffered events existed (so the store can clear them).
    fn flush_buffered_events(&mut self) -> bool {
        let had_persisted = !self.buffered_events.is_empty();
        let mut pending: Vec<HistoryEvent> = self.buffered_events.drain(..).collect();
        pending.append(&mut self.session.new_buffered);
        for mut event in pending {
            event.event_id = self.execution_info.next_event_id;
            self.execution_info.next_event_id += 1;
            self.history_builder.push(event);
        }
        had_persisted
    }

    /// Full durable state, for condition-checked replacement.
    pub fn reset_snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            execution_info: self.execution_info.clone(),
            replication_state: self.replication_state.clone(),
            activity_infos: self.pending_activities.clone(),
            timer_infos: self.pending_timers.clone(),
            child_execution_infos: self.pending_children.clone(),
            request_cancel_infos: self.pending_cancels.clone(),
            signal_infos: self.pending_signals.clone(),
            signal_requested_ids: self.signal_requested_ids.clone(),
            buffered_events: self.buffered_events.clone(),
            buffered_replication_tasks: self.buffered_replication_tasks.clone(),
        }
    }
}
