//! In-memory execution store.
//!
//! Mirrors the production store's condition semantics without a database:
//! used by the test suites and for local single-process development. State
//! lives behind one mutex; every operation is atomic by construction.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::history::{HistoryBuilder, HistoryEvent};
use crate::persistence::{
    AppendHistoryEventsRequest, CreateWorkflowExecutionRequest, CurrentExecution, DomainId,
    ExecutionStore, GetWorkflowExecutionRequest, GetWorkflowExecutionResponse,
    ReplicationTask, ResetWorkflowExecutionRequest, RunId, StoreError, StoreResult, TimerTask,
    TransferTask, UpdateWorkflowExecutionRequest, WorkflowExecution, WorkflowSnapshot,
    WorkflowState,
};

type ExecutionKey = (DomainId, String, RunId);

/// One appended batch, as the store keeps it.
#[derive(Debug, Clone)]
pub struct StoredHistoryBatch {
    pub first_event_id: i64,
    pub transaction_id: i64,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    executions: HashMap<ExecutionKey, WorkflowSnapshot>,
    current: HashMap<(DomainId, String), CurrentExecution>,
    history: HashMap<ExecutionKey, Vec<StoredHistoryBatch>>,
    transfer_tasks: Vec<TransferTask>,
    timer_tasks: Vec<TimerTask>,
    replication_tasks: Vec<ReplicationTask>,
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    state: Mutex<MemoryState>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(domain_id: DomainId, execution: &WorkflowExecution) -> ExecutionKey {
        (domain_id, execution.workflow_id.clone(), execution.run_id)
    }

    // ========================================================================
    // Inspection helpers (tests and local tooling)
    // ========================================================================

    pub fn history_batches(
        &self,
        domain_id: DomainId,
        execution: &WorkflowExecution,
    ) -> Vec<StoredHistoryBatch> {
        let state = self.state.lock().expect("store lock poisoned");
        state
            .history
            .get(&Self::key(domain_id, execution))
            .cloned()
            .unwrap_or_default()
    }

    /// All appended events in event-ID order, decoded.
    pub fn decoded_history(
        &self,
        domain_id: DomainId,
        execution: &WorkflowExecution,
    ) -> Vec<HistoryEvent> {
        let mut batches = self.history_batches(domain_id, execution);
        batches.sort_by_key(|b| b.first_event_id);
        batches
            .iter()
            .filter_map(|b| HistoryBuilder::deserialize_events(&b.data).ok())
            .flatten()
            .collect()
    }

    pub fn transfer_tasks(&self) -> Vec<TransferTask> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .transfer_tasks
            .clone()
    }

    pub fn timer_tasks(&self) -> Vec<TimerTask> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .timer_tasks
            .clone()
    }

    pub fn replication_tasks(&self) -> Vec<ReplicationTask> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .replication_tasks
            .clone()
    }

    pub fn stored_snapshot(
        &self,
        domain_id: DomainId,
        execution: &WorkflowExecution,
    ) -> Option<WorkflowSnapshot> {
        let state = self.state.lock().expect("store lock poisoned");
        state.executions.get(&Self::key(domain_id, execution)).cloned()
    }

    /// The current-run pointer without the expiry filter applied.
    pub fn current_execution_raw(
        &self,
        domain_id: DomainId,
        workflow_id: &str,
    ) -> Option<CurrentExecution> {
        let state = self.state.lock().expect("store lock poisoned");
        state.current.get(&(domain_id, workflow_id.to_string())).cloned()
    }

    /// Move the stored `next_event_id` out from under a caller. Tests use
    /// this to simulate a concurrent writer.
    pub fn set_next_event_id(
        &self,
        domain_id: DomainId,
        execution: &WorkflowExecution,
        next_event_id: i64,
    ) {
        let mut state = self.state.lock().expect("store lock poisoned");
        if let Some(snapshot) = state.executions.get_mut(&Self::key(domain_id, execution)) {
            snapshot.execution_info.next_event_id = next_event_id;
        }
    }

    /// Overwrite the stored execution-context blob; tests use this to
    /// verify that a context reloads after an error.
    pub fn set_execution_context(
        &self,
        domain_id: DomainId,
        execution: &WorkflowExecution,
        context: Vec<u8>,
    ) {
        let mut state = self.state.lock().expect("store lock poisoned");
        if let Some(snapshot) = state.executions.get_mut(&Self::key(domain_id, execution)) {
            snapshot.execution_info.execution_context = context;
        }
    }
}

fn apply_create(state: &mut MemoryState, request: &CreateWorkflowExecutionRequest) -> StoreResult<()> {
    let info = &request.execution_info;
    let domain_id = info.domain_id;
    let current_key = (domain_id, info.workflow_id.clone());

    if let Some(current) = state.current.get(&current_key) {
        let running = state
            .executions
            .get(&(domain_id, info.workflow_id.clone(), current.run_id))
            .map(|snapshot| snapshot.execution_info.state != WorkflowState::Completed)
            .unwrap_or(false);
        let expired = current
            .expires_at
            .map(|expires| expires <= Utc::now())
            .unwrap_or(false);
        if running && !expired {
            return Err(StoreError::AlreadyExists(format!(
                "{}/{} already has running run {}",
                domain_id, info.workflow_id, current.run_id
            )));
        }
    }

    let key = (domain_id, info.workflow_id.clone(), info.run_id);
    state.executions.insert(
        key,
        WorkflowSnapshot::new(info.clone(), request.replication_state.clone()),
    );
    state.current.insert(
        current_key,
        CurrentExecution {
            run_id: info.run_id,
            expires_at: None,
        },
    );
    state.transfer_tasks.extend(request.transfer_tasks.iter().cloned());
    state.timer_tasks.extend(request.timer_tasks.iter().cloned());
    Ok(())
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_workflow_execution(
        &self,
        request: &CreateWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        apply_create(&mut state, request)
    }

    async fn get_workflow_execution(
        &self,
        request: &GetWorkflowExecutionRequest,
    ) -> StoreResult<GetWorkflowExecutionResponse> {
        let state = self.state.lock().expect("store lock poisoned");
        let key = Self::key(request.domain_id, &request.execution);
        let snapshot = state
            .executions
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(request.execution.to_string()))?;
        Ok(GetWorkflowExecutionResponse { state: snapshot })
    }

    async fn update_workflow_execution(
        &self,
        request: &UpdateWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        let info = &request.execution_info;
        let key = (info.domain_id, info.workflow_id.clone(), info.run_id);

        let snapshot = state
            .executions
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", info.workflow_id, info.run_id)))?;

        if snapshot.execution_info.next_event_id != request.condition {
            return Err(StoreError::ConditionFailed(format!(
                "expected next_event_id {}, stored {}",
                request.condition, snapshot.execution_info.next_event_id
            )));
        }

        request.apply_record_changes(snapshot);

        state.transfer_tasks.extend(request.transfer_tasks.iter().cloned());
        state
            .replication_tasks
            .extend(request.replication_tasks.iter().cloned());
        state.timer_tasks.extend(request.timer_tasks.iter().cloned());
        if let Some(doomed) = &request.delete_timer_task {
            if let Some(pos) = state
                .timer_tasks
                .iter()
                .position(|t| t.fire_at == doomed.fire_at && t.payload == doomed.payload)
            {
                state.timer_tasks.remove(pos);
            }
        }

        if request.finish_execution {
            let current_key = (info.domain_id, info.workflow_id.clone());
            if let Some(current) = state.current.get_mut(&current_key) {
                if current.run_id == info.run_id {
                    current.expires_at =
                        Some(Utc::now() + Duration::seconds(request.finished_execution_ttl as i64));
                }
            }
        }

        if let Some(create) = &request.continue_as_new {
            apply_create(&mut state, create)?;
        }

        Ok(())
    }

    async fn reset_workflow_execution(
        &self,
        request: &ResetWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        let info = &request.snapshot.execution_info;
        let key = (info.domain_id, info.workflow_id.clone(), info.run_id);
        let existing = state
            .executions
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", info.workflow_id, info.run_id)))?;
        if existing.execution_info.next_event_id != request.condition {
            return Err(StoreError::ConditionFailed(format!(
                "expected next_event_id {}, stored {}",
                request.condition, existing.execution_info.next_event_id
            )));
        }
        *existing = request.snapshot.clone();
        Ok(())
    }

    async fn append_history_events(
        &self,
        request: &AppendHistoryEventsRequest,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        let key = Self::key(request.domain_id, &request.execution);
        let batches = state.history.entry(key).or_default();

        if let Some(existing) = batches
            .iter_mut()
            .find(|b| b.first_event_id == request.first_event_id)
        {
            // A retried transaction may overwrite its predecessor, never
            // the other way around.
            if existing.transaction_id >= request.transaction_id {
                return Err(StoreError::ConditionFailed(format!(
                    "batch at event {} already written by transaction {}",
                    request.first_event_id, existing.transaction_id
                )));
            }
            existing.transaction_id = request.transaction_id;
            existing.data = request.events.clone();
            return Ok(());
        }

        batches.push(StoredHistoryBatch {
            first_event_id: request.first_event_id,
            transaction_id: request.transaction_id,
            data: request.events.clone(),
        });
        Ok(())
    }

    async fn get_current_execution(
        &self,
        domain_id: DomainId,
        workflow_id: &str,
    ) -> StoreResult<CurrentExecution> {
        let state = self.state.lock().expect("store lock poisoned");
        let current = state
            .current
            .get(&(domain_id, workflow_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(workflow_id.to_string()))?;
        if let Some(expires) = current.expires_at {
            if expires <= Utc::now() {
                return Err(StoreError::NotFound(format!(
                    "{workflow_id} (current run expired)"
                )));
            }
        }
        Ok(current)
    }
}
