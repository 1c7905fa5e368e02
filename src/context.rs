//! The workflow execution context: transactional coordinator between one
//! run's in-memory mutable state and the execution store.
//!
//! Each (domain, workflow, run) has exactly one context on its owning
//! shard. Callers take the context's lock, load the mutable state, mutate
//! it through its own API, and commit. The lock spans the whole
//! load → mutate → commit window; combined with the store's optimistic
//! condition that makes the context a single-writer object.
//!
//! Commit ordering is load-bearing:
//! 1. close the update session (flushes buffered events, finalizing
//!    `next_event_id`)
//! 2. stamp the replication write watermark
//! 3. append history batches (transient first), then
//! 4. write the execution record, conditioned on the `next_event_id`
//!    observed at load.
//! History may land without its execution update (a crash or conflict
//! between 3 and 4); the store's transaction-ID reconciliation absorbs the
//! duplicate append on retry.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, warn};

use crate::domain::DomainError;
use crate::history::{HistoryBuilder, HistoryEvent};
use crate::mutable_state::{MutableState, StateError};
use crate::notifications::HistoryEventNotification;
use crate::persistence::{
    AppendHistoryEventsRequest, DomainId, ExecutionStore, GetWorkflowExecutionRequest,
    GetWorkflowExecutionResponse, ResetWorkflowExecutionRequest, StoreError, TimerTask,
    TransferTask, UpdateWorkflowExecutionRequest, WorkflowExecution,
};
use crate::retry;
use crate::shard::ShardContext;

const SECONDS_IN_DAY: i32 = 86_400;

#[derive(Debug, Error)]
pub enum WorkflowContextError {
    /// The execution changed underneath the caller. Reload and retry the
    /// decision; never match on the message.
    #[error("workflow execution was modified concurrently")]
    Conflict,

    #[error("no mutable state loaded for this context")]
    StateNotLoaded,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("history serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A batch of events replicated from another cluster, to be applied
/// verbatim.
#[derive(Debug, Clone)]
pub struct ReplicateEventsRequest {
    pub source_cluster: String,
    pub version: i64,
    pub history: Vec<HistoryEvent>,
}

#[derive(Debug)]
struct ContextInner {
    mutable_state: Option<MutableState>,
    update_condition: i64,
    delete_timer_task: Option<TimerTask>,
}

/// Owner of one execution's cached mutable state. Obtain a
/// [`LockedContext`] through [`lock`](Self::lock) to operate on it.
pub struct WorkflowExecutionContext {
    domain_id: DomainId,
    execution: WorkflowExecution,
    shard: Arc<dyn ShardContext>,
    store: Arc<dyn ExecutionStore>,
    inner: Mutex<ContextInner>,
}

impl WorkflowExecutionContext {
    pub fn new(
        domain_id: DomainId,
        execution: WorkflowExecution,
        shard: Arc<dyn ShardContext>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            domain_id,
            execution,
            shard,
            store,
            inner: Mutex::new(ContextInner {
                mutable_state: None,
                update_condition: 0,
                delete_timer_task: None,
            }),
        }
    }

    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    /// Serialise on this execution. All loads and commits happen through
    /// the returned guard, so the cached state can never be observed (or
    /// mutated) mid-transaction.
    pub async fn lock(&self) -> LockedContext<'_> {
        LockedContext {
            ctx: self,
            inner: self.inner.lock().await,
        }
    }
}

/// Exclusive handle on a [`WorkflowExecutionContext`].
pub struct LockedContext<'a> {
    ctx: &'a WorkflowExecutionContext,
    inner: MutexGuard<'a, ContextInner>,
}

impl LockedContext<'_> {
    /// The optimistic-concurrency token the next commit will carry.
    pub fn update_condition(&self) -> i64 {
        self.inner.update_condition
    }

    /// The loaded mutable state. Errors if [`load`](Self::load) has not
    /// run (or the cache was discarded by a failed commit).
    pub fn mutable_state(&mut self) -> Result<&mut MutableState, WorkflowContextError> {
        self.inner
            .mutable_state
            .as_mut()
            .ok_or(WorkflowContextError::StateNotLoaded)
    }

    /// Return the cached mutable state, fetching from the store when the
    /// cache is empty. Also refreshes the replication failover version for
    /// running executions of global domains.
    pub async fn load(&mut self) -> Result<&mut MutableState, WorkflowContextError> {
        if self.inner.mutable_state.is_none() {
            let request = GetWorkflowExecutionRequest {
                domain_id: self.ctx.domain_id,
                execution: self.ctx.execution.clone(),
            };
            let response = match self.get_with_retry(&request).await {
                Ok(response) => response,
                Err(err) => {
                    if err.is_transient() {
                        warn!(
                            workflow_id = %self.ctx.execution.workflow_id,
                            run_id = %self.ctx.execution.run_id,
                            error = %err,
                            "transient store failure loading workflow execution"
                        );
                    }
                    return Err(err.into());
                }
            };
            let state = MutableState::from_snapshot(response.state);
            self.inner.update_condition = state.next_event_id();
            self.inner.mutable_state = Some(state);
        }
        self.update_version().await?;
        self.mutable_state()
    }

    /// Drop the cached mutable state. The next operation reloads from the
    /// store.
    pub fn clear(&mut self) {
        self.inner.mutable_state = None;
    }

    /// Commit the open update session: history events, tasks, and record
    /// deltas, in one condition-checked transaction.
    pub async fn update(
        &mut self,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        transaction_id: i64,
    ) -> Result<(), WorkflowContextError> {
        // Replication tasks are only generated for global domains.
        let (create_replication_task, last_write_version) = {
            let state = self.mutable_state()?;
            (state.replication_state.is_some(), state.current_version())
        };
        self.commit(
            None,
            transfer_tasks,
            timer_tasks,
            create_replication_task,
            "",
            last_write_version,
            transaction_id,
        )
        .await
    }

    /// [`update`](Self::update), carrying a new decider context blob.
    pub async fn update_with_context(
        &mut self,
        context: Vec<u8>,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        transaction_id: i64,
    ) -> Result<(), WorkflowContextError> {
        self.mutable_state()?.set_execution_context(context);
        self.update(transfer_tasks, timer_tasks, transaction_id).await
    }

    /// [`update`](Self::update), also deleting one queued timer task. The
    /// deletion rides on this commit only.
    pub async fn update_with_delete_timer(
        &mut self,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        delete_timer_task: TimerTask,
        transaction_id: i64,
    ) -> Result<(), WorkflowContextError> {
        self.inner.delete_timer_task = Some(delete_timer_task);
        self.update(transfer_tasks, timer_tasks, transaction_id).await
    }

    /// Apply a batch of remotely generated events. The batch is
    /// authoritative: `next_event_id` jumps past it and the supplied events
    /// are appended as-is instead of anything generated locally.
    pub async fn replicate(
        &mut self,
        request: ReplicateEventsRequest,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        last_event_id: i64,
        transaction_id: i64,
    ) -> Result<(), WorkflowContextError> {
        let ReplicateEventsRequest {
            source_cluster,
            version,
            history,
        } = request;
        self.mutable_state()?.execution_info.next_event_id = last_event_id + 1;
        let builder = HistoryBuilder::from_events(history);
        self.commit(
            Some(builder),
            transfer_tasks,
            timer_tasks,
            false,
            &source_cluster,
            version,
            transaction_id,
        )
        .await
    }

    /// Finish the current run as continued-as-new and start its successor.
    ///
    /// Step 1 appends the successor's start history; step 2 commits the
    /// current run's terminal update, which also creates the successor's
    /// execution record. If step 2 fails the successor history stays
    /// behind with no execution record: the current-run pointer never
    /// moved, so reconciliation prunes it on the next start attempt.
    pub async fn continue_as_new(
        &mut self,
        context: Vec<u8>,
        new_state: MutableState,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        transaction_id: i64,
    ) -> Result<(), WorkflowContextError> {
        self.mutable_state()?.add_continued_as_new_event(&new_state)?;
        self.start_new_run(&new_state, transaction_id).await?;

        let new_run_id = new_state.execution_info.run_id;
        let result = self
            .update_with_context(context, transfer_tasks, timer_tasks, transaction_id)
            .await;
        if let Err(err) = &result {
            warn!(
                workflow_id = %self.ctx.execution.workflow_id,
                run_id = %self.ctx.execution.run_id,
                new_run_id = %new_run_id,
                error = %err,
                "continue-as-new failed after appending successor history; orphaned start batch awaits reconciliation"
            );
        }
        result
    }

    /// Replication-path continue-as-new: append the successor's start
    /// history only. The old run's terminal update arrives as its own
    /// replicated batch.
    pub async fn replicate_continue_as_new(
        &mut self,
        new_state: &MutableState,
        transaction_id: i64,
    ) -> Result<(), WorkflowContextError> {
        self.start_new_run(new_state, transaction_id).await
    }

    /// Replace the full mutable state under the current condition, then
    /// reload from the store.
    pub async fn reset(
        &mut self,
        reset_state: &MutableState,
    ) -> Result<&mut MutableState, WorkflowContextError> {
        let request = ResetWorkflowExecutionRequest {
            snapshot: reset_state.reset_snapshot(),
            condition: self.inner.update_condition,
        };
        self.ctx.shard.reset_workflow_execution(&request).await?;
        self.clear();
        self.load().await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Refresh the mutable state's failover version from the domain cache.
    /// Skipped for local domains, executions without replication state, and
    /// finished executions (a terminal run keeps the version it closed
    /// with).
    async fn update_version(&mut self) -> Result<(), WorkflowContextError> {
        if !self.ctx.shard.cluster_metadata().is_global_domain_enabled() {
            return Ok(());
        }
        let domain_id = match self.inner.mutable_state.as_ref() {
            Some(state) if state.replication_state.is_some() => {
                if !state.is_workflow_execution_running() {
                    return Ok(());
                }
                state.execution_info.domain_id
            }
            _ => return Ok(()),
        };
        let entry = self.ctx.shard.domain_cache().get_domain_by_id(domain_id).await?;
        if let Some(state) = self.inner.mutable_state.as_mut() {
            state.update_replication_state_version(entry.failover_version());
        }
        Ok(())
    }

    async fn commit(
        &mut self,
        builder: Option<HistoryBuilder>,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        create_replication_task: bool,
        source_cluster: &str,
        last_write_version: i64,
        transaction_id: i64,
    ) -> Result<(), WorkflowContextError> {
        let result = self
            .commit_inner(
                builder,
                transfer_tasks,
                timer_tasks,
                create_replication_task,
                source_cluster,
                last_write_version,
                transaction_id,
            )
            .await;
        // Any failure leaves the in-memory view unverifiable against the
        // store; the next operation must reload.
        if result.is_err() {
            self.clear();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_inner(
        &mut self,
        external_builder: Option<HistoryBuilder>,
        mut transfer_tasks: Vec<TransferTask>,
        mut timer_tasks: Vec<TimerTask>,
        create_replication_task: bool,
        source_cluster: &str,
        last_write_version: i64,
        transaction_id: i64,
    ) -> Result<(), WorkflowContextError> {
        let mut updates = self.mutable_state()?.close_update_session()?;

        // The watermark must be read after the session close: flushing
        // buffered events assigns their IDs and moves next_event_id.
        {
            let state = self.mutable_state()?;
            if state.replication_state.is_some() {
                let last_event_id = state.next_event_id() - 1;
                state.update_replication_state_last_event_id(
                    source_cluster,
                    last_write_version,
                    last_event_id,
                );
            }
        }

        // The replication apply path brings its own builder; local updates
        // use the one the session produced.
        let builder = match external_builder {
            Some(builder) => builder,
            None => std::mem::take(&mut updates.events_builder),
        };

        if let Some(first_event_id) = builder.first_event().map(|e| e.event_id) {
            if builder.has_transient_events() {
                self.append_history_events(builder.transient_history(), transaction_id)
                    .await?;
            }
            self.append_history_events(builder.history(), transaction_id)
                .await?;
            self.mutable_state()?.execution_info.last_first_event_id = first_event_id;
        }

        let mut finish_execution = false;
        let mut finished_execution_ttl = 0;
        {
            let (is_running, domain_id) = {
                let state = self.mutable_state()?;
                (
                    state.is_workflow_execution_running(),
                    state.execution_info.domain_id,
                )
            };
            if !is_running {
                // The run closed in this transaction: let the store expire
                // the current-run pointer after the domain's retention.
                finish_execution = true;
                let entry = self.ctx.shard.domain_cache().get_domain_by_id(domain_id).await?;
                finished_execution_ttl = entry.retention_days() * SECONDS_IN_DAY;
            }
        }

        let mut replication_tasks = Vec::new();
        if create_replication_task {
            if let Some(task) = self.mutable_state()?.create_replication_task() {
                replication_tasks.push(task);
            }
        }

        let current_version = self.mutable_state()?.current_version();
        for task in &mut transfer_tasks {
            task.version = current_version;
        }
        for task in &mut timer_tasks {
            task.version = current_version;
        }

        let request = {
            let inner = &mut *self.inner;
            let state = inner
                .mutable_state
                .as_ref()
                .ok_or(WorkflowContextError::StateNotLoaded)?;
            UpdateWorkflowExecutionRequest {
                execution_info: state.execution_info.clone(),
                replication_state: state.replication_state.clone(),
                transfer_tasks,
                replication_tasks,
                timer_tasks,
                condition: inner.update_condition,
                delete_timer_task: inner.delete_timer_task.take(),
                upsert_activity_infos: updates.upsert_activity_infos,
                delete_activity_infos: updates.delete_activity_infos,
                upsert_timer_infos: updates.upsert_timer_infos,
                delete_timer_infos: updates.delete_timer_infos,
                upsert_child_execution_infos: updates.upsert_child_execution_infos,
                delete_child_execution_info: updates.delete_child_execution_info,
                upsert_request_cancel_infos: updates.upsert_request_cancel_infos,
                delete_request_cancel_info: updates.delete_request_cancel_info,
                upsert_signal_infos: updates.upsert_signal_infos,
                delete_signal_info: updates.delete_signal_info,
                upsert_signal_requested_ids: updates.upsert_signal_requested_ids,
                delete_signal_requested_id: updates.delete_signal_requested_id,
                new_buffered_events: updates.new_buffered_events,
                clear_buffered_events: updates.clear_buffered_events,
                new_buffered_replication_task: updates.new_buffered_replication_task,
                delete_buffered_replication_task: updates.delete_buffered_replication_task,
                continue_as_new: updates.continue_as_new,
                finish_execution,
                finished_execution_ttl,
            }
        };

        match self.update_with_retry(&request).await {
            Ok(()) => {}
            Err(StoreError::ConditionFailed(_)) => return Err(WorkflowContextError::Conflict),
            Err(err) => {
                error!(
                    workflow_id = %self.ctx.execution.workflow_id,
                    run_id = %self.ctx.execution.run_id,
                    update_condition = self.inner.update_condition,
                    error = %err,
                    "workflow execution update failed"
                );
                return Err(err.into());
            }
        }

        let (next_event_id, last_first_event_id, is_running) = {
            let state = self.mutable_state()?;
            state.execution_info.last_updated_timestamp = Utc::now();
            (
                state.next_event_id(),
                state.last_first_event_id(),
                state.is_workflow_execution_running(),
            )
        };
        self.inner.update_condition = next_event_id;

        self.ctx
            .shard
            .notify_new_history_event(HistoryEventNotification::new(
                self.ctx.domain_id,
                self.ctx.execution.clone(),
                last_first_event_id,
                next_event_id,
                is_running,
            ));

        Ok(())
    }

    /// Serialize and append one batch. Transient and main batches both come
    /// through here, sharing the caller's transaction ID.
    async fn append_history_events(
        &mut self,
        events: &[HistoryEvent],
        transaction_id: i64,
    ) -> Result<(), WorkflowContextError> {
        let Some(first_event) = events.first() else {
            return Ok(());
        };
        let serialized = match HistoryBuilder::serialize_events(events) {
            Ok(serialized) => serialized,
            Err(err) => {
                error!(
                    workflow_id = %self.ctx.execution.workflow_id,
                    run_id = %self.ctx.execution.run_id,
                    error = %err,
                    "unable to serialize history batch for update"
                );
                return Err(err.into());
            }
        };

        let request = AppendHistoryEventsRequest {
            domain_id: self.ctx.domain_id,
            execution: self.ctx.execution.clone(),
            transaction_id,
            first_event_id: first_event.event_id,
            events: serialized,
        };
        match self.ctx.shard.append_history_events(&request).await {
            Ok(()) => Ok(()),
            Err(StoreError::ConditionFailed(_)) => Err(WorkflowContextError::Conflict),
            Err(err) => {
                error!(
                    workflow_id = %self.ctx.execution.workflow_id,
                    run_id = %self.ctx.execution.run_id,
                    update_condition = self.inner.update_condition,
                    error = %err,
                    "failed to append history events"
                );
                Err(err.into())
            }
        }
    }

    /// Append a successor run's start history under its own execution key.
    async fn start_new_run(
        &mut self,
        new_state: &MutableState,
        transaction_id: i64,
    ) -> Result<(), WorkflowContextError> {
        let events = new_state.history_builder().history();
        let Some(first_event) = events.first() else {
            return Err(StateError::EmptyHistory.into());
        };
        let serialized = match HistoryBuilder::serialize_events(events) {
            Ok(serialized) => serialized,
            Err(err) => {
                error!(
                    workflow_id = %new_state.execution_info.workflow_id,
                    run_id = %new_state.execution_info.run_id,
                    error = %err,
                    "unable to serialize start history for successor run"
                );
                return Err(err.into());
            }
        };

        let request = AppendHistoryEventsRequest {
            domain_id: new_state.execution_info.domain_id,
            execution: new_state.execution(),
            transaction_id,
            first_event_id: first_event.event_id,
            events: serialized,
        };
        match self.ctx.shard.append_history_events(&request).await {
            Ok(()) => Ok(()),
            Err(StoreError::ConditionFailed(_)) => Err(WorkflowContextError::Conflict),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_with_retry(
        &self,
        request: &GetWorkflowExecutionRequest,
    ) -> Result<GetWorkflowExecutionResponse, StoreError> {
        retry::retry(
            || self.ctx.store.get_workflow_execution(request),
            retry::persistence_retry_policy(),
            StoreError::is_transient,
        )
        .await
    }

    async fn update_with_retry(
        &self,
        request: &UpdateWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        retry::retry(
            || self.ctx.shard.update_workflow_execution(request),
            retry::persistence_retry_policy(),
            StoreError::is_transient,
        )
        .await
    }
}
