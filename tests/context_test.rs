//! End-to-end tests for the workflow execution context, driven against the
//! in-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;

use belay::config::Config;
use belay::context::{ReplicateEventsRequest, WorkflowContextError, WorkflowExecutionContext};
use belay::domain::{ClusterMetadata, DomainCache, DomainConfig, DomainEntry};
use belay::history::{EventType, HistoryEvent};
use belay::mutable_state::MutableState;
use belay::persistence::memory::InMemoryExecutionStore;
use belay::persistence::{
    AppendHistoryEventsRequest, CloseStatus, CreateWorkflowExecutionRequest, CurrentExecution,
    DomainId, ExecutionStore, GetWorkflowExecutionRequest, GetWorkflowExecutionResponse,
    ReplicationState, ResetWorkflowExecutionRequest, RunId, StoreError, StoreResult, TimerTask,
    TransferTask, UpdateWorkflowExecutionRequest, WorkflowExecution, WorkflowExecutionInfo,
    WorkflowState,
};
use belay::shard::{HistoryShard, ShardContext};

// ============================================================================
// Harness
// ============================================================================

struct TestEnv {
    /// Inspection handle; always the in-memory store underneath.
    store: Arc<InMemoryExecutionStore>,
    /// What shard and contexts actually talk to (possibly fault-injecting).
    store_dyn: Arc<dyn ExecutionStore>,
    shard: Arc<HistoryShard>,
    domain_cache: Arc<DomainCache>,
    domain_id: DomainId,
}

impl TestEnv {
    async fn new(global_domains: bool, failover_version: i64) -> Self {
        let store = Arc::new(InMemoryExecutionStore::new());
        Self::build(
            store.clone(),
            store as Arc<dyn ExecutionStore>,
            global_domains,
            failover_version,
        )
        .await
    }

    async fn with_flaky_store(
        flaky: Arc<FlakyStore>,
        global_domains: bool,
        failover_version: i64,
    ) -> Self {
        Self::build(
            flaky.inner.clone(),
            flaky as Arc<dyn ExecutionStore>,
            global_domains,
            failover_version,
        )
        .await
    }

    async fn build(
        store: Arc<InMemoryExecutionStore>,
        store_dyn: Arc<dyn ExecutionStore>,
        global_domains: bool,
        failover_version: i64,
    ) -> Self {
        let config = Arc::new(Config::default());
        let domain_cache = Arc::new(DomainCache::new());
        let cluster = Arc::new(ClusterMetadata::new(global_domains, "east"));
        let shard = Arc::new(HistoryShard::new(
            1,
            store_dyn.clone(),
            config,
            domain_cache.clone(),
            cluster,
        ));
        let domain_id = DomainId::new();
        domain_cache
            .register(domain_entry(domain_id, global_domains, failover_version, 7))
            .await;
        Self {
            store,
            store_dyn,
            shard,
            domain_cache,
            domain_id,
        }
    }

    async fn seed(
        &self,
        workflow_id: &str,
        next_event_id: i64,
        replication_version: Option<i64>,
    ) -> WorkflowExecution {
        let run_id = RunId::new();
        let info = running_info(self.domain_id, workflow_id, run_id, next_event_id);
        let replication_state = replication_version.map(replication_state);
        self.store_dyn
            .create_workflow_execution(&CreateWorkflowExecutionRequest {
                execution_info: info,
                replication_state,
                transfer_tasks: Vec::new(),
                timer_tasks: Vec::new(),
            })
            .await
            .unwrap();
        WorkflowExecution::new(workflow_id, run_id)
    }

    fn context(&self, execution: &WorkflowExecution) -> WorkflowExecutionContext {
        WorkflowExecutionContext::new(
            self.domain_id,
            execution.clone(),
            self.shard.clone() as Arc<dyn ShardContext>,
            self.store_dyn.clone(),
        )
    }
}

fn domain_entry(id: DomainId, is_global: bool, failover_version: i64, retention_days: i32) -> DomainEntry {
    DomainEntry {
        id,
        name: "orders".into(),
        config: DomainConfig { retention_days },
        failover_version,
        is_global,
        active_cluster: "east".into(),
        clusters: vec!["east".into(), "west".into()],
    }
}

fn running_info(
    domain_id: DomainId,
    workflow_id: &str,
    run_id: RunId,
    next_event_id: i64,
) -> WorkflowExecutionInfo {
    WorkflowExecutionInfo {
        domain_id,
        workflow_id: workflow_id.into(),
        run_id,
        workflow_type: "order".into(),
        task_list: "default".into(),
        execution_context: Vec::new(),
        state: WorkflowState::Running,
        close_status: CloseStatus::None,
        next_event_id,
        last_first_event_id: 1,
        last_processed_event_id: 0,
        start_timestamp: Utc::now(),
        last_updated_timestamp: Utc::now(),
    }
}

fn replication_state(version: i64) -> ReplicationState {
    ReplicationState {
        current_version: version,
        start_version: version,
        last_write_version: version,
        last_write_event_id: 0,
        last_replication_info: HashMap::new(),
    }
}

fn timer_task(tag: u32) -> TimerTask {
    TimerTask::new(Utc::now() + Duration::seconds(60), json!({ "timer": tag }))
}

fn successor_for(env: &TestEnv, workflow_id: &str) -> MutableState {
    let mut successor = MutableState::new_run(env.domain_id, workflow_id, RunId::new(), "order", "default");
    successor.add_started_event(json!({ "input": "next" })).unwrap();
    successor
        .add_event(EventType::DecisionTaskScheduled, json!({}))
        .unwrap();
    successor
}

/// Store wrapper that fails a configurable number of calls before
/// delegating to the in-memory store.
struct FlakyStore {
    inner: Arc<InMemoryExecutionStore>,
    transient_get_failures: AtomicU32,
    update_failures: Mutex<Vec<StoreError>>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryExecutionStore::new()),
            transient_get_failures: AtomicU32::new(0),
            update_failures: Mutex::new(Vec::new()),
        }
    }

    fn fail_gets(&self, count: u32) {
        self.transient_get_failures.store(count, Ordering::SeqCst);
    }

    fn fail_next_update(&self, error: StoreError) {
        self.update_failures.lock().unwrap().push(error);
    }
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn create_workflow_execution(
        &self,
        request: &CreateWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        self.inner.create_workflow_execution(request).await
    }

    async fn get_workflow_execution(
        &self,
        request: &GetWorkflowExecutionRequest,
    ) -> StoreResult<GetWorkflowExecutionResponse> {
        let remaining = self.transient_get_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_get_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Timeout("injected get timeout".into()));
        }
        self.inner.get_workflow_execution(request).await
    }

    async fn update_workflow_execution(
        &self,
        request: &UpdateWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        if let Some(error) = self.update_failures.lock().unwrap().pop() {
            return Err(error);
        }
        self.inner.update_workflow_execution(request).await
    }

    async fn reset_workflow_execution(
        &self,
        request: &ResetWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        self.inner.reset_workflow_execution(request).await
    }

    async fn append_history_events(&self, request: &AppendHistoryEventsRequest) -> StoreResult<()> {
        self.inner.append_history_events(request).await
    }

    async fn get_current_execution(
        &self,
        domain_id: DomainId,
        workflow_id: &str,
    ) -> StoreResult<CurrentExecution> {
        self.inner.get_current_execution(domain_id, workflow_id).await
    }
}

// ============================================================================
// Local updates
// ============================================================================

#[tokio::test]
async fn test_local_update_appends_history_before_advancing_record() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 11, None).await;
    let mut notifications = env.shard.subscribe();

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    assert_eq!(wf.update_condition(), 11);
    {
        let state = wf.mutable_state().unwrap();
        state.add_event(EventType::DecisionTaskCompleted, json!({})).unwrap();
        state
            .add_event(EventType::ActivityTaskScheduled, json!({ "activity": "charge" }))
            .unwrap();
        state.add_event(EventType::TimerStarted, json!({ "timer": "t1" })).unwrap();
    }
    wf.update(Vec::new(), vec![timer_task(1), timer_task(2)], 42)
        .await
        .unwrap();

    let batches = env.store.history_batches(env.domain_id, &execution);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].first_event_id, 11);
    assert_eq!(batches[0].transaction_id, 42);
    let ids: Vec<i64> = env
        .store
        .decoded_history(env.domain_id, &execution)
        .iter()
        .map(|e| e.event_id)
        .collect();
    assert_eq!(ids, vec![11, 12, 13]);

    let snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert_eq!(snapshot.execution_info.next_event_id, 14);
    assert_eq!(snapshot.execution_info.last_first_event_id, 11);
    assert!(snapshot.replication_state.is_none());
    assert!(env.store.replication_tasks().is_empty());
    assert_eq!(env.store.timer_tasks().len(), 2);
    assert_eq!(wf.update_condition(), 14);

    // the running execution keeps an unexpiring current-run pointer
    let current = env
        .store
        .current_execution_raw(env.domain_id, &execution.workflow_id)
        .unwrap();
    assert_eq!(current.run_id, execution.run_id);
    assert!(current.expires_at.is_none());

    let note = notifications.recv().await.unwrap();
    assert_eq!(note.execution, execution);
    assert_eq!(note.last_first_event_id, 11);
    assert_eq!(note.next_event_id, 14);
    assert!(note.is_running);
}

#[tokio::test]
async fn test_second_update_uses_advanced_condition() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 5, None).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    wf.mutable_state()
        .unwrap()
        .add_event(EventType::TimerStarted, json!({}))
        .unwrap();
    wf.update(Vec::new(), Vec::new(), 1).await.unwrap();

    // no reload needed: the cached state carries the new condition
    wf.mutable_state()
        .unwrap()
        .add_event(EventType::TimerFired, json!({}))
        .unwrap();
    wf.update(Vec::new(), Vec::new(), 2).await.unwrap();

    let snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert_eq!(snapshot.execution_info.next_event_id, 7);
    assert_eq!(wf.update_condition(), 7);
}

#[tokio::test]
async fn test_update_without_load_reports_missing_state() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 3, None).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    let err = wf.update(Vec::new(), Vec::new(), 1).await.unwrap_err();
    assert!(matches!(err, WorkflowContextError::StateNotLoaded));
}

#[tokio::test]
async fn test_mutable_state_only_update_appends_no_history() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 9, None).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    wf.mutable_state().unwrap().set_execution_context(vec![1, 2, 3]);
    wf.update(Vec::new(), Vec::new(), 3).await.unwrap();

    assert!(env.store.history_batches(env.domain_id, &execution).is_empty());
    let snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert_eq!(snapshot.execution_info.execution_context, vec![1, 2, 3]);
    assert_eq!(snapshot.execution_info.next_event_id, 9);
}

// ============================================================================
// Conflicts and cache discard
// ============================================================================

#[tokio::test]
async fn test_conflicting_update_returns_conflict_and_discards_cache() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 11, None).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    wf.mutable_state()
        .unwrap()
        .add_event(EventType::TimerStarted, json!({}))
        .unwrap();

    // another writer moved the record
    env.store.set_next_event_id(env.domain_id, &execution, 99);

    let err = wf.update(Vec::new(), Vec::new(), 7).await.unwrap_err();
    assert!(matches!(err, WorkflowContextError::Conflict));
    assert!(matches!(
        wf.mutable_state().unwrap_err(),
        WorkflowContextError::StateNotLoaded
    ));

    // the next load fetches fresh state from the store
    env.store
        .set_execution_context(env.domain_id, &execution, vec![42]);
    let state = wf.load().await.unwrap();
    assert_eq!(state.execution_info.execution_context, vec![42]);
    assert_eq!(state.next_event_id(), 99);
    drop(state);
    assert_eq!(wf.update_condition(), 99);
}

#[tokio::test]
async fn test_fatal_update_error_discards_cache() {
    let flaky = Arc::new(FlakyStore::new());
    let env = TestEnv::with_flaky_store(flaky.clone(), false, 0).await;
    let execution = env.seed("order-1", 4, None).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    wf.mutable_state()
        .unwrap()
        .add_event(EventType::TimerStarted, json!({}))
        .unwrap();

    flaky.fail_next_update(StoreError::Internal("disk on fire".into()));
    let err = wf.update(Vec::new(), Vec::new(), 2).await.unwrap_err();
    assert!(matches!(err, WorkflowContextError::Store(StoreError::Internal(_))));
    assert!(matches!(
        wf.mutable_state().unwrap_err(),
        WorkflowContextError::StateNotLoaded
    ));
}

// ============================================================================
// Retention
// ============================================================================

#[tokio::test]
async fn test_completed_execution_expires_current_run_after_retention() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 5, None).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    wf.mutable_state()
        .unwrap()
        .add_completed_event(json!("done"))
        .unwrap();
    wf.update(Vec::new(), Vec::new(), 8).await.unwrap();

    let snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert_eq!(snapshot.execution_info.state, WorkflowState::Completed);
    assert_eq!(snapshot.execution_info.close_status, CloseStatus::Completed);

    // retention is 7 days
    let current = env
        .store
        .current_execution_raw(env.domain_id, &execution.workflow_id)
        .unwrap();
    let expires_at = current.expires_at.expect("pointer must carry a TTL");
    let expected = Utc::now() + Duration::seconds(7 * 86_400);
    assert!((expires_at - expected).num_seconds().abs() <= 5);
}

// ============================================================================
// Global domains
// ============================================================================

#[tokio::test]
async fn test_global_domain_update_emits_replication_task() {
    let env = TestEnv::new(true, 17).await;
    let execution = env.seed("order-1", 11, Some(17)).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    {
        let state = wf.mutable_state().unwrap();
        assert_eq!(state.current_version(), 17);
        state.add_event(EventType::DecisionTaskCompleted, json!({})).unwrap();
        state.add_event(EventType::ActivityTaskScheduled, json!({})).unwrap();
    }
    wf.update(
        vec![TransferTask::new(json!({ "kind": "activity" }))],
        vec![timer_task(1)],
        21,
    )
    .await
    .unwrap();

    let replication_tasks = env.store.replication_tasks();
    assert_eq!(replication_tasks.len(), 1);
    assert_eq!(replication_tasks[0].version, 17);
    assert_eq!(replication_tasks[0].first_event_id, 11);
    assert_eq!(replication_tasks[0].next_event_id, 13);

    for task in env.store.transfer_tasks() {
        assert_eq!(task.version, 17);
    }
    for task in env.store.timer_tasks() {
        assert_eq!(task.version, 17);
    }

    let snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    let rs = snapshot.replication_state.expect("replicated execution");
    assert_eq!(rs.last_write_event_id, 12);
    assert_eq!(rs.last_write_version, 17);
}

#[tokio::test]
async fn test_load_refreshes_failover_version_for_running_executions() {
    let env = TestEnv::new(true, 5).await;
    let execution = env.seed("order-1", 3, Some(5)).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    assert_eq!(wf.load().await.unwrap().current_version(), 5);

    // the domain failed over since the last load
    env.domain_cache
        .register(domain_entry(env.domain_id, true, 9, 7))
        .await;
    assert_eq!(wf.load().await.unwrap().current_version(), 9);
}

#[tokio::test]
async fn test_load_keeps_version_of_finished_executions() {
    let env = TestEnv::new(true, 5).await;
    let run_id = RunId::new();
    let mut info = running_info(env.domain_id, "order-1", run_id, 6);
    info.state = WorkflowState::Completed;
    info.close_status = CloseStatus::Completed;
    env.store
        .create_workflow_execution(&CreateWorkflowExecutionRequest {
            execution_info: info,
            replication_state: Some(replication_state(5)),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
        })
        .await
        .unwrap();
    let execution = WorkflowExecution::new("order-1", run_id);

    env.domain_cache
        .register(domain_entry(env.domain_id, true, 9, 7))
        .await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    // a terminal run must keep the failover version it closed with
    assert_eq!(wf.load().await.unwrap().current_version(), 5);
}

// ============================================================================
// Replication apply
// ============================================================================

#[tokio::test]
async fn test_replicate_applies_remote_batch_verbatim() {
    let env = TestEnv::new(true, 5).await;
    let execution = env.seed("order-1", 8, Some(5)).await;

    let history: Vec<HistoryEvent> = (8..=10)
        .map(|id| HistoryEvent::new(id, EventType::WorkflowExecutionSignaled, 5, json!({ "id": id })))
        .collect();

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    wf.replicate(
        ReplicateEventsRequest {
            source_cluster: "west".into(),
            version: 5,
            history,
        },
        Vec::new(),
        Vec::new(),
        10,
        77,
    )
    .await
    .unwrap();

    let snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert_eq!(snapshot.execution_info.next_event_id, 11);
    assert_eq!(snapshot.execution_info.last_first_event_id, 8);

    let ids: Vec<i64> = env
        .store
        .decoded_history(env.domain_id, &execution)
        .iter()
        .map(|e| e.event_id)
        .collect();
    assert_eq!(ids, vec![8, 9, 10]);

    // applying remote events never creates outbound replication tasks
    assert!(env.store.replication_tasks().is_empty());

    let rs = snapshot.replication_state.expect("replicated execution");
    let west = rs.last_replication_info.get("west").expect("source cluster progress");
    assert_eq!(west.version, 5);
    assert_eq!(west.last_event_id, 10);
}

// ============================================================================
// Continue-as-new
// ============================================================================

#[tokio::test]
async fn test_continue_as_new_moves_current_run_to_successor() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 5, None).await;
    let successor = successor_for(&env, "order-1");
    let successor_execution = successor.execution();
    let successor_next = successor.next_event_id();

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    wf.continue_as_new(vec![9, 9], successor, Vec::new(), Vec::new(), 31)
        .await
        .unwrap();

    // old run closed as continued-as-new
    let old = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert_eq!(old.execution_info.state, WorkflowState::Completed);
    assert_eq!(old.execution_info.close_status, CloseStatus::ContinuedAsNew);
    assert_eq!(old.execution_info.execution_context, vec![9, 9]);

    // successor exists, with its start history and the current-run pointer
    let new = env
        .store
        .stored_snapshot(env.domain_id, &successor_execution)
        .unwrap();
    assert_eq!(new.execution_info.next_event_id, successor_next);
    let new_history = env.store.decoded_history(env.domain_id, &successor_execution);
    assert_eq!(new_history[0].event_id, 1);
    assert_eq!(new_history[0].event_type, EventType::WorkflowExecutionStarted);

    let current = env
        .store
        .current_execution_raw(env.domain_id, "order-1")
        .unwrap();
    assert_eq!(current.run_id, successor_execution.run_id);
    assert!(current.expires_at.is_none());
}

#[tokio::test]
async fn test_continue_as_new_update_failure_leaves_detectable_orphan() {
    let flaky = Arc::new(FlakyStore::new());
    let env = TestEnv::with_flaky_store(flaky.clone(), false, 0).await;
    let execution = env.seed("order-1", 5, None).await;
    let successor = successor_for(&env, "order-1");
    let successor_execution = successor.execution();

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();

    flaky.fail_next_update(StoreError::Internal("shard fenced".into()));
    let err = wf
        .continue_as_new(Vec::new(), successor, Vec::new(), Vec::new(), 31)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowContextError::Store(StoreError::Internal(_))));

    // the successor's start batch landed but it has no execution record and
    // the current-run pointer never moved
    assert_eq!(
        env.store
            .history_batches(env.domain_id, &successor_execution)
            .len(),
        1
    );
    assert!(env
        .store
        .stored_snapshot(env.domain_id, &successor_execution)
        .is_none());
    let current = env
        .store
        .current_execution_raw(env.domain_id, "order-1")
        .unwrap();
    assert_eq!(current.run_id, execution.run_id);

    // old run unchanged, cache discarded
    let old = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert_eq!(old.execution_info.state, WorkflowState::Running);
    assert!(matches!(
        wf.mutable_state().unwrap_err(),
        WorkflowContextError::StateNotLoaded
    ));
}

// ============================================================================
// Buffered events
// ============================================================================

#[tokio::test]
async fn test_buffered_events_persist_then_flush_on_next_commit() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 4, None).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    {
        let state = wf.mutable_state().unwrap();
        state.set_decision_pending(true);
        state
            .buffer_event(EventType::WorkflowExecutionSignaled, json!({ "payload": "a" }))
            .unwrap();
    }
    wf.update(Vec::new(), Vec::new(), 1).await.unwrap();

    let snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert_eq!(snapshot.buffered_events.len(), 1);
    assert_eq!(snapshot.execution_info.next_event_id, 4);
    assert!(env.store.history_batches(env.domain_id, &execution).is_empty());

    // decision completes: the buffer drains into real history
    wf.mutable_state().unwrap().set_decision_pending(false);
    wf.update(Vec::new(), Vec::new(), 2).await.unwrap();

    let snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert!(snapshot.buffered_events.is_empty());
    assert_eq!(snapshot.execution_info.next_event_id, 5);
    let ids: Vec<i64> = env
        .store
        .decoded_history(env.domain_id, &execution)
        .iter()
        .map(|e| e.event_id)
        .collect();
    assert_eq!(ids, vec![4]);
}

// ============================================================================
// Transient batches
// ============================================================================

#[tokio::test]
async fn test_transient_decision_events_append_as_separate_batch_first() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 6, None).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    {
        let state = wf.mutable_state().unwrap();
        state.add_event(EventType::ActivityTaskCompleted, json!({})).unwrap();
        state.add_transient_event(EventType::DecisionTaskScheduled, json!({}));
        state.add_transient_event(EventType::DecisionTaskStarted, json!({}));
    }
    wf.update(Vec::new(), Vec::new(), 55).await.unwrap();

    // insertion order proves the transient batch (events from 7) was
    // appended before the main batch (event 6), both under one transaction
    let batches = env.store.history_batches(env.domain_id, &execution);
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].first_event_id, 7);
    assert_eq!(batches[1].first_event_id, 6);
    assert_eq!(batches[0].transaction_id, 55);
    assert_eq!(batches[1].transaction_id, 55);

    let snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert_eq!(snapshot.execution_info.last_first_event_id, 6);
    assert_eq!(snapshot.execution_info.next_event_id, 7);
}

// ============================================================================
// Timer task deletion
// ============================================================================

#[tokio::test]
async fn test_delete_timer_directive_rides_one_commit() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 4, None).await;
    let doomed = timer_task(1);

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    wf.update(Vec::new(), vec![doomed.clone()], 1).await.unwrap();
    assert_eq!(env.store.timer_tasks().len(), 1);

    wf.update_with_delete_timer(Vec::new(), Vec::new(), doomed, 2)
        .await
        .unwrap();
    assert!(env.store.timer_tasks().is_empty());

    // the directive does not leak into later commits
    wf.update(Vec::new(), vec![timer_task(2)], 3).await.unwrap();
    assert_eq!(env.store.timer_tasks().len(), 1);
}

// ============================================================================
// Retry behaviour
// ============================================================================

#[tokio::test]
async fn test_load_retries_transient_store_failures() {
    let flaky = Arc::new(FlakyStore::new());
    let env = TestEnv::with_flaky_store(flaky.clone(), false, 0).await;
    let execution = env.seed("order-1", 4, None).await;

    let ctx = env.context(&execution);
    flaky.fail_gets(2);

    let mut wf = ctx.lock().await;
    let state = wf.load().await.unwrap();
    assert_eq!(state.next_event_id(), 4);
}

#[tokio::test]
async fn test_update_retries_transient_then_succeeds() {
    let flaky = Arc::new(FlakyStore::new());
    let env = TestEnv::with_flaky_store(flaky.clone(), false, 0).await;
    let execution = env.seed("order-1", 4, None).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();
    wf.mutable_state()
        .unwrap()
        .add_event(EventType::TimerStarted, json!({}))
        .unwrap();

    flaky.fail_next_update(StoreError::Busy("throttled".into()));
    wf.update(Vec::new(), Vec::new(), 2).await.unwrap();

    let snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    assert_eq!(snapshot.execution_info.next_event_id, 5);
}

// ============================================================================
// Reset
// ============================================================================

#[tokio::test]
async fn test_reset_replaces_state_and_reloads() {
    let env = TestEnv::new(false, 0).await;
    let execution = env.seed("order-1", 8, None).await;

    let ctx = env.context(&execution);
    let mut wf = ctx.lock().await;
    wf.load().await.unwrap();

    let mut snapshot = env.store.stored_snapshot(env.domain_id, &execution).unwrap();
    snapshot.execution_info.next_event_id = 20;
    snapshot.execution_info.execution_context = vec![5];
    let reset_state = MutableState::from_snapshot(snapshot);

    let state = wf.reset(&reset_state).await.unwrap();
    assert_eq!(state.next_event_id(), 20);
    assert_eq!(state.execution_info.execution_context, vec![5]);
    drop(state);
    assert_eq!(wf.update_condition(), 20);
}
