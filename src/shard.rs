//! Shard context: the ownership unit fronting the execution store.
//!
//! One shard hosts many workflow executions. It serialises their writes,
//! owns the execution-context cache, hands out transaction IDs, and fans
//! out history notifications. Contexts hold the shard only as a borrowed
//! capability set ([`ShardContext`]); the cache owns the contexts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::config::Config;
use crate::context::WorkflowExecutionContext;
use crate::domain::{ClusterMetadata, DomainCache};
use crate::notifications::{HistoryEventNotification, HistoryEventNotifier};
use crate::persistence::{
    AppendHistoryEventsRequest, CreateWorkflowExecutionRequest, DomainId, ExecutionStore,
    ResetWorkflowExecutionRequest, RunId, StoreResult, UpdateWorkflowExecutionRequest,
    WorkflowExecution,
};

/// The capability set a workflow execution context needs from its shard.
#[async_trait]
pub trait ShardContext: Send + Sync {
    fn shard_id(&self) -> i32;

    fn config(&self) -> &Arc<Config>;

    fn domain_cache(&self) -> &Arc<DomainCache>;

    fn cluster_metadata(&self) -> &Arc<ClusterMetadata>;

    /// Monotonically increasing IDs for history transactions on this shard.
    fn next_transaction_id(&self) -> i64;

    async fn create_workflow_execution(
        &self,
        request: &CreateWorkflowExecutionRequest,
    ) -> StoreResult<()>;

    async fn append_history_events(&self, request: &AppendHistoryEventsRequest) -> StoreResult<()>;

    async fn update_workflow_execution(
        &self,
        request: &UpdateWorkflowExecutionRequest,
    ) -> StoreResult<()>;

    async fn reset_workflow_execution(
        &self,
        request: &ResetWorkflowExecutionRequest,
    ) -> StoreResult<()>;

    fn notify_new_history_event(&self, notification: HistoryEventNotification);
}

/// Concrete shard wired to an execution store.
pub struct HistoryShard {
    shard_id: i32,
    store: Arc<dyn ExecutionStore>,
    config: Arc<Config>,
    domain_cache: Arc<DomainCache>,
    cluster_metadata: Arc<ClusterMetadata>,
    notifier: HistoryEventNotifier,
    transaction_id: AtomicI64,
}

impl HistoryShard {
    pub fn new(
        shard_id: i32,
        store: Arc<dyn ExecutionStore>,
        config: Arc<Config>,
        domain_cache: Arc<DomainCache>,
        cluster_metadata: Arc<ClusterMetadata>,
    ) -> Self {
        crate::retry::configure_persistence_retries(config.persistence_retry_policy());
        let notifier = HistoryEventNotifier::new(config.notification_buffer_capacity);
        Self {
            shard_id,
            store,
            config,
            domain_cache,
            cluster_metadata,
            notifier,
            transaction_id: AtomicI64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn subscribe(
        &self,
    ) -> tokio::sync::broadcast::Receiver<Arc<HistoryEventNotification>> {
        self.notifier.subscribe()
    }
}

#[async_trait]
impl ShardContext for HistoryShard {
    fn shard_id(&self) -> i32 {
        self.shard_id
    }

    fn config(&self) -> &Arc<Config> {
        &self.config
    }

    fn domain_cache(&self) -> &Arc<DomainCache> {
        &self.domain_cache
    }

    fn cluster_metadata(&self) -> &Arc<ClusterMetadata> {
        &self.cluster_metadata
    }

    fn next_transaction_id(&self) -> i64 {
        self.transaction_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn create_workflow_execution(
        &self,
        request: &CreateWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        debug!(
            shard_id = self.shard_id,
            workflow_id = %request.execution_info.workflow_id,
            run_id = %request.execution_info.run_id,
            "creating workflow execution"
        );
        self.store.create_workflow_execution(request).await
    }

    async fn append_history_events(&self, request: &AppendHistoryEventsRequest) -> StoreResult<()> {
        debug!(
            shard_id = self.shard_id,
            workflow_id = %request.execution.workflow_id,
            run_id = %request.execution.run_id,
            first_event_id = request.first_event_id,
            transaction_id = request.transaction_id,
            "appending history events"
        );
        self.store.append_history_events(request).await
    }

    async fn update_workflow_execution(
        &self,
        request: &UpdateWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        debug!(
            shard_id = self.shard_id,
            workflow_id = %request.execution_info.workflow_id,
            run_id = %request.execution_info.run_id,
            condition = request.condition,
            "updating workflow execution"
        );
        self.store.update_workflow_execution(request).await
    }

    async fn reset_workflow_execution(
        &self,
        request: &ResetWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        debug!(
            shard_id = self.shard_id,
            workflow_id = %request.snapshot.execution_info.workflow_id,
            run_id = %request.snapshot.execution_info.run_id,
            condition = request.condition,
            "resetting workflow execution"
        );
        self.store.reset_workflow_execution(request).await
    }

    fn notify_new_history_event(&self, notification: HistoryEventNotification) {
        self.notifier.notify(notification);
    }
}

type CacheKey = (DomainId, String, RunId);

/// Per-shard cache of workflow execution contexts.
///
/// Hands out exactly one context per (domain, workflow, run) so the
/// context's mutex really is a single-writer lock. When the cache is over
/// capacity, idle entries (no outstanding handles) are dropped; busy ones
/// are never duplicated.
pub struct ExecutionCache {
    shard: Arc<dyn ShardContext>,
    store: Arc<dyn ExecutionStore>,
    capacity: usize,
    contexts: Mutex<HashMap<CacheKey, Arc<WorkflowExecutionContext>>>,
}

impl ExecutionCache {
    pub fn new(shard: Arc<dyn ShardContext>, store: Arc<dyn ExecutionStore>) -> Self {
        let capacity = shard.config().execution_cache_capacity;
        Self {
            shard,
            store,
            capacity,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(
        &self,
        domain_id: DomainId,
        execution: &WorkflowExecution,
    ) -> Arc<WorkflowExecutionContext> {
        let key = (domain_id, execution.workflow_id.clone(), execution.run_id);
        let mut contexts = self.contexts.lock().expect("cache lock poisoned");
        if let Some(context) = contexts.get(&key) {
            return context.clone();
        }
        if contexts.len() >= self.capacity {
            contexts.retain(|_, context| Arc::strong_count(context) > 1);
        }
        let context = Arc::new(WorkflowExecutionContext::new(
            domain_id,
            execution.clone(),
            self.shard.clone(),
            self.store.clone(),
        ));
        contexts.insert(key, context.clone());
        context
    }

    pub fn evict(&self, domain_id: DomainId, execution: &WorkflowExecution) {
        let key = (domain_id, execution.workflow_id.clone(), execution.run_id);
        let mut contexts = self.contexts.lock().expect("cache lock poisoned");
        contexts.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
