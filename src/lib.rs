//! Belay - a durable workflow history engine
//!
//! This crate implements the transactional core of a workflow history
//! service: per-run execution contexts that keep an in-memory mutable state
//! coherent with a condition-checked execution store, emit cross-cluster
//! replication tasks for global domains, and apply event batches replicated
//! from remote clusters. The key components are:
//!
//! ## Execution core
//!
//! - [`WorkflowExecutionContext`]: single-writer owner of one run's cached
//!   mutable state and every persistence transaction against it
//! - [`MutableState`]: the in-memory view of a run, with update sessions
//!   that close into one commit's worth of deltas
//! - [`HistoryBuilder`]: event batches (main and transient) for append
//!
//! ## Shard layer
//!
//! - [`HistoryShard`] / [`ShardContext`]: store access, transaction IDs,
//!   and history notifications for the executions a shard owns
//! - [`ExecutionCache`]: one context per (domain, workflow, run)
//!
//! ## Persistence
//!
//! - [`persistence::ExecutionStore`]: the store contract (condition-checked
//!   updates, idempotent history appends)
//! - [`persistence::memory`] and [`persistence::postgres`]: the shipped
//!   implementations

pub mod config;
pub mod context;
pub mod domain;
pub mod history;
pub mod mutable_state;
pub mod notifications;
pub mod observability;
pub mod persistence;
pub mod retry;
pub mod shard;

// Configuration
pub use config::Config;

// Execution core
pub use context::{LockedContext, ReplicateEventsRequest, WorkflowContextError, WorkflowExecutionContext};
pub use history::{EventType, HistoryBuilder, HistoryEvent, FIRST_EVENT_ID};
pub use mutable_state::{MutableState, SessionUpdates, StateError, EMPTY_VERSION};

// Shard layer
pub use notifications::{HistoryEventNotification, HistoryEventNotifier};
pub use shard::{ExecutionCache, HistoryShard, ShardContext};

// Domains & clusters
pub use domain::{ClusterMetadata, DomainCache, DomainConfig, DomainEntry, DomainError};

// Persistence
pub use persistence::{
    DomainId, ExecutionStore, ReplicationState, RunId, StoreError, StoreResult, TimerTask,
    TransferTask, WorkflowExecution, WorkflowSnapshot, WorkflowState,
};

// Retry
pub use retry::RetryPolicy;
