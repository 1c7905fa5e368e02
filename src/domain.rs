//! Domain registry cache and cluster metadata.
//!
//! Domains are the multi-tenancy unit: each carries a retention policy and,
//! for globally replicated domains, a failover version that stamps every
//! event written while a cluster is active. The cache fronts whatever
//! authoritative registry the deployment uses; entries are refreshed out of
//! band and reads are cheap.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::persistence::DomainId;

/// Per-domain retention configuration.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// How long closed executions remain resolvable, in days.
    pub retention_days: i32,
}

/// A cached domain registry entry.
#[derive(Debug, Clone)]
pub struct DomainEntry {
    pub id: DomainId,
    pub name: String,
    pub config: DomainConfig,
    /// Version stamped onto events and tasks written while this cluster is
    /// active for the domain. Bumped on failover.
    pub failover_version: i64,
    /// Whether the domain is replicated across clusters.
    pub is_global: bool,
    pub active_cluster: String,
    pub clusters: Vec<String>,
}

impl DomainEntry {
    pub fn failover_version(&self) -> i64 {
        self.failover_version
    }

    pub fn retention_days(&self) -> i32 {
        self.config.retention_days
    }
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("domain not found: {0}")]
    NotFound(DomainId),
}

/// In-process cache of domain entries, keyed by domain ID.
#[derive(Debug, Default)]
pub struct DomainCache {
    entries: RwLock<HashMap<DomainId, Arc<DomainEntry>>>,
}

impl DomainCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry. Registration happens at bootstrap and on
    /// registry refresh; lookups never mutate.
    pub async fn register(&self, entry: DomainEntry) {
        let mut entries = self.entries.write().await;
        entries.insert(entry.id, Arc::new(entry));
    }

    pub async fn get_domain_by_id(&self, id: DomainId) -> Result<Arc<DomainEntry>, DomainError> {
        let entries = self.entries.read().await;
        entries.get(&id).cloned().ok_or(DomainError::NotFound(id))
    }
}

/// Static facts about the cluster topology this process runs in.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    enable_global_domain: bool,
    current_cluster_name: String,
}

impl ClusterMetadata {
    pub fn new(enable_global_domain: bool, current_cluster_name: impl Into<String>) -> Self {
        Self {
            enable_global_domain,
            current_cluster_name: current_cluster_name.into(),
        }
    }

    pub fn is_global_domain_enabled(&self) -> bool {
        self.enable_global_domain
    }

    pub fn current_cluster_name(&self) -> &str {
        &self.current_cluster_name
    }
}
