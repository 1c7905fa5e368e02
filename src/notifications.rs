//! History event notifications.
//!
//! Every successful commit publishes one notification so pollers and
//! long-poll handlers wake up without scanning the store. Delivery is
//! best-effort fan-out: a lagging subscriber drops the oldest messages, it
//! never blocks the committer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::persistence::{DomainId, WorkflowExecution};

/// Published after each committed transaction on a workflow execution.
#[derive(Debug, Clone)]
pub struct HistoryEventNotification {
    pub domain_id: DomainId,
    pub execution: WorkflowExecution,
    pub last_first_event_id: i64,
    pub next_event_id: i64,
    pub is_running: bool,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEventNotification {
    pub fn new(
        domain_id: DomainId,
        execution: WorkflowExecution,
        last_first_event_id: i64,
        next_event_id: i64,
        is_running: bool,
    ) -> Self {
        Self {
            domain_id,
            execution,
            last_first_event_id,
            next_event_id,
            is_running,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out channel for history event notifications.
#[derive(Debug)]
pub struct HistoryEventNotifier {
    sender: broadcast::Sender<Arc<HistoryEventNotification>>,
}

impl HistoryEventNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. A send with no subscribers is
    /// not an error.
    pub fn notify(&self, notification: HistoryEventNotification) {
        let _ = self.sender.send(Arc::new(notification));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<HistoryEventNotification>> {
        self.sender.subscribe()
    }
}
