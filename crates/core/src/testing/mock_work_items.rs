//! Mock work-item service for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::ids::WorkerId;
use crate::work_item::{WorkItem, WorkItemError, WorkItemService};

/// Mock implementation of the WorkItemService trait.
///
/// Provides controllable behavior for testing:
/// - Seed the pending item per worker
/// - Record every update for assertions
/// - Simulate lookup/update failures, slow updates and panics
#[derive(Debug)]
pub struct MockWorkItemService {
    /// Pending item per worker. Stays pending after an update.
    pending: Arc<RwLock<HashMap<WorkerId, WorkItem>>>,
    /// Recorded update_item calls.
    updates: Arc<RwLock<Vec<WorkItem>>>,
    /// Recorded lookups.
    lookups: Arc<RwLock<Vec<WorkerId>>>,
    fail_lookups: Arc<RwLock<bool>>,
    fail_updates: Arc<RwLock<bool>>,
    panic_on_lookup: Arc<RwLock<bool>>,
    /// Simulated update latency in milliseconds.
    update_delay_ms: Arc<RwLock<u64>>,
}

impl Default for MockWorkItemService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorkItemService {
    /// Create a new mock service with no pending items.
    pub fn new() -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            updates: Arc::new(RwLock::new(Vec::new())),
            lookups: Arc::new(RwLock::new(Vec::new())),
            fail_lookups: Arc::new(RwLock::new(false)),
            fail_updates: Arc::new(RwLock::new(false)),
            panic_on_lookup: Arc::new(RwLock::new(false)),
            update_delay_ms: Arc::new(RwLock::new(0)),
        }
    }

    /// Set the item pending for `worker_id`.
    pub async fn set_pending(&self, worker_id: WorkerId, item: WorkItem) {
        self.pending.write().await.insert(worker_id, item);
    }

    /// Remove the pending item for `worker_id`.
    pub async fn clear_pending(&self, worker_id: WorkerId) {
        self.pending.write().await.remove(&worker_id);
    }

    /// Get all recorded updates.
    pub async fn updates(&self) -> Vec<WorkItem> {
        self.updates.read().await.clone()
    }

    /// Get updates made for one worker.
    pub async fn updates_for(&self, worker_id: WorkerId) -> Vec<WorkItem> {
        self.updates
            .read()
            .await
            .iter()
            .filter(|item| item.worker_id == Some(worker_id))
            .cloned()
            .collect()
    }

    pub async fn lookup_count(&self) -> usize {
        self.lookups.read().await.len()
    }

    pub async fn set_fail_lookups(&self, fail: bool) {
        *self.fail_lookups.write().await = fail;
    }

    pub async fn set_fail_updates(&self, fail: bool) {
        *self.fail_updates.write().await = fail;
    }

    pub async fn set_panic_on_lookup(&self, panic: bool) {
        *self.panic_on_lookup.write().await = panic;
    }

    pub async fn set_update_delay(&self, delay: Duration) {
        *self.update_delay_ms.write().await = delay.as_millis() as u64;
    }
}

#[async_trait]
impl WorkItemService for MockWorkItemService {
    fn name(&self) -> &str {
        "mock"
    }

    async fn pending_item_for_worker(
        &self,
        worker_id: WorkerId,
    ) -> Result<Option<WorkItem>, WorkItemError> {
        self.lookups.write().await.push(worker_id);

        if *self.panic_on_lookup.read().await {
            panic!("mock work-item service panicked");
        }
        if *self.fail_lookups.read().await {
            return Err(WorkItemError::Unavailable("mock lookup failure".to_string()));
        }
        Ok(self.pending.read().await.get(&worker_id).cloned())
    }

    async fn update_item(&self, item: &WorkItem) -> Result<(), WorkItemError> {
        let delay = *self.update_delay_ms.read().await;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if *self.fail_updates.read().await {
            return Err(WorkItemError::ApiError {
                status: 503,
                message: "mock update failure".to_string(),
            });
        }
        self.updates.write().await.push(item.clone());
        Ok(())
    }
}
