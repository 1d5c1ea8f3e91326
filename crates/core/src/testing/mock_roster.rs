//! Mock roster source for testing.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::ids::WorkerId;
use crate::roster::{Roster, RosterError, RosterSource};

/// Roster source whose result can be changed between startups.
#[derive(Debug, Default)]
pub struct MockRoster {
    workers: Arc<RwLock<Vec<WorkerId>>>,
    fail: Arc<RwLock<bool>>,
    loads: Arc<RwLock<usize>>,
}

impl MockRoster {
    pub fn new(workers: Vec<WorkerId>) -> Self {
        Self {
            workers: Arc::new(RwLock::new(workers)),
            ..Default::default()
        }
    }

    pub async fn set_workers(&self, workers: Vec<WorkerId>) {
        *self.workers.write().await = workers;
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    pub async fn load_count(&self) -> usize {
        *self.loads.read().await
    }
}

#[async_trait]
impl RosterSource for MockRoster {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load_worker_ids(&self) -> Result<Roster, RosterError> {
        *self.loads.write().await += 1;
        if *self.fail.read().await {
            return Err(RosterError::ApiError {
                status: 503,
                message: "mock roster unavailable".to_string(),
            });
        }
        Ok(Roster::new(self.workers.read().await.iter().copied()))
    }
}
