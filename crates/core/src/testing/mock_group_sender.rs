//! Mock notification transport for testing.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::notify::{GroupSender, NotifyError};

/// A recorded send for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub group: String,
    pub event: String,
    pub payload: serde_json::Value,
}

/// Mock implementation of the GroupSender trait.
///
/// Every group reports the same configurable size; failed sends are not
/// recorded.
#[derive(Debug)]
pub struct MockGroupSender {
    sent: Arc<RwLock<Vec<RecordedSend>>>,
    fail: Arc<RwLock<bool>>,
    group_size: Arc<RwLock<usize>>,
}

impl Default for MockGroupSender {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGroupSender {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(RwLock::new(Vec::new())),
            fail: Arc::new(RwLock::new(false)),
            group_size: Arc::new(RwLock::new(0)),
        }
    }

    /// Get all recorded sends.
    pub async fn sent(&self) -> Vec<RecordedSend> {
        self.sent.read().await.clone()
    }

    /// Sends addressed to one group.
    pub async fn sent_to(&self, group: &str) -> Vec<RecordedSend> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|s| s.group == group)
            .cloned()
            .collect()
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    /// Sessions every group reports.
    pub async fn set_group_size(&self, size: usize) {
        *self.group_size.write().await = size;
    }
}

#[async_trait]
impl GroupSender for MockGroupSender {
    async fn send_to_group(
        &self,
        group: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<usize, NotifyError> {
        if *self.fail.read().await {
            return Err(NotifyError::Transport("mock transport failure".to_string()));
        }
        self.sent.write().await.push(RecordedSend {
            group: group.to_string(),
            event: event.to_string(),
            payload,
        });
        Ok(*self.group_size.read().await)
    }
}
