//! Real-time notification of assignments to a worker's live sessions.
//!
//! Sessions register under a group key derived from the worker id. The relay
//! only ever addresses a group; it never enumerates who is in it.

mod fanout;
mod groups;

pub use fanout::NotificationFanout;
pub use groups::{HubMessage, SessionGroups, SessionId, SessionSubscription};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assignment::AssignmentEvent;
use crate::ids::{ItemId, WorkerId};

/// Event name clients subscribe to.
pub const ITEM_ASSIGNED_EVENT: &str = "ItemAssigned";

/// Group key for a worker's sessions.
pub fn group_key_for(worker_id: WorkerId) -> String {
    format!("agent-{}", worker_id)
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to serialize notification: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("notification transport failed: {0}")]
    Transport(String),
}

/// "Send to group" primitive of the session transport.
#[async_trait]
pub trait GroupSender: Send + Sync {
    /// Deliver `payload` as `event` to every live member of `group`.
    ///
    /// Returns how many sessions it was handed to. An empty or unknown group
    /// is not an error.
    async fn send_to_group(
        &self,
        group: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<usize, NotifyError>;
}

/// Payload of an `ItemAssigned` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAssignedNotification {
    pub item_id: ItemId,
    pub user_id: String,
    pub assigned_at: DateTime<Utc>,
}

impl From<&AssignmentEvent> for ItemAssignedNotification {
    fn from(event: &AssignmentEvent) -> Self {
        Self {
            item_id: event.item_id,
            user_id: event.user_id.clone(),
            assigned_at: event.assigned_at,
        }
    }
}
