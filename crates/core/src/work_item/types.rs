use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, WorkerId};

/// Lifecycle status of a work item, as stored by the work-item service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Unassigned,
    Assigned,
    InProgress,
    Closed,
}

/// A work item owned by the external work-item service.
///
/// Only the single record being processed is held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: ItemId,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
}

impl WorkItem {
    /// A fresh unassigned item.
    pub fn unassigned(id: ItemId, user_id: impl Into<String>) -> Self {
        Self {
            id,
            status: ItemStatus::Unassigned,
            user_id: Some(user_id.into()),
            assigned_at: None,
            worker_id: None,
        }
    }

    /// Apply the assignment transition.
    pub fn assign_to(&mut self, worker_id: WorkerId, at: DateTime<Utc>) {
        self.status = ItemStatus::Assigned;
        self.assigned_at = Some(at);
        self.worker_id = Some(worker_id);
    }
}
