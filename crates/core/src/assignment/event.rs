//! Assignment event wire format.
//!
//! Publishers put a UTF-8 JSON document on the broker with PascalCase keys:
//!
//! ```json
//! {
//!   "ItemId": "6b1f0f5e-3f40-4a53-9a0b-2f5c3a1d7e11",
//!   "WorkerId": "3f2504e0-4f89-11d3-9a0c-0305e82c3301",
//!   "UserId": "customer-42",
//!   "AssignedAt": "2024-05-01T09:30:00Z"
//! }
//! ```
//!
//! camelCase keys are accepted on input, and `AssignedAt` may omit the UTC
//! offset (it is then read as UTC).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ItemId, WorkerId};

/// Errors produced while decoding an assignment event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("malformed assignment event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A work item was assigned to a worker by the upstream assigner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentEvent {
    #[serde(rename = "ItemId", alias = "itemId")]
    pub item_id: ItemId,
    #[serde(rename = "WorkerId", alias = "workerId")]
    pub worker_id: WorkerId,
    #[serde(rename = "UserId", alias = "userId")]
    pub user_id: String,
    #[serde(
        rename = "AssignedAt",
        alias = "assignedAt",
        deserialize_with = "timestamp::deserialize"
    )]
    pub assigned_at: DateTime<Utc>,
}

impl AssignmentEvent {
    pub fn new(
        item_id: ItemId,
        worker_id: WorkerId,
        user_id: impl Into<String>,
        assigned_at: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id,
            worker_id,
            user_id: user_id.into(),
            assigned_at,
        }
    }

    /// Decode a raw broker payload.
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        let text = std::str::from_utf8(payload)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Encode to the broker payload format.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Whether the event names `worker_id` as its assignee.
    pub fn is_for(&self, worker_id: WorkerId) -> bool {
        self.worker_id == worker_id
    }
}

mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}
