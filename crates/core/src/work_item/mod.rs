//! Work-item service boundary.
//!
//! The relay never owns work-item state. It looks up the item pending for a
//! worker and writes the assignment transition back through this trait.

mod http;
mod types;

pub use http::HttpWorkItemService;
pub use types::{ItemStatus, WorkItem};

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::WorkerId;

/// Errors returned by a work-item service.
#[derive(Debug, Error)]
pub enum WorkItemError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// API returned an error status.
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// Response body could not be parsed.
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Service is unreachable or refused the operation.
    #[error("Work-item service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait WorkItemService: Send + Sync {
    /// Returns the name of this implementation.
    fn name(&self) -> &str;

    /// Item currently pending for `worker_id`, if any.
    async fn pending_item_for_worker(
        &self,
        worker_id: WorkerId,
    ) -> Result<Option<WorkItem>, WorkItemError>;

    /// Persist the mutated item. Returning `Ok` means the change is durable.
    async fn update_item(&self, item: &WorkItem) -> Result<(), WorkItemError>;
}
