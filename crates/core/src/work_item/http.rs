//! HTTP client for the work-item (chat) API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::config::WorkItemsConfig;
use crate::ids::WorkerId;

use super::{WorkItem, WorkItemError, WorkItemService};

/// Talks to the work-item API:
/// - `GET {base}/workers/{worker_id}/pending-item` (404 means none pending)
/// - `PUT {base}/items/{item_id}`
pub struct HttpWorkItemService {
    client: Client,
    base_url: String,
}

impl HttpWorkItemService {
    pub fn new(config: &WorkItemsConfig) -> Result<Self, WorkItemError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn pending_item_url(&self, worker_id: WorkerId) -> String {
        format!("{}/workers/{}/pending-item", self.base_url, worker_id)
    }

    fn item_url(&self, item: &WorkItem) -> String {
        format!("{}/items/{}", self.base_url, item.id)
    }
}

async fn api_error(response: reqwest::Response) -> WorkItemError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    WorkItemError::ApiError {
        status: status.as_u16(),
        message: body.chars().take(200).collect(),
    }
}

#[async_trait]
impl WorkItemService for HttpWorkItemService {
    fn name(&self) -> &str {
        "http"
    }

    async fn pending_item_for_worker(
        &self,
        worker_id: WorkerId,
    ) -> Result<Option<WorkItem>, WorkItemError> {
        let url = self.pending_item_url(worker_id);
        debug!(%worker_id, url = %url, "Looking up pending work item");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                WorkItemError::Unavailable(e.to_string())
            } else {
                WorkItemError::HttpError(e)
            }
        })?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => response
                .json::<WorkItem>()
                .await
                .map(Some)
                .map_err(|e| WorkItemError::ParseError(e.to_string())),
            _ => Err(api_error(response).await),
        }
    }

    async fn update_item(&self, item: &WorkItem) -> Result<(), WorkItemError> {
        let url = self.item_url(item);
        debug!(item_id = %item.id, url = %url, "Updating work item");

        let response = self
            .client
            .put(&url)
            .json(item)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    WorkItemError::Unavailable(e.to_string())
                } else {
                    WorkItemError::HttpError(e)
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response).await)
        }
    }
}
