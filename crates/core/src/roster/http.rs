//! Roster loaded from the worker directory API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::ids::WorkerId;

use super::{Roster, RosterError, RosterSource};

/// Fetches `GET {url}` and accepts either a bare JSON array of worker ids or
/// an array of objects carrying an `id` field.
pub struct HttpRoster {
    client: Client,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RosterEntry {
    Id(WorkerId),
    Object { id: WorkerId },
}

impl RosterEntry {
    fn worker_id(&self) -> WorkerId {
        match self {
            RosterEntry::Id(id) | RosterEntry::Object { id } => *id,
        }
    }
}

impl HttpRoster {
    pub fn new(url: &str, timeout_secs: u32) -> Result<Self, RosterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs as u64))
            .build()?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

fn parse_roster(body: &str) -> Result<Roster, RosterError> {
    let entries: Vec<RosterEntry> =
        serde_json::from_str(body).map_err(|e| RosterError::ParseError(e.to_string()))?;
    Ok(entries.iter().map(RosterEntry::worker_id).collect())
}

#[async_trait]
impl RosterSource for HttpRoster {
    fn name(&self) -> &str {
        "http"
    }

    async fn load_worker_ids(&self) -> Result<Roster, RosterError> {
        debug!(url = %self.url, "Loading worker roster");
        let response = self.client.get(&self.url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RosterError::ApiError {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        let body = response.text().await?;
        parse_roster(&body)
    }
}
