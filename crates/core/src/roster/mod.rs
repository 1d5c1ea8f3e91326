//! Worker roster: the set of workers that get a queue and a consumer.
//!
//! The roster is loaded once at startup and never changes during a run.

mod http;
mod static_roster;

pub use http::HttpRoster;
pub use static_roster::StaticRoster;

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::config::{RosterConfig, RosterSourceKind};
use crate::ids::WorkerId;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Roster API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Failed to parse roster: {0}")]
    ParseError(String),

    #[error("Roster source not configured: {0}")]
    NotConfigured(String),
}

/// Immutable, ordered, duplicate-free set of workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    workers: BTreeSet<WorkerId>,
}

impl Roster {
    pub fn new(workers: impl IntoIterator<Item = WorkerId>) -> Self {
        workers.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        self.workers.contains(worker_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerId> {
        self.workers.iter()
    }
}

impl FromIterator<WorkerId> for Roster {
    fn from_iter<I: IntoIterator<Item = WorkerId>>(iter: I) -> Self {
        Self {
            workers: iter.into_iter().collect(),
        }
    }
}

/// Supplies the current set of workers.
#[async_trait]
pub trait RosterSource: Send + Sync {
    fn name(&self) -> &str;

    /// Load the worker set. An empty roster is a valid result.
    async fn load_worker_ids(&self) -> Result<Roster, RosterError>;
}

/// Build the roster source selected in configuration.
pub fn create_roster_source(config: &RosterConfig) -> Result<Box<dyn RosterSource>, RosterError> {
    match config.source {
        RosterSourceKind::Static => Ok(Box::new(StaticRoster::new(config.worker_ids.clone()))),
        RosterSourceKind::Http => {
            let url = config.url.as_deref().ok_or_else(|| {
                RosterError::NotConfigured("roster.url is required for the http source".into())
            })?;
            Ok(Box::new(HttpRoster::new(url, config.timeout_secs)?))
        }
    }
}
