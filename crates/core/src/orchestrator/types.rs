//! Types for the assignment orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::WorkerId;

/// Errors that can occur during orchestration startup.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Roster could not be loaded.
    #[error("roster error: {0}")]
    Roster(#[from] crate::roster::RosterError),

    /// Broker connection or topology error.
    #[error("broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),

    /// A second consumer was registered for the same worker.
    #[error("consumer already registered for worker {0}")]
    DuplicateConsumer(WorkerId),
}

/// Lifecycle of one worker's consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConsumerState {
    Idle = 0,
    /// Subscription registered, loop not yet running.
    Subscribed = 1,
    /// Waiting for the next delivery.
    Receiving = 2,
    /// Handling a delivery.
    Processing = 3,
    Stopped = 4,
    /// Topology, subscription or delivery stream failed.
    Failed = 5,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Subscribed => "subscribed",
            ConsumerState::Receiving => "receiving",
            ConsumerState::Processing => "processing",
            ConsumerState::Stopped => "stopped",
            ConsumerState::Failed => "failed",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsumerState::Subscribed,
            2 => ConsumerState::Receiving,
            3 => ConsumerState::Processing,
            4 => ConsumerState::Stopped,
            5 => ConsumerState::Failed,
            _ => ConsumerState::Idle,
        }
    }
}

/// Where the background startup task is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase {
    #[default]
    NotStarted,
    LoadingRoster,
    DeclaringTopology,
    /// Startup finished with at least one consumer running.
    Consuming,
    /// The roster was empty.
    NoConsumers,
    /// Roster, connection or every consumer failed.
    Failed,
    Stopped,
}

impl StartupPhase {
    /// Startup has finished, one way or another.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            StartupPhase::Consuming
                | StartupPhase::NoConsumers
                | StartupPhase::Failed
                | StartupPhase::Stopped
        )
    }
}

/// Per-worker consumer status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub queue_name: String,
    pub state: ConsumerState,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Whether the orchestrator is running.
    pub running: bool,
    pub phase: StartupPhase,
    pub workers: Vec<WorkerStatus>,
}
