//! Assignment orchestrator: one durable queue and one consumer per worker.
//!
//! - **Startup**: a single background task loads the roster, declares the
//!   topology and subscribes each worker's consumer on its own channel.
//! - **Consumers**: independent tasks, one delivery at a time, manual ack.
//! - **Shutdown**: stop pulling, let in-flight deliveries finish, then close
//!   every channel and the shared connection.

mod config;
mod consumer;
mod registry;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use runner::AssignmentOrchestrator;
pub use types::{
    ConsumerState, OrchestratorError, OrchestratorStatus, StartupPhase, WorkerStatus,
};
