//! One handle per worker: its binding, channel, counters and consumer task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, QueueBinding};
use crate::ids::WorkerId;

use super::consumer::ConsumerCounters;
use super::types::{ConsumerState, OrchestratorError, WorkerStatus};

pub(crate) struct ConsumerHandle {
    pub binding: QueueBinding,
    pub counters: Arc<ConsumerCounters>,
    channel: Option<Arc<dyn BrokerChannel>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    handles: BTreeMap<WorkerId, ConsumerHandle>,
}

impl ConsumerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Register a worker. Fails if it already has a handle.
    pub(crate) fn register(
        &mut self,
        binding: QueueBinding,
    ) -> Result<Arc<ConsumerCounters>, OrchestratorError> {
        let worker_id = binding.worker_id;
        if self.handles.contains_key(&worker_id) {
            return Err(OrchestratorError::DuplicateConsumer(worker_id));
        }
        let counters = Arc::new(ConsumerCounters::new());
        self.handles.insert(
            worker_id,
            ConsumerHandle {
                binding,
                counters: Arc::clone(&counters),
                channel: None,
                task: None,
            },
        );
        Ok(counters)
    }

    pub(crate) fn attach_channel(&mut self, worker_id: WorkerId, channel: Arc<dyn BrokerChannel>) {
        if let Some(handle) = self.handles.get_mut(&worker_id) {
            handle.channel = Some(channel);
        }
    }

    pub(crate) fn attach_task(&mut self, worker_id: WorkerId, task: JoinHandle<()>) {
        if let Some(handle) = self.handles.get_mut(&worker_id) {
            handle.task = Some(task);
        }
    }

    pub(crate) fn mark_failed(&self, worker_id: WorkerId, error: String) {
        if let Some(handle) = self.handles.get(&worker_id) {
            handle.counters.set_error(error);
            handle.counters.set_state(ConsumerState::Failed);
        }
    }

    pub(crate) fn statuses(&self) -> Vec<WorkerStatus> {
        self.handles
            .values()
            .map(|handle| handle.counters.status(&handle.binding))
            .collect()
    }

    /// Wait for every consumer task (aborting those still running after
    /// `timeout`), then close every channel. A failed close does not stop the
    /// remaining ones. Returns the number of channels that failed to close.
    pub(crate) async fn release_all(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;

        for (worker_id, handle) in self.handles.iter_mut() {
            let Some(mut task) = handle.task.take() else {
                continue;
            };
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!(
                    worker_id = %worker_id,
                    "Consumer did not finish in time, aborting"
                );
                task.abort();
            }
        }

        let mut failures = 0;
        for (worker_id, handle) in self.handles.iter_mut() {
            if let Some(channel) = handle.channel.take() {
                match channel.close().await {
                    Ok(()) => debug!(worker_id = %worker_id, "Closed channel"),
                    Err(e) => {
                        warn!(worker_id = %worker_id, error = %e, "Failed to close channel");
                        failures += 1;
                    }
                }
            }
            if handle.counters.state() != ConsumerState::Failed {
                handle.counters.set_state(ConsumerState::Stopped);
            }
        }

        failures
    }
}
