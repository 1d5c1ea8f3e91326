//! Assignment orchestrator implementation.
//!
//! Startup runs as one background task:
//! - load the roster
//! - connect once, then per worker open a channel, declare its queue and
//!   start its consumer
//!
//! Each consumer then runs as its own task. A worker whose topology or
//! subscription fails is marked failed; the others keep going.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::assignment::AssignmentProcessor;
use crate::broker::{
    BrokerConnection, BrokerConnector, BrokerError, QueueBinding, TopologyManager, TopologyPlan,
};
use crate::config::BrokerConfig;
use crate::metrics;
use crate::roster::RosterSource;

use super::config::OrchestratorConfig;
use super::consumer::{ConsumerCounters, RetryPolicy, WorkerConsumer};
use super::registry::ConsumerRegistry;
use super::types::{ConsumerState, OrchestratorError, OrchestratorStatus, StartupPhase};

/// Drives one consumer per roster worker.
pub struct AssignmentOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    prefetch: u16,
    roster_source: Arc<dyn RosterSource>,
    connector: Arc<dyn BrokerConnector>,
    topology: TopologyManager,
    processor: Arc<AssignmentProcessor>,

    // Runtime state
    running: AtomicBool,
    phase: watch::Sender<StartupPhase>,
    shutdown_tx: watch::Sender<bool>,
    registry: Mutex<ConsumerRegistry>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    startup_task: Mutex<Option<JoinHandle<()>>>,
}

impl AssignmentOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        config: OrchestratorConfig,
        broker: &BrokerConfig,
        roster_source: Arc<dyn RosterSource>,
        connector: Arc<dyn BrokerConnector>,
        processor: Arc<AssignmentProcessor>,
    ) -> Self {
        let (phase, _) = watch::channel(StartupPhase::NotStarted);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                prefetch: broker.prefetch_count,
                roster_source,
                connector,
                topology: TopologyManager::from_config(broker),
                processor,
                running: AtomicBool::new(false),
                phase,
                shutdown_tx,
                registry: Mutex::new(ConsumerRegistry::new()),
                connection: Mutex::new(None),
                startup_task: Mutex::new(None),
            }),
        }
    }

    /// Start the orchestrator (spawns the startup task and returns).
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return;
        }

        info!("Starting assignment orchestrator");

        self.inner.shutdown_tx.send_replace(false);
        *self.inner.registry.lock().await = ConsumerRegistry::new();

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run_startup().await });
        *self.inner.startup_task.lock().await = Some(task);
    }

    /// Stop the orchestrator gracefully.
    ///
    /// Consumers stop pulling deliveries; the ones handling a delivery finish
    /// it (up to `shutdown_timeout_ms`). Then every channel and the connection
    /// are closed.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            warn!("Orchestrator not running");
            return;
        }

        info!("Stopping assignment orchestrator");

        // Signal shutdown to startup and all consumers
        self.inner.shutdown_tx.send_replace(true);

        let timeout = self.inner.config.shutdown_timeout();

        if let Some(mut task) = self.inner.startup_task.lock().await.take() {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                warn!("Startup still running at shutdown, aborting it");
                task.abort();
            }
        }

        let failures = self.inner.registry.lock().await.release_all(timeout).await;
        if failures > 0 {
            warn!(failures, "Some channels failed to close");
        }

        if let Some(connection) = self.inner.connection.lock().await.take() {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close broker connection");
            }
        }

        self.inner.phase.send_replace(StartupPhase::Stopped);
        info!("Assignment orchestrator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Watch startup progress.
    pub fn subscribe_phase(&self) -> watch::Receiver<StartupPhase> {
        self.inner.phase.subscribe()
    }

    /// Get current orchestrator status.
    pub async fn status(&self) -> OrchestratorStatus {
        let phase = *self.inner.phase.borrow();
        let workers = self.inner.registry.lock().await.statuses();

        OrchestratorStatus {
            running: self.inner.running.load(Ordering::Relaxed),
            phase,
            workers,
        }
    }
}

impl Inner {
    fn stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn run_startup(self: Arc<Self>) {
        if let Err(e) = self.startup().await {
            error!(error = %e, "Orchestrator startup failed, no consumers running");
            self.phase.send_replace(StartupPhase::Failed);
        }
    }

    async fn startup(&self) -> Result<(), OrchestratorError> {
        self.phase.send_replace(StartupPhase::LoadingRoster);
        let roster = self.roster_source.load_worker_ids().await?;
        metrics::ROSTER_SIZE.set(roster.len() as i64);

        let bindings = match self.topology.plan(&roster) {
            TopologyPlan::NoConsumers => {
                warn!(
                    source = self.roster_source.name(),
                    "Roster is empty, no consumers to start"
                );
                self.phase.send_replace(StartupPhase::NoConsumers);
                return Ok(());
            }
            TopologyPlan::Bindings(bindings) => bindings,
        };

        info!(
            source = self.roster_source.name(),
            workers = bindings.len(),
            "Roster loaded"
        );

        if self.stopping() {
            return Ok(());
        }

        self.phase.send_replace(StartupPhase::DeclaringTopology);
        let connection = self.connector.connect().await?;
        *self.connection.lock().await = Some(Arc::clone(&connection));

        let mut shared_declared = false;
        let mut started = 0;
        for binding in &bindings {
            if self.stopping() {
                info!("Stop requested during startup");
                return Ok(());
            }

            let counters = self.registry.lock().await.register(binding.clone())?;

            match self
                .start_consumer(connection.as_ref(), binding, counters, !shared_declared)
                .await
            {
                Ok(()) => {
                    shared_declared = true;
                    started += 1;
                }
                Err(e) => {
                    error!(
                        worker_id = %binding.worker_id,
                        queue = %binding.queue_name,
                        error = %e,
                        "Failed to start consumer"
                    );
                    self.registry
                        .lock()
                        .await
                        .mark_failed(binding.worker_id, e.to_string());
                }
            }
        }

        info!(started, total = bindings.len(), "Consumers started");
        self.phase.send_replace(if started > 0 {
            StartupPhase::Consuming
        } else {
            StartupPhase::Failed
        });
        Ok(())
    }

    async fn start_consumer(
        &self,
        connection: &dyn BrokerConnection,
        binding: &QueueBinding,
        counters: Arc<ConsumerCounters>,
        declare_shared: bool,
    ) -> Result<(), BrokerError> {
        let worker_id = binding.worker_id;

        let channel = connection.open_channel().await?;
        // Registered before any declaration so shutdown closes it either way.
        self.registry
            .lock()
            .await
            .attach_channel(worker_id, Arc::clone(&channel));

        channel.set_prefetch(self.prefetch).await?;
        if declare_shared {
            self.topology.declare_shared(channel.as_ref()).await?;
        }
        self.topology
            .declare_binding(channel.as_ref(), binding)
            .await?;

        let consumer_tag = format!("{}-{}", self.config.consumer_tag_prefix, worker_id);
        let stream = channel.consume(&binding.queue_name, &consumer_tag).await?;

        counters.set_state(ConsumerState::Subscribed);

        let consumer = WorkerConsumer::new(
            binding.clone(),
            Arc::clone(&self.processor),
            RetryPolicy {
                max_attempts: self.config.max_attempts,
                requeue_delay: self.config.requeue_delay(),
            },
            counters,
        );
        let task = tokio::spawn(consumer.run(stream, self.shutdown_tx.subscribe()));
        self.registry.lock().await.attach_task(worker_id, task);

        info!(
            worker_id = %worker_id,
            queue = %binding.queue_name,
            consumer_tag = %consumer_tag,
            "Consumer subscribed"
        );
        Ok(())
    }
}
