//! Per-worker consumer loop.
//!
//! A consumer pulls one delivery at a time from its queue and settles it
//! before pulling the next. The stop signal is only observed between
//! deliveries: a delivery being handled always runs to completion.

use futures::{FutureExt, StreamExt};
use prometheus::IntGaugeVec;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::assignment::{AssignmentEvent, AssignmentProcessor, ProcessOutcome};
use crate::broker::{Delivery, DeliveryStream, Disposition, QueueBinding};
use crate::ids::{ItemId, WorkerId};
use crate::metrics;

use super::types::{ConsumerState, WorkerStatus};

/// Live state and counters of one consumer, shared with the registry.
///
/// Its state is counted in the consumers gauge for as long as it lives.
#[derive(Debug)]
pub(crate) struct ConsumerCounters {
    gauge: IntGaugeVec,
    state: AtomicU8,
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ConsumerCounters {
    pub(crate) fn new() -> Self {
        Self::with_gauge(metrics::CONSUMERS.clone())
    }

    pub(crate) fn with_gauge(gauge: IntGaugeVec) -> Self {
        gauge.with_label_values(&[ConsumerState::Idle.as_str()]).inc();
        Self {
            gauge,
            state: AtomicU8::new(ConsumerState::Idle as u8),
            acked: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConsumerState) {
        let previous = ConsumerState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            self.gauge.with_label_values(&[previous.as_str()]).dec();
            self.gauge.with_label_values(&[state.as_str()]).inc();
        }
    }

    pub(crate) fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Ack => &self.acked,
            Disposition::Requeue => &self.requeued,
            Disposition::Reject => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_error(&self, error: impl Into<String>) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.into());
        }
    }

    pub(crate) fn status(&self, binding: &QueueBinding) -> WorkerStatus {
        WorkerStatus {
            worker_id: binding.worker_id,
            queue_name: binding.queue_name.clone(),
            state: self.state(),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

impl Drop for ConsumerCounters {
    fn drop(&mut self) {
        self.gauge.with_label_values(&[self.state().as_str()]).dec();
    }
}

/// How failed deliveries are retried.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RetryPolicy {
    /// 0 = unbounded.
    pub max_attempts: u32,
    pub requeue_delay: Duration,
}

pub(crate) struct WorkerConsumer {
    binding: QueueBinding,
    processor: Arc<AssignmentProcessor>,
    policy: RetryPolicy,
    counters: Arc<ConsumerCounters>,
    /// Failed attempts per item, for `max_attempts`.
    attempts: HashMap<ItemId, u32>,
}

impl WorkerConsumer {
    pub(crate) fn new(
        binding: QueueBinding,
        processor: Arc<AssignmentProcessor>,
        policy: RetryPolicy,
        counters: Arc<ConsumerCounters>,
    ) -> Self {
        Self {
            binding,
            processor,
            policy,
            counters,
            attempts: HashMap::new(),
        }
    }

    fn worker_id(&self) -> WorkerId {
        self.binding.worker_id
    }

    /// Consume until the stream ends or `shutdown` turns true.
    pub(crate) async fn run(mut self, mut stream: DeliveryStream, mut shutdown: watch::Receiver<bool>) {
        self.counters.set_state(ConsumerState::Receiving);
        info!(
            worker_id = %self.worker_id(),
            queue = %self.binding.queue_name,
            "Consumer loop started"
        );

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.handle(delivery).await;
                }
                Some(Err(e)) => {
                    error!(
                        worker_id = %self.worker_id(),
                        error = %e,
                        "Delivery stream failed"
                    );
                    self.counters.set_error(e.to_string());
                    self.counters.set_state(ConsumerState::Failed);
                    return;
                }
                None => {
                    warn!(worker_id = %self.worker_id(), "Delivery stream ended");
                    break;
                }
            }
        }

        self.counters.set_state(ConsumerState::Stopped);
        info!(worker_id = %self.worker_id(), "Consumer loop stopped");
    }

    /// Handle one delivery and settle it. Never fails.
    pub(crate) async fn handle(&mut self, delivery: Delivery) -> Disposition {
        let started = Instant::now();
        let delivery_tag = delivery.delivery_tag;
        self.counters.set_state(ConsumerState::Processing);

        let (item_id, outcome) = match AssignmentEvent::decode(&delivery.payload) {
            Ok(event) => {
                if !event.is_for(self.worker_id()) {
                    warn!(
                        worker_id = %self.worker_id(),
                        event_worker_id = %event.worker_id,
                        item_id = %event.item_id,
                        delivery_tag,
                        "Assignment names another worker, processing it for this queue's worker"
                    );
                }
                debug!(
                    worker_id = %self.worker_id(),
                    item_id = %event.item_id,
                    delivery_tag,
                    redelivered = delivery.redelivered,
                    "Received assignment"
                );
                (Some(event.item_id), self.process_guarded(&event).await)
            }
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id(),
                    delivery_tag,
                    error = %e,
                    "Undecodable assignment payload"
                );
                (
                    None,
                    ProcessOutcome::DecodeFailed {
                        reason: e.to_string(),
                    },
                )
            }
        };

        let disposition = self.decide(item_id, &outcome);

        if disposition == Disposition::Requeue && !self.policy.requeue_delay.is_zero() {
            tokio::time::sleep(self.policy.requeue_delay).await;
        }

        match delivery.settle(disposition).await {
            Ok(()) => self.counters.record(disposition),
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id(),
                    delivery_tag,
                    error = %e,
                    "Failed to settle delivery"
                );
                self.counters.set_error(e.to_string());
            }
        }

        metrics::DELIVERIES_TOTAL
            .with_label_values(&[outcome.as_str()])
            .inc();
        metrics::DISPOSITIONS_TOTAL
            .with_label_values(&[disposition.as_str()])
            .inc();
        metrics::PROCESSING_DURATION
            .with_label_values(&[outcome.as_str()])
            .observe(started.elapsed().as_secs_f64());

        info!(
            worker_id = %self.worker_id(),
            delivery_tag,
            outcome = outcome.as_str(),
            disposition = disposition.as_str(),
            "Delivery settled"
        );

        self.counters.set_state(ConsumerState::Receiving);
        disposition
    }

    /// Run the processor; a panic counts as a retryable failure.
    async fn process_guarded(&self, event: &AssignmentEvent) -> ProcessOutcome {
        match AssertUnwindSafe(self.processor.process(self.worker_id(), event))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    worker_id = %self.worker_id(),
                    item_id = %event.item_id,
                    "Assignment processing panicked"
                );
                ProcessOutcome::UpdateFailed {
                    reason: "processing panicked".to_string(),
                }
            }
        }
    }

    /// Apply the attempt cap on top of the outcome's own disposition.
    fn decide(&mut self, item_id: Option<ItemId>, outcome: &ProcessOutcome) -> Disposition {
        let disposition = outcome.disposition();
        let Some(item_id) = item_id else {
            return disposition;
        };

        if disposition != Disposition::Requeue {
            self.attempts.remove(&item_id);
            return disposition;
        }
        if self.policy.max_attempts == 0 {
            return disposition;
        }

        let attempts = self.attempts.entry(item_id).or_insert(0);
        *attempts += 1;
        if *attempts < self.policy.max_attempts {
            return Disposition::Requeue;
        }

        self.attempts.remove(&item_id);
        metrics::ATTEMPTS_EXHAUSTED
            .with_label_values(&[outcome.as_str()])
            .inc();
        warn!(
            worker_id = %self.worker_id(),
            item_id = %item_id,
            max_attempts = self.policy.max_attempts,
            "Giving up on assignment after repeated failures"
        );
        Disposition::Reject
    }
}
