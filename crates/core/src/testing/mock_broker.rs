//! In-memory broker for testing.
//!
//! Models the parts of AMQP the relay relies on: idempotent declarations,
//! topic/direct/fanout routing, manual acknowledgement, requeue with the
//! redelivered flag, dead-lettering on reject, and requeue of unacknowledged
//! deliveries when their channel closes.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::assignment::AssignmentEvent;
use crate::broker::{
    routing_key_for, Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError,
    Delivery, DeliveryStream, Disposition, ExchangeKind, ExchangeSpec, QueueSpec, EXCHANGE_NAME,
};

/// A settled delivery, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub delivery_tag: u64,
    pub queue: String,
    pub disposition: Disposition,
    pub redelivered: bool,
}

/// A queue binding: (exchange, routing key, queue).
pub type MockBinding = (String, String, String);

struct MockQueue {
    spec: QueueSpec,
    backlog: VecDeque<(Vec<u8>, bool)>,
    consumer: Option<(u16, mpsc::UnboundedSender<Delivery>)>,
}

struct Unacked {
    queue: String,
    channel_id: u16,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    exchange_declarations: usize,
    queues: HashMap<String, MockQueue>,
    queue_declarations: usize,
    bindings: BTreeSet<MockBinding>,
    unacked: HashMap<u64, Unacked>,
    settlements: Vec<Settlement>,
    next_delivery_tag: u64,
    next_channel_id: u16,
    next_connection_id: u32,
    /// Open channel id -> owning connection id.
    open_channels: HashMap<u16, u32>,
    open_connections: HashSet<u32>,
    channels_opened: usize,
    channels_closed: usize,
    connections_opened: usize,
    connections_closed: usize,
    prefetch: HashMap<u16, u16>,
    fail_connect: bool,
    fail_channel_close: bool,
    fail_queue_declare: HashSet<String>,
}

/// Mock implementation of the broker traits.
///
/// Clones share the same broker, so a test can keep one handle for
/// publishing and inspection while the orchestrator uses another as its
/// connector.
///
/// # Example
///
/// ```rust,ignore
/// let broker = MockBroker::new();
/// let orchestrator = AssignmentOrchestrator::new(config, &broker_config, roster,
///     Arc::new(broker.clone()), processor);
/// orchestrator.start().await;
///
/// broker.publish_event(&event);
/// let settled = broker.wait_for_settlements(1, Duration::from_secs(2)).await;
/// assert_eq!(settled[0].disposition, Disposition::Ack);
/// ```
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    // -------------------------------------------------------------------------
    // Failure injection
    // -------------------------------------------------------------------------

    /// Make `connect` fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// Make declaring `queue` fail.
    pub fn fail_queue_declare(&self, queue: impl Into<String>) {
        self.lock().fail_queue_declare.insert(queue.into());
    }

    /// Channel close still releases the channel but reports an error.
    pub fn set_fail_channel_close(&self, fail: bool) {
        self.lock().fail_channel_close = fail;
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    /// Publish to an exchange. Returns the number of queues it was routed to;
    /// unroutable messages are dropped.
    pub fn publish(&self, exchange: &str, routing_key: &str, payload: impl Into<Vec<u8>>) -> usize {
        let mut state = self.lock();
        route(&self.state, &mut state, exchange, routing_key, payload.into())
    }

    /// Publish an event the way an upstream assigner does.
    pub fn publish_event(&self, event: &AssignmentEvent) -> usize {
        let payload = event.encode().unwrap_or_default();
        self.publish(EXCHANGE_NAME, &routing_key_for(event.worker_id), payload)
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.lock().exchanges.get(name).cloned()
    }

    pub fn exchange_declarations(&self) -> usize {
        self.lock().exchange_declarations
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.lock().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_declarations(&self) -> usize {
        self.lock().queue_declarations
    }

    pub fn bindings(&self) -> Vec<MockBinding> {
        self.lock().bindings.iter().cloned().collect()
    }

    /// Messages waiting in `queue` (not delivered to a consumer).
    pub fn backlog_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.backlog.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }

    pub fn settlements_for(&self, queue: &str) -> Vec<Settlement> {
        self.lock()
            .settlements
            .iter()
            .filter(|s| s.queue == queue)
            .cloned()
            .collect()
    }

    pub fn prefetch_for(&self, channel_id: u16) -> Option<u16> {
        self.lock().prefetch.get(&channel_id).copied()
    }

    pub fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    pub fn channels_closed(&self) -> usize {
        self.lock().channels_closed
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock().open_channels.len()
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn open_connection_count(&self) -> usize {
        self.lock().open_connections.len()
    }

    /// Poll until at least `count` settlements were recorded or `timeout`
    /// elapses. Returns what was recorded either way.
    pub async fn wait_for_settlements(&self, count: usize, timeout: Duration) -> Vec<Settlement> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settlements = self.settlements();
            if settlements.len() >= count || tokio::time::Instant::now() >= deadline {
                return settlements;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `count` queues have a consumer or `timeout` elapses.
    pub async fn wait_for_consumers(&self, count: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let consumers = self
                .lock()
                .queues
                .values()
                .filter(|q| q.consumer.is_some())
                .count();
            if consumers >= count || tokio::time::Instant::now() >= deadline {
                return consumers;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    // A panicking test thread must not wedge every other assertion.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

fn route(
    shared: &Arc<Mutex<BrokerState>>,
    state: &mut BrokerState,
    exchange: &str,
    routing_key: &str,
    payload: Vec<u8>,
) -> usize {
    let Some(kind) = state.exchanges.get(exchange).map(|e| e.kind) else {
        return 0;
    };
    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|(ex, key, _)| {
            ex == exchange
                && match kind {
                    ExchangeKind::Topic => topic_matches(key, routing_key),
                    ExchangeKind::Direct => key == routing_key,
                    ExchangeKind::Fanout => true,
                }
        })
        .map(|(_, _, queue)| queue.clone())
        .collect();

    for queue in &targets {
        enqueue(shared, state, queue, payload.clone(), false);
    }
    targets.len()
}

/// Hand a message to the queue's consumer, or keep it in the backlog.
fn enqueue(
    shared: &Arc<Mutex<BrokerState>>,
    state: &mut BrokerState,
    queue: &str,
    payload: Vec<u8>,
    redelivered: bool,
) {
    let Some(q) = state.queues.get(queue) else {
        return;
    };
    let Some((channel_id, sender)) = q.consumer.clone() else {
        if let Some(q) = state.queues.get_mut(queue) {
            q.backlog.push_back((payload, redelivered));
        }
        return;
    };

    state.next_delivery_tag += 1;
    let delivery_tag = state.next_delivery_tag;
    let delivery = Delivery::new(
        delivery_tag,
        payload.clone(),
        redelivered,
        MockAcker {
            state: Arc::clone(shared),
            delivery_tag,
        },
    );

    if sender.send(delivery).is_ok() {
        state.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue.to_string(),
                channel_id,
                payload,
                redelivered,
            },
        );
    } else if let Some(q) = state.queues.get_mut(queue) {
        q.consumer = None;
        q.backlog.push_back((payload, redelivered));
    }
}

fn close_channel_locked(shared: &Arc<Mutex<BrokerState>>, state: &mut BrokerState, channel_id: u16) {
    if state.open_channels.remove(&channel_id).is_none() {
        return;
    }
    state.channels_closed += 1;

    for q in state.queues.values_mut() {
        if q.consumer.as_ref().is_some_and(|(id, _)| *id == channel_id) {
            q.consumer = None;
        }
    }

    let orphaned: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, u)| u.channel_id == channel_id)
        .map(|(tag, _)| *tag)
        .collect();
    for tag in orphaned {
        if let Some(u) = state.unacked.remove(&tag) {
            enqueue(shared, state, &u.queue, u.payload, true);
        }
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        if state.fail_connect {
            return Err(BrokerError::Connection(
                "mock broker refused connection".to_string(),
            ));
        }
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.open_connections.insert(id);
        state.connections_opened += 1;
        Ok(Arc::new(MockConnection {
            state: Arc::clone(&self.state),
            id,
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<BrokerState>>,
    id: u32,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = lock_state(&self.state);
        if !state.open_connections.contains(&self.id) {
            return Err(BrokerError::Channel("connection is closed".to_string()));
        }
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.open_channels.insert(id, self.id);
        state.channels_opened += 1;
        Ok(Arc::new(MockChannel {
            state: Arc::clone(&self.state),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        lock_state(&self.state).open_connections.contains(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = lock_state(&self.state);
        if !state.open_connections.remove(&self.id) {
            return Ok(());
        }
        state.connections_closed += 1;
        let channels: Vec<u16> = state
            .open_channels
            .iter()
            .filter(|(_, conn)| **conn == self.id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            close_channel_locked(&self.state, &mut state, channel_id);
        }
        Ok(())
    }
}

struct MockChannel {
    state: Arc<Mutex<BrokerState>>,
    id: u16,
}

impl MockChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = lock_state(&self.state);
        if state.open_channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(BrokerError::Channel(format!("channel {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    fn id(&self) -> u16 {
        self.id
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.open_state()?.prefetch.insert(self.id, count);
        Ok(())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing != spec {
                return Err(BrokerError::Declare {
                    kind: "exchange",
                    name: spec.name.clone(),
                    reason: "PRECONDITION_FAILED - inequivalent arguments".to_string(),
                });
            }
        }
        state.exchanges.insert(spec.name.clone(), spec.clone());
        state.exchange_declarations += 1;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if state.fail_queue_declare.contains(&spec.name) {
            return Err(BrokerError::Declare {
                kind: "queue",
                name: spec.name.clone(),
                reason: "ACCESS_REFUSED - injected failure".to_string(),
            });
        }
        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.spec != *spec {
                return Err(BrokerError::Declare {
                    kind: "queue",
                    name: spec.name.clone(),
                    reason: "PRECONDITION_FAILED - inequivalent arguments".to_string(),
                });
            }
        } else {
            state.queues.insert(
                spec.name.clone(),
                MockQueue {
                    spec: spec.clone(),
                    backlog: VecDeque::new(),
                    consumer: None,
                },
            );
        }
        state.queue_declarations += 1;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: "NOT_FOUND".to_string(),
            });
        }
        state.bindings.insert((
            exchange.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.open_state()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let backlog = match state.queues.get_mut(queue) {
            Some(q) if q.consumer.is_none() => {
                q.consumer = Some((self.id, tx));
                std::mem::take(&mut q.backlog)
            }
            Some(_) => {
                return Err(BrokerError::Consume {
                    queue: queue.to_string(),
                    reason: "queue already has a consumer".to_string(),
                })
            }
            None => {
                return Err(BrokerError::Consume {
                    queue: queue.to_string(),
                    reason: "NOT_FOUND".to_string(),
                })
            }
        };
        for (payload, redelivered) in backlog {
            enqueue(&self.state, &mut state, queue, payload, redelivered);
        }

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = lock_state(&self.state);
        close_channel_locked(&self.state, &mut state, self.id);
        if state.fail_channel_close {
            return Err(BrokerError::Close {
                what: format!("channel {}", self.id),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

struct MockAcker {
    state: Arc<Mutex<BrokerState>>,
    delivery_tag: u64,
}

impl MockAcker {
    fn settle(&self, disposition: Disposition) -> Result<(), BrokerError> {
        let mut state = lock_state(&self.state);
        let Some(unacked) = state.unacked.remove(&self.delivery_tag) else {
            return Err(BrokerError::Settle {
                delivery_tag: self.delivery_tag,
                reason: "unknown delivery tag (channel closed?)".to_string(),
            });
        };
        state.settlements.push(Settlement {
            delivery_tag: self.delivery_tag,
            queue: unacked.queue.clone(),
            disposition,
            redelivered: unacked.redelivered,
        });

        match disposition {
            Disposition::Ack => {}
            Disposition::Requeue => {
                enqueue(&self.state, &mut state, &unacked.queue, unacked.payload, true);
            }
            Disposition::Reject => {
                let dlx = state
                    .queues
                    .get(&unacked.queue)
                    .and_then(|q| q.spec.dead_letter_exchange.clone());
                if let Some(dlx) = dlx {
                    route(&self.state, &mut state, &dlx, &unacked.queue, unacked.payload);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(Disposition::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(if requeue {
            Disposition::Requeue
        } else {
            Disposition::Reject
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &MockBroker) -> Arc<dyn BrokerChannel> {
        broker.connect().await.unwrap().open_channel().await.unwrap()
    }

    async fn declare_queue(channel: &dyn BrokerChannel, queue: &str, key: &str) {
        channel
            .declare_exchange(&ExchangeSpec {
                name: EXCHANGE_NAME.to_string(),
                kind: ExchangeKind::Topic,
                durable: true,
            })
            .await
            .unwrap();
        channel.declare_queue(&QueueSpec::durable(queue)).await.unwrap();
        channel.bind_queue(queue, EXCHANGE_NAME, key).await.unwrap();
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("agent.a", "agent.a"));
        assert!(!topic_matches("agent.a", "agent.b"));
        assert!(topic_matches("agent.*", "agent.b"));
        assert!(!topic_matches("agent.*", "agent.b.c"));
        assert!(topic_matches("agent.#", "agent.b.c"));
        assert!(topic_matches("#", "anything.at.all"));
    }

    #[tokio::test]
    async fn test_publish_without_consumer_goes_to_backlog() {
        let broker = MockBroker::new();
        let ch = channel(&broker).await;
        declare_queue(ch.as_ref(), "agent.a.queue", "agent.a").await;

        assert_eq!(broker.publish(EXCHANGE_NAME, "agent.a", b"x".to_vec()), 1);
        assert_eq!(broker.publish(EXCHANGE_NAME, "agent.b", b"y".to_vec()), 0);
        assert_eq!(broker.backlog_len("agent.a.queue"), 1);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_flag() {
        let broker = MockBroker::new();
        let ch = channel(&broker).await;
        declare_queue(ch.as_ref(), "agent.a.queue", "agent.a").await;
        let mut stream = ch.consume("agent.a.queue", "t").await.unwrap();

        broker.publish(EXCHANGE_NAME, "agent.a", b"x".to_vec());
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.settle(Disposition::Requeue).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.payload, b"x");
        second.settle(Disposition::Ack).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_reject_dead_letters() {
        let broker = MockBroker::new();
        let ch = channel(&broker).await;
        ch.declare_exchange(&ExchangeSpec {
            name: "dlx".to_string(),
            kind: ExchangeKind::Fanout,
            durable: true,
        })
        .await
        .unwrap();
        ch.declare_queue(&QueueSpec::durable("dead")).await.unwrap();
        ch.bind_queue("dead", "dlx", "").await.unwrap();
        ch.declare_exchange(&ExchangeSpec {
            name: EXCHANGE_NAME.to_string(),
            kind: ExchangeKind::Topic,
            durable: true,
        })
        .await
        .unwrap();
        ch.declare_queue(&QueueSpec {
            dead_letter_exchange: Some("dlx".to_string()),
            ..QueueSpec::durable("agent.a.queue")
        })
        .await
        .unwrap();
        ch.bind_queue("agent.a.queue", EXCHANGE_NAME, "agent.a")
            .await
            .unwrap();
        let mut stream = ch.consume("agent.a.queue", "t").await.unwrap();

        broker.publish(EXCHANGE_NAME, "agent.a", b"bad".to_vec());
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.settle(Disposition::Reject).await.unwrap();

        assert_eq!(broker.backlog_len("dead"), 1);
        assert_eq!(broker.backlog_len("agent.a.queue"), 0);
    }

    #[tokio::test]
    async fn test_closing_channel_requeues_unacked() {
        let broker = MockBroker::new();
        let ch = channel(&broker).await;
        declare_queue(ch.as_ref(), "agent.a.queue", "agent.a").await;
        let mut stream = ch.consume("agent.a.queue", "t").await.unwrap();

        broker.publish(EXCHANGE_NAME, "agent.a", b"x".to_vec());
        let delivery = stream.next().await.unwrap().unwrap();
        ch.close().await.unwrap();

        assert!(delivery.settle(Disposition::Ack).await.is_err());
        assert_eq!(broker.backlog_len("agent.a.queue"), 1);
        assert!(!broker.has_consumer("agent.a.queue"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_redeclare_with_different_arguments_fails() {
        let broker = MockBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue(&QueueSpec::durable("q")).await.unwrap();
        ch.declare_queue(&QueueSpec::durable("q")).await.unwrap();

        let mut transient = QueueSpec::durable("q");
        transient.durable = false;
        assert!(ch.declare_queue(&transient).await.is_err());
        assert_eq!(broker.queue_declarations(), 2);
    }
}
