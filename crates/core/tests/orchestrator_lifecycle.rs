//! Orchestrator lifecycle integration tests.
//!
//! These tests run the full path against in-memory collaborators:
//! roster -> topology -> consumer -> work-item update -> notification -> settle

use std::sync::Arc;
use std::time::Duration;

use assignrelay_core::{
    broker::{queue_name_for, routing_key_for, DEAD_LETTER_QUEUE, EXCHANGE_NAME},
    config::BrokerConfig,
    group_key_for,
    testing::{fixtures, MockBroker, MockGroupSender, MockRoster, MockWorkItemService},
    AssignmentEvent, AssignmentOrchestrator, AssignmentProcessor, ConsumerState, Disposition, ExchangeKind,
    ItemId, ItemStatus, NotificationFanout, OrchestratorConfig, StartupPhase, WorkerId,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Test helper to create all dependencies for orchestrator testing.
struct TestHarness {
    broker: MockBroker,
    roster: Arc<MockRoster>,
    work_items: Arc<MockWorkItemService>,
    sender: Arc<MockGroupSender>,
}

impl TestHarness {
    fn new(workers: Vec<WorkerId>) -> Self {
        Self {
            broker: MockBroker::new(),
            roster: Arc::new(MockRoster::new(workers)),
            work_items: Arc::new(MockWorkItemService::new()),
            sender: Arc::new(MockGroupSender::new()),
        }
    }

    fn create_orchestrator(
        &self,
        config: OrchestratorConfig,
        broker_config: &BrokerConfig,
    ) -> AssignmentOrchestrator {
        let processor = AssignmentProcessor::new(
            self.work_items.clone(),
            NotificationFanout::new(self.sender.clone()),
        );

        AssignmentOrchestrator::new(
            config,
            broker_config,
            self.roster.clone(),
            Arc::new(self.broker.clone()),
            Arc::new(processor),
        )
    }

    /// Start an orchestrator and wait until startup has settled.
    async fn start(&self, config: OrchestratorConfig) -> (AssignmentOrchestrator, StartupPhase) {
        self.start_with(config, &BrokerConfig::default()).await
    }

    async fn start_with(
        &self,
        config: OrchestratorConfig,
        broker_config: &BrokerConfig,
    ) -> (AssignmentOrchestrator, StartupPhase) {
        let orchestrator = self.create_orchestrator(config, broker_config);
        orchestrator.start().await;

        let mut phase = orchestrator.subscribe_phase();
        let settled = *tokio::time::timeout(TIMEOUT, phase.wait_for(|p| p.is_settled()))
            .await
            .expect("startup did not settle in time")
            .expect("phase channel closed");
        (orchestrator, settled)
    }
}

fn fast_requeue() -> OrchestratorConfig {
    OrchestratorConfig {
        requeue_delay_ms: 20,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_topology_declared_once_per_worker_and_idempotent_across_restarts() {
    let workers = fixtures::workers(3);
    let harness = TestHarness::new(workers.clone());

    let (orchestrator, phase) = harness.start(OrchestratorConfig::default()).await;
    assert_eq!(phase, StartupPhase::Consuming);

    let exchange = harness.broker.exchange(EXCHANGE_NAME).unwrap();
    assert_eq!(exchange.kind, ExchangeKind::Topic);
    assert!(exchange.durable);

    for worker in &workers {
        let queue = harness.broker.queue(&queue_name_for(*worker)).unwrap();
        assert!(queue.durable);
        assert!(!queue.exclusive);
        assert!(!queue.auto_delete);
        assert!(harness.broker.has_consumer(&queue.name));
    }
    let bindings = harness.broker.bindings();
    assert_eq!(bindings.len(), 3);
    for worker in &workers {
        assert!(bindings.contains(&(
            EXCHANGE_NAME.to_string(),
            routing_key_for(*worker),
            queue_name_for(*worker),
        )));
    }

    orchestrator.stop().await;

    // Second run against the same broker
    let (orchestrator, phase) = harness.start(OrchestratorConfig::default()).await;
    assert_eq!(phase, StartupPhase::Consuming);
    assert_eq!(harness.broker.queue_names().len(), 3);
    assert_eq!(harness.broker.bindings().len(), 3);
    assert_eq!(harness.broker.queue_declarations(), 6);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_valid_event_is_persisted_notified_and_acked() {
    let worker = WorkerId::random();
    let harness = TestHarness::new(vec![worker]);
    let item = fixtures::pending_item("customer-1");
    harness.work_items.set_pending(worker, item.clone()).await;
    harness.sender.set_group_size(1).await;

    let (orchestrator, _) = harness.start(OrchestratorConfig::default()).await;
    assert_eq!(harness.broker.publish_event(&fixtures::assignment(worker, item.id)), 1);

    let settled = harness.broker.wait_for_settlements(1, TIMEOUT).await;
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].disposition, Disposition::Ack);

    let updates = harness.work_items.updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id, item.id);
    assert_eq!(updates[0].status, ItemStatus::Assigned);
    assert_eq!(updates[0].worker_id, Some(worker));

    let sent = harness.sender.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].group, group_key_for(worker));
    assert_eq!(sent[0].event, "ItemAssigned");
    assert_eq!(sent[0].payload["itemId"], item.id.to_string());

    // Acked: nothing left to redeliver
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.broker.settlements().len(), 1);
    assert_eq!(harness.broker.unacked_count(), 0);
    assert_eq!(harness.broker.backlog_len(&queue_name_for(worker)), 0);

    let status = orchestrator.status().await;
    assert_eq!(status.workers[0].acked, 1);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_event_with_empty_user_id_is_persisted_and_acked() {
    let worker = WorkerId::random();
    let harness = TestHarness::new(vec![worker]);
    let item = fixtures::pending_item("customer-1");
    harness.work_items.set_pending(worker, item.clone()).await;

    let (orchestrator, _) = harness.start(OrchestratorConfig::default()).await;
    let event = AssignmentEvent::new(item.id, worker, "", chrono::Utc::now());
    assert_eq!(harness.broker.publish_event(&event), 1);

    let settled = harness.broker.wait_for_settlements(1, TIMEOUT).await;
    assert_eq!(settled[0].disposition, Disposition::Ack);
    assert_eq!(harness.work_items.updates().await.len(), 1);
    let sent = harness.sender.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload["userId"], "");
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_missing_item_is_requeued_without_update_or_notify() {
    let worker = WorkerId::random();
    let harness = TestHarness::new(vec![worker]);

    let (orchestrator, _) = harness.start(fast_requeue()).await;
    harness
        .broker
        .publish_event(&fixtures::assignment(worker, ItemId::random()));

    let settled = harness.broker.wait_for_settlements(2, TIMEOUT).await;
    assert!(settled.len() >= 2);
    assert_eq!(settled[0].disposition, Disposition::Requeue);
    assert!(!settled[0].redelivered);
    assert!(settled[1].redelivered);

    assert!(harness.work_items.updates().await.is_empty());
    assert!(harness.sender.sent().await.is_empty());
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_requeued_item_succeeds_once_it_becomes_pending() {
    let worker = WorkerId::random();
    let harness = TestHarness::new(vec![worker]);

    let (orchestrator, _) = harness.start(fast_requeue()).await;
    let item = fixtures::pending_item("customer-1");
    harness
        .broker
        .publish_event(&fixtures::assignment(worker, item.id));

    harness.broker.wait_for_settlements(1, TIMEOUT).await;
    harness.work_items.set_pending(worker, item).await;

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while harness.work_items.updates().await.is_empty() && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    orchestrator.stop().await;
    let settled = harness.broker.settlements();
    assert_eq!(settled.last().unwrap().disposition, Disposition::Ack);
    assert_eq!(harness.work_items.updates().await.len(), 1);
    assert_eq!(harness.sender.sent().await.len(), 1);
}

#[tokio::test]
async fn test_max_attempts_dead_letters_the_message() {
    let worker = WorkerId::random();
    let harness = TestHarness::new(vec![worker]);
    let broker_config = BrokerConfig {
        dead_letter_exchange: Some("chat.agent.dlx".to_string()),
        ..Default::default()
    };
    let config = OrchestratorConfig {
        max_attempts: 3,
        ..Default::default()
    };

    let (orchestrator, _) = harness.start_with(config, &broker_config).await;
    harness
        .broker
        .publish_event(&fixtures::assignment(worker, ItemId::random()));

    let settled = harness.broker.wait_for_settlements(3, TIMEOUT).await;
    let dispositions: Vec<Disposition> = settled.iter().map(|s| s.disposition).collect();
    assert_eq!(
        dispositions,
        vec![Disposition::Requeue, Disposition::Requeue, Disposition::Reject]
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.broker.settlements().len(), 3);
    assert_eq!(harness.broker.backlog_len(DEAD_LETTER_QUEUE), 1);

    let status = orchestrator.status().await;
    assert_eq!(status.workers[0].requeued, 2);
    assert_eq!(status.workers[0].rejected, 1);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_malformed_payload_is_rejected_and_consumer_keeps_going() {
    let worker = WorkerId::random();
    let harness = TestHarness::new(vec![worker]);
    let item = fixtures::pending_item("customer-1");
    harness.work_items.set_pending(worker, item.clone()).await;

    let (orchestrator, _) = harness.start(OrchestratorConfig::default()).await;
    let routing_key = routing_key_for(worker);
    harness
        .broker
        .publish(EXCHANGE_NAME, &routing_key, b"{\"ItemId\": 42".to_vec());
    harness
        .broker
        .publish(EXCHANGE_NAME, &routing_key, vec![0xff, 0xfe, 0x00]);
    harness
        .broker
        .publish_event(&fixtures::assignment(worker, item.id));

    let settled = harness.broker.wait_for_settlements(3, TIMEOUT).await;
    let dispositions: Vec<Disposition> = settled.iter().map(|s| s.disposition).collect();
    assert_eq!(
        dispositions,
        vec![Disposition::Reject, Disposition::Reject, Disposition::Ack]
    );
    assert_eq!(harness.work_items.updates().await.len(), 1);

    let status = orchestrator.status().await;
    assert_ne!(status.workers[0].state, ConsumerState::Failed);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_notification_failure_still_acks() {
    let worker = WorkerId::random();
    let harness = TestHarness::new(vec![worker]);
    let item = fixtures::pending_item("customer-1");
    harness.work_items.set_pending(worker, item.clone()).await;
    harness.sender.set_fail(true).await;

    let (orchestrator, _) = harness.start(OrchestratorConfig::default()).await;
    harness
        .broker
        .publish_event(&fixtures::assignment(worker, item.id));

    let settled = harness.broker.wait_for_settlements(1, TIMEOUT).await;
    assert_eq!(settled[0].disposition, Disposition::Ack);
    assert_eq!(harness.work_items.updates().await.len(), 1);

    // Not retried through the broker
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.broker.settlements().len(), 1);
    assert_eq!(harness.work_items.updates().await.len(), 1);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_processor_panic_is_requeued_and_consumer_survives() {
    let worker = WorkerId::random();
    let harness = TestHarness::new(vec![worker]);
    harness.work_items.set_panic_on_lookup(true).await;

    let (orchestrator, _) = harness.start(fast_requeue()).await;
    harness
        .broker
        .publish_event(&fixtures::assignment(worker, ItemId::random()));

    let settled = harness.broker.wait_for_settlements(1, TIMEOUT).await;
    assert_eq!(settled[0].disposition, Disposition::Requeue);

    let status = orchestrator.status().await;
    assert_ne!(status.workers[0].state, ConsumerState::Failed);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_two_workers_processed_independently() {
    let workers = fixtures::workers(2);
    let harness = TestHarness::new(workers.clone());
    harness
        .work_items
        .set_update_delay(Duration::from_millis(150))
        .await;

    let mut items = Vec::new();
    for worker in &workers {
        let item = fixtures::pending_item("customer-1");
        harness.work_items.set_pending(*worker, item.clone()).await;
        items.push(item);
    }

    let (orchestrator, _) = harness.start(OrchestratorConfig::default()).await;
    let started = std::time::Instant::now();
    for (worker, item) in workers.iter().zip(&items) {
        harness
            .broker
            .publish_event(&fixtures::assignment(*worker, item.id));
    }

    let settled = harness.broker.wait_for_settlements(2, TIMEOUT).await;
    assert_eq!(settled.len(), 2);
    assert!(settled.iter().all(|s| s.disposition == Disposition::Ack));
    // Both updates overlapped rather than running back to back
    assert!(started.elapsed() < Duration::from_millis(290));

    for (worker, item) in workers.iter().zip(&items) {
        let updates = harness.work_items.updates_for(*worker).await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].id, item.id);
        assert_eq!(harness.sender.sent_to(&group_key_for(*worker)).await.len(), 1);
        assert_eq!(harness.broker.settlements_for(&queue_name_for(*worker)).len(), 1);
    }
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_empty_roster_starts_no_consumers() {
    let harness = TestHarness::new(Vec::new());

    let (orchestrator, phase) = harness.start(OrchestratorConfig::default()).await;
    assert_eq!(phase, StartupPhase::NoConsumers);
    assert!(orchestrator.is_running());
    assert_eq!(harness.broker.connections_opened(), 0);
    assert!(harness.broker.queue_names().is_empty());

    orchestrator.stop().await;
    assert_eq!(orchestrator.status().await.phase, StartupPhase::Stopped);
}

#[tokio::test]
async fn test_roster_failure_is_reported_not_fatal() {
    let harness = TestHarness::new(fixtures::workers(1));
    harness.roster.set_fail(true).await;

    let (orchestrator, phase) = harness.start(OrchestratorConfig::default()).await;
    assert_eq!(phase, StartupPhase::Failed);
    assert!(orchestrator.status().await.workers.is_empty());
    assert_eq!(harness.broker.connections_opened(), 0);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_connect_failure_is_reported_not_fatal() {
    let harness = TestHarness::new(fixtures::workers(2));
    harness.broker.set_fail_connect(true);

    let (orchestrator, phase) = harness.start(OrchestratorConfig::default()).await;
    assert_eq!(phase, StartupPhase::Failed);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_one_worker_topology_failure_does_not_stop_others() {
    let workers = fixtures::workers(3);
    let harness = TestHarness::new(workers.clone());
    let broken = workers[1];
    harness.broker.fail_queue_declare(queue_name_for(broken));

    let (orchestrator, phase) = harness.start(OrchestratorConfig::default()).await;
    assert_eq!(phase, StartupPhase::Consuming);

    let status = orchestrator.status().await;
    assert_eq!(status.workers.len(), 3);
    for worker in status.workers {
        if worker.worker_id == broken {
            assert_eq!(worker.state, ConsumerState::Failed);
            assert!(worker.last_error.is_some());
        } else {
            assert_ne!(worker.state, ConsumerState::Failed);
            assert!(harness.broker.has_consumer(&worker.queue_name));
        }
    }

    // The failed worker's channel is still released on stop
    orchestrator.stop().await;
    assert_eq!(harness.broker.open_channel_count(), 0);
    assert_eq!(harness.broker.channels_closed(), 3);
}

#[tokio::test]
async fn test_stop_releases_every_channel_and_the_connection() {
    let harness = TestHarness::new(fixtures::workers(3));
    harness.broker.set_fail_channel_close(true);

    let (orchestrator, _) = harness.start(OrchestratorConfig::default()).await;
    assert_eq!(harness.broker.open_channel_count(), 3);
    assert_eq!(harness.broker.connections_opened(), 1);

    orchestrator.stop().await;
    assert!(!orchestrator.is_running());
    assert_eq!(harness.broker.channels_closed(), 3);
    assert_eq!(harness.broker.open_channel_count(), 0);
    assert_eq!(harness.broker.open_connection_count(), 0);

    let status = orchestrator.status().await;
    assert_eq!(status.phase, StartupPhase::Stopped);
    assert!(status
        .workers
        .iter()
        .all(|w| w.state == ConsumerState::Stopped));
}

#[tokio::test]
async fn test_in_flight_delivery_finishes_before_release() {
    let worker = WorkerId::random();
    let harness = TestHarness::new(vec![worker]);
    let item = fixtures::pending_item("customer-1");
    harness.work_items.set_pending(worker, item.clone()).await;
    harness
        .work_items
        .set_update_delay(Duration::from_millis(200))
        .await;

    let (orchestrator, _) = harness.start(OrchestratorConfig::default()).await;
    harness
        .broker
        .publish_event(&fixtures::assignment(worker, item.id));

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while harness.work_items.lookup_count().await == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    orchestrator.stop().await;

    let settled = harness.broker.settlements();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].disposition, Disposition::Ack);
    assert_eq!(harness.work_items.updates().await.len(), 1);
    assert_eq!(harness.broker.open_channel_count(), 0);
}

#[tokio::test]
async fn test_second_start_is_ignored() {
    let harness = TestHarness::new(fixtures::workers(1));
    let (orchestrator, _) = harness.start(OrchestratorConfig::default()).await;

    orchestrator.start().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.broker.connections_opened(), 1);
    assert_eq!(harness.roster.load_count().await, 1);

    orchestrator.stop().await;
}
