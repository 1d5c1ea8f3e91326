//! Applies an assignment to the work-item service, then notifies the worker.
//!
//! The notification is sent only after `update_item` returned `Ok`. A failed
//! notification leaves the persisted item untouched and is not retried.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ids::WorkerId;
use crate::notify::NotificationFanout;
use crate::work_item::WorkItemService;

use super::{AssignmentEvent, ProcessOutcome};

pub struct AssignmentProcessor {
    work_items: Arc<dyn WorkItemService>,
    fanout: NotificationFanout,
}

impl AssignmentProcessor {
    pub fn new(work_items: Arc<dyn WorkItemService>, fanout: NotificationFanout) -> Self {
        Self { work_items, fanout }
    }

    /// Process a decoded, validated event for `worker_id`.
    pub async fn process(&self, worker_id: WorkerId, event: &AssignmentEvent) -> ProcessOutcome {
        let mut item = match self.work_items.pending_item_for_worker(worker_id).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                info!(
                    worker_id = %worker_id,
                    item_id = %event.item_id,
                    "No pending item for worker"
                );
                return ProcessOutcome::NotFound;
            }
            Err(e) => {
                warn!(
                    worker_id = %worker_id,
                    service = self.work_items.name(),
                    error = %e,
                    "Pending item lookup failed"
                );
                return ProcessOutcome::UpdateFailed {
                    reason: e.to_string(),
                };
            }
        };

        // The pending item is the source of truth; the event only triggers the lookup.
        if item.id != event.item_id {
            debug!(
                worker_id = %worker_id,
                event_item = %event.item_id,
                pending_item = %item.id,
                "Pending item differs from event item"
            );
        }

        item.assign_to(worker_id, Utc::now());

        if let Err(e) = self.work_items.update_item(&item).await {
            warn!(
                worker_id = %worker_id,
                item_id = %item.id,
                error = %e,
                "Work item update failed"
            );
            return ProcessOutcome::UpdateFailed {
                reason: e.to_string(),
            };
        }

        info!(worker_id = %worker_id, item_id = %item.id, "Work item assigned");

        match self.fanout.notify(event).await {
            Ok(sessions) => ProcessOutcome::PersistedAndNotified { sessions },
            Err(e) => ProcessOutcome::PersistedNotifyFailed {
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ItemId;
    use crate::testing::{MockGroupSender, MockWorkItemService};
    use crate::work_item::{ItemStatus, WorkItem};

    struct Harness {
        work_items: Arc<MockWorkItemService>,
        sender: Arc<MockGroupSender>,
        processor: AssignmentProcessor,
    }

    fn harness() -> Harness {
        let work_items = Arc::new(MockWorkItemService::new());
        let sender = Arc::new(MockGroupSender::new());
        let processor = AssignmentProcessor::new(
            work_items.clone(),
            NotificationFanout::new(sender.clone()),
        );
        Harness {
            work_items,
            sender,
            processor,
        }
    }

    fn event_for(worker: WorkerId, item: ItemId) -> AssignmentEvent {
        AssignmentEvent::new(item, worker, "user-1", Utc::now())
    }

    #[tokio::test]
    async fn test_success_persists_then_notifies() {
        let h = harness();
        let worker = WorkerId::random();
        let item_id = ItemId::random();
        h.work_items
            .set_pending(worker, WorkItem::unassigned(item_id, "user-1"))
            .await;
        h.sender.set_group_size(2).await;

        let outcome = h.processor.process(worker, &event_for(worker, item_id)).await;
        assert_eq!(outcome, ProcessOutcome::PersistedAndNotified { sessions: 2 });

        let updates = h.work_items.updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, ItemStatus::Assigned);
        assert_eq!(updates[0].worker_id, Some(worker));
        assert!(updates[0].assigned_at.is_some());
        assert_eq!(h.sender.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_not_found_skips_update_and_notify() {
        let h = harness();
        let worker = WorkerId::random();

        let outcome = h
            .processor
            .process(worker, &event_for(worker, ItemId::random()))
            .await;
        assert_eq!(outcome, ProcessOutcome::NotFound);
        assert!(h.work_items.updates().await.is_empty());
        assert!(h.sender.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_failure_skips_notify() {
        let h = harness();
        let worker = WorkerId::random();
        let item_id = ItemId::random();
        h.work_items
            .set_pending(worker, WorkItem::unassigned(item_id, "user-1"))
            .await;
        h.work_items.set_fail_updates(true).await;

        let outcome = h.processor.process(worker, &event_for(worker, item_id)).await;
        assert!(matches!(outcome, ProcessOutcome::UpdateFailed { .. }));
        assert!(h.sender.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_update_failed() {
        let h = harness();
        h.work_items.set_fail_lookups(true).await;
        let worker = WorkerId::random();

        let outcome = h
            .processor
            .process(worker, &event_for(worker, ItemId::random()))
            .await;
        assert!(matches!(outcome, ProcessOutcome::UpdateFailed { .. }));
    }

    #[tokio::test]
    async fn test_notify_failure_still_persisted() {
        let h = harness();
        let worker = WorkerId::random();
        let item_id = ItemId::random();
        h.work_items
            .set_pending(worker, WorkItem::unassigned(item_id, "user-1"))
            .await;
        h.sender.set_fail(true).await;

        let outcome = h.processor.process(worker, &event_for(worker, item_id)).await;
        assert!(matches!(outcome, ProcessOutcome::PersistedNotifyFailed { .. }));
        assert!(outcome.is_persisted());
        assert_eq!(h.work_items.updates().await.len(), 1);
    }
}
