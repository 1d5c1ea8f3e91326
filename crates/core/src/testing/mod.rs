//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of every external collaborator
//! (broker, roster, work-item service, notification transport), allowing the
//! whole consume → persist → notify path to run without real infrastructure.
//!
//! # Example
//!
//! ```rust,ignore
//! use assignrelay_core::testing::{MockBroker, MockGroupSender, MockWorkItemService};
//!
//! let broker = MockBroker::new();
//! let work_items = MockWorkItemService::new();
//!
//! // Configure mock responses
//! work_items.set_pending(worker, fixtures::pending_item("user-1")).await;
//! broker.publish_event(&fixtures::assignment(worker, item_id));
//! ```

mod mock_broker;
mod mock_group_sender;
mod mock_roster;
mod mock_work_items;
mod stub_http;

pub use mock_broker::{MockBinding, MockBroker, Settlement};
pub use mock_group_sender::{MockGroupSender, RecordedSend};
pub use mock_roster::MockRoster;
pub use mock_work_items::MockWorkItemService;
pub use stub_http::{RecordedRequest, StubHttpServer};

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::Utc;

    use crate::assignment::AssignmentEvent;
    use crate::ids::{ItemId, WorkerId};
    use crate::work_item::WorkItem;

    /// An assignment event stamped now.
    pub fn assignment(worker_id: WorkerId, item_id: ItemId) -> AssignmentEvent {
        AssignmentEvent::new(item_id, worker_id, "customer-1", Utc::now())
    }

    /// An unassigned item with a fresh id.
    pub fn pending_item(user_id: &str) -> WorkItem {
        WorkItem::unassigned(ItemId::random(), user_id)
    }

    /// `count` fresh worker ids.
    pub fn workers(count: usize) -> Vec<WorkerId> {
        (0..count).map(|_| WorkerId::random()).collect()
    }
}
