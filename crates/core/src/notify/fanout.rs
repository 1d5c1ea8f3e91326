use std::sync::Arc;
use tracing::{debug, warn};

use crate::assignment::AssignmentEvent;
use crate::metrics;

use super::{group_key_for, GroupSender, ItemAssignedNotification, NotifyError, ITEM_ASSIGNED_EVENT};

/// Sends `ItemAssigned` to the sessions of the event's worker.
///
/// Best effort: nothing confirms that a session received the frame.
#[derive(Clone)]
pub struct NotificationFanout {
    sender: Arc<dyn GroupSender>,
}

impl NotificationFanout {
    pub fn new(sender: Arc<dyn GroupSender>) -> Self {
        Self { sender }
    }

    /// Returns the number of sessions addressed. Errors are logged here and
    /// returned so the caller can record them; they never affect the delivery.
    pub async fn notify(&self, event: &AssignmentEvent) -> Result<usize, NotifyError> {
        let group = group_key_for(event.worker_id);
        let payload = serde_json::to_value(ItemAssignedNotification::from(event))?;

        match self
            .sender
            .send_to_group(&group, ITEM_ASSIGNED_EVENT, payload)
            .await
        {
            Ok(sessions) => {
                metrics::NOTIFICATIONS_TOTAL
                    .with_label_values(&[if sessions == 0 { "no_sessions" } else { "sent" }])
                    .inc();
                debug!(
                    item_id = %event.item_id,
                    group = %group,
                    sessions,
                    "Sent assignment notification"
                );
                Ok(sessions)
            }
            Err(e) => {
                metrics::NOTIFICATIONS_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                warn!(
                    item_id = %event.item_id,
                    group = %group,
                    error = %e,
                    "Assignment notification failed"
                );
                Err(e)
            }
        }
    }
}
