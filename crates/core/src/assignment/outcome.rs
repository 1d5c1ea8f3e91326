use serde::Serialize;

use crate::broker::Disposition;

/// Result of handling one delivery.
///
/// Persistence and notification are separate failure domains: once the work
/// item is persisted the delivery is acknowledged whatever happens to the
/// notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// Item updated and the notification reached `sessions` live sessions.
    PersistedAndNotified { sessions: usize },
    /// Item updated; the notification transport failed.
    PersistedNotifyFailed { reason: String },
    /// No pending item exists for the worker.
    NotFound,
    /// The lookup or update call to the work-item service failed.
    UpdateFailed { reason: String },
    /// The payload could not be decoded or failed validation.
    DecodeFailed { reason: String },
}

impl ProcessOutcome {
    /// Broker disposition before any retry cap is applied.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::PersistedAndNotified { .. } | Self::PersistedNotifyFailed { .. } => {
                Disposition::Ack
            }
            Self::NotFound | Self::UpdateFailed { .. } => Disposition::Requeue,
            Self::DecodeFailed { .. } => Disposition::Reject,
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(
            self,
            Self::PersistedAndNotified { .. } | Self::PersistedNotifyFailed { .. }
        )
    }

    /// Short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PersistedAndNotified { .. } => "persisted_and_notified",
            Self::PersistedNotifyFailed { .. } => "persisted_notify_failed",
            Self::NotFound => "not_found",
            Self::UpdateFailed { .. } => "update_failed",
            Self::DecodeFailed { .. } => "decode_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_outcomes_are_acked() {
        assert_eq!(
            ProcessOutcome::PersistedAndNotified { sessions: 0 }.disposition(),
            Disposition::Ack
        );
        assert_eq!(
            ProcessOutcome::PersistedNotifyFailed {
                reason: "hub down".into()
            }
            .disposition(),
            Disposition::Ack
        );
    }

    #[test]
    fn test_transient_failures_are_requeued() {
        assert_eq!(ProcessOutcome::NotFound.disposition(), Disposition::Requeue);
        assert_eq!(
            ProcessOutcome::UpdateFailed {
                reason: "503".into()
            }
            .disposition(),
            Disposition::Requeue
        );
    }

    #[test]
    fn test_decode_failures_are_rejected() {
        let outcome = ProcessOutcome::DecodeFailed {
            reason: "bad json".into(),
        };
        assert_eq!(outcome.disposition(), Disposition::Reject);
        assert!(!outcome.is_persisted());
    }

    #[test]
    fn test_serializes_with_tag() {
        let json = serde_json::to_value(ProcessOutcome::NotFound).unwrap();
        assert_eq!(json["outcome"], "not_found");
    }
}
