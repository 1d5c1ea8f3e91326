//! Message broker abstraction.
//!
//! One connection is shared by the whole process; each worker gets its own
//! channel. Deliveries are consumed with manual acknowledgement, so a message
//! leaves its queue only when [`Delivery::settle`] acknowledges it.

mod amqp;
mod topology;

pub use amqp::AmqpConnector;
pub use topology::{
    queue_name_for, routing_key_for, ExchangeSpec, QueueBinding, QueueSpec, TopologyManager,
    TopologyPlan, DEAD_LETTER_QUEUE, EXCHANGE_NAME,
};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("failed to declare {kind} '{name}': {reason}")]
    Declare {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("failed to bind queue '{queue}' to '{exchange}' with key '{routing_key}': {reason}")]
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
        reason: String,
    },

    #[error("failed to start consumer on '{queue}': {reason}")]
    Consume { queue: String, reason: String },

    #[error("failed to settle delivery {delivery_tag}: {reason}")]
    Settle { delivery_tag: u64, reason: String },

    #[error("failed to close {what}: {reason}")]
    Close { what: String, reason: String },
}

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// What to tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Remove from the queue.
    Ack,
    /// Negative acknowledgement with requeue; the message is redelivered.
    Requeue,
    /// Negative acknowledgement without requeue; dead-lettered when the queue
    /// has a dead-letter exchange, dropped otherwise.
    Reject,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
            Disposition::Reject => "reject",
        }
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message received from a worker queue.
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    /// Set by the broker when this message was delivered before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        payload: Vec<u8>,
        redelivered: bool,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self {
            delivery_tag,
            payload,
            redelivered,
            acker: Box::new(acker),
        }
    }

    /// Settle the delivery. Consumes it so it can only be settled once.
    pub async fn settle(self, disposition: Disposition) -> Result<(), BrokerError> {
        match disposition {
            Disposition::Ack => self.acker.ack().await,
            Disposition::Requeue => self.acker.nack(true).await,
            Disposition::Reject => self.acker.nack(false).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Opens the process-wide broker connection.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// The single transport connection shared by all worker channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel owned by exactly one worker consumer.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingAcker {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            self.calls.lock().unwrap().push("ack");
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
            self.calls
                .lock()
                .unwrap()
                .push(if requeue { "nack_requeue" } else { "nack_drop" });
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_settle_maps_dispositions() {
        let acker = RecordingAcker::default();
        for disposition in [Disposition::Ack, Disposition::Requeue, Disposition::Reject] {
            Delivery::new(1, vec![], false, acker.clone())
                .settle(disposition)
                .await
                .unwrap();
        }
        assert_eq!(
            *acker.calls.lock().unwrap(),
            vec!["ack", "nack_requeue", "nack_drop"]
        );
    }

    #[test]
    fn test_delivery_debug_hides_payload() {
        let delivery = Delivery::new(7, b"secret".to_vec(), true, RecordingAcker::default());
        let printed = format!("{:?}", delivery);
        assert!(printed.contains("delivery_tag: 7"));
        assert!(!printed.contains("secret"));
    }

    #[test]
    fn test_exchange_kind_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: ExchangeKind,
        }
        let parsed: Wrapper = toml::from_str(r#"kind = "topic""#).unwrap();
        assert_eq!(parsed.kind, ExchangeKind::Topic);
        assert_eq!(parsed.kind.as_str(), "topic");
    }
}
