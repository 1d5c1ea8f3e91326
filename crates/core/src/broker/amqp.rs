//! RabbitMQ implementation of the broker traits on top of `lapin`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{redact_credentials, BrokerConfig};

use super::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Delivery,
    DeliveryStream, ExchangeKind, ExchangeSpec, QueueSpec,
};

const REPLY_SUCCESS: u16 = 200;

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

/// Connects to RabbitMQ using the `[broker]` configuration.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    fn name(&self) -> &str {
        "amqp"
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(
            &self.config.url,
            ConnectionProperties::default()
                .with_connection_name(self.config.connection_name.clone().into()),
        )
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!(
            url = %redact_credentials(&self.config.url),
            "Connected to RabbitMQ"
        );

        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("channel creation failed: {}", e)))?;
        debug!(channel_id = channel.id(), "Opened channel");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| BrokerError::Close {
                what: "connection".to_string(),
                reason: e.to_string(),
            })
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("failed to set QoS: {}", e)))
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                &spec.name,
                spec.kind.into(),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                kind: "exchange",
                name: spec.name.clone(),
                reason: e.to_string(),
            })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut args = FieldTable::default();
        if let Some(dlx) = &spec.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.clone().into()),
            );
        }

        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Declare {
                kind: "queue",
                name: spec.name.clone(),
                reason: e.to_string(),
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let queue = queue.to_string();
        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(Delivery::new(
                    delivery.delivery_tag,
                    delivery.data,
                    delivery.redelivered,
                    AmqpAcker {
                        acker: delivery.acker,
                        delivery_tag: delivery.delivery_tag,
                    },
                )),
                Err(e) => Err(BrokerError::Consume {
                    queue: queue.clone(),
                    reason: e.to_string(),
                }),
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| BrokerError::Close {
                what: format!("channel {}", self.channel.id()),
                reason: e.to_string(),
            })
    }
}

struct AmqpAcker {
    acker: Acker,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Settle {
                delivery_tag: self.delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Settle {
                delivery_tag: self.delivery_tag,
                reason: e.to_string(),
            })
    }
}
