//! Queue topology: one shared topic exchange and one durable queue per worker.
//!
//! Names are deterministic functions of the worker id. Publishers route an
//! assignment for worker `W` with routing key `agent.W`; it lands in
//! `agent.W.queue`. Every declaration here is idempotent, so the topology is
//! simply re-declared on each startup.

use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::ids::WorkerId;
use crate::roster::Roster;

use super::{BrokerChannel, BrokerError, ExchangeKind};

/// Default name of the shared assignment exchange.
pub const EXCHANGE_NAME: &str = "chat.agent.exchange";

/// Queue collecting rejected deliveries when dead-lettering is enabled.
pub const DEAD_LETTER_QUEUE: &str = "agent.dead-letter.queue";

pub fn queue_name_for(worker_id: WorkerId) -> String {
    format!("agent.{}.queue", worker_id)
}

pub fn routing_key_for(worker_id: WorkerId) -> String {
    format!("agent.{}", worker_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// Durable, shared, never auto-deleted.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
        }
    }
}

/// The queue and routing key belonging to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub worker_id: WorkerId,
    pub queue_name: String,
    pub routing_key: String,
    pub exchange: String,
}

impl QueueBinding {
    pub fn for_worker(worker_id: WorkerId, exchange: &str) -> Self {
        Self {
            worker_id,
            queue_name: queue_name_for(worker_id),
            routing_key: routing_key_for(worker_id),
            exchange: exchange.to_string(),
        }
    }
}

/// What startup should do for a given roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyPlan {
    /// Empty roster. Nothing is declared and no consumer starts.
    NoConsumers,
    Bindings(Vec<QueueBinding>),
}

/// Declares the shared exchange and per-worker queues.
#[derive(Debug, Clone)]
pub struct TopologyManager {
    exchange: ExchangeSpec,
    dead_letter_exchange: Option<String>,
}

impl TopologyManager {
    pub fn new(exchange: &str, kind: ExchangeKind, dead_letter_exchange: Option<String>) -> Self {
        Self {
            exchange: ExchangeSpec {
                name: exchange.to_string(),
                kind,
                durable: true,
            },
            dead_letter_exchange,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            &config.exchange,
            config.exchange_kind,
            config.dead_letter_exchange.clone(),
        )
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.exchange
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    /// One binding per roster entry, in roster order.
    pub fn plan(&self, roster: &Roster) -> TopologyPlan {
        if roster.is_empty() {
            return TopologyPlan::NoConsumers;
        }
        TopologyPlan::Bindings(
            roster
                .iter()
                .map(|worker_id| QueueBinding::for_worker(*worker_id, &self.exchange.name))
                .collect(),
        )
    }

    /// Queue declaration for a worker's binding.
    pub fn queue_spec(&self, binding: &QueueBinding) -> QueueSpec {
        QueueSpec {
            dead_letter_exchange: self.dead_letter_exchange.clone(),
            ..QueueSpec::durable(&binding.queue_name)
        }
    }

    /// Declare the shared exchange (and dead-letter topology when enabled).
    pub async fn declare_shared(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        channel.declare_exchange(&self.exchange).await?;
        debug!(
            exchange = %self.exchange.name,
            kind = self.exchange.kind.as_str(),
            "Declared exchange"
        );

        if let Some(dlx) = &self.dead_letter_exchange {
            channel
                .declare_exchange(&ExchangeSpec {
                    name: dlx.clone(),
                    kind: ExchangeKind::Fanout,
                    durable: true,
                })
                .await?;
            channel
                .declare_queue(&QueueSpec::durable(DEAD_LETTER_QUEUE))
                .await?;
            channel.bind_queue(DEAD_LETTER_QUEUE, dlx, "").await?;
            info!(exchange = %dlx, queue = DEAD_LETTER_QUEUE, "Declared dead-letter topology");
        }

        Ok(())
    }

    /// Declare a worker queue and bind it to the shared exchange.
    pub async fn declare_binding(
        &self,
        channel: &dyn BrokerChannel,
        binding: &QueueBinding,
    ) -> Result<(), BrokerError> {
        if let Err(e) = channel.declare_queue(&self.queue_spec(binding)).await {
            if is_argument_mismatch(&e) {
                warn!(
                    queue = %binding.queue_name,
                    dead_letter_exchange = ?self.dead_letter_exchange,
                    "Queue exists with different arguments; delete it or match broker.dead_letter_exchange to how it was created"
                );
            }
            return Err(e);
        }
        channel
            .bind_queue(&binding.queue_name, &binding.exchange, &binding.routing_key)
            .await?;
        debug!(
            worker_id = %binding.worker_id,
            queue = %binding.queue_name,
            routing_key = %binding.routing_key,
            "Declared worker queue"
        );
        Ok(())
    }
}

fn is_argument_mismatch(error: &BrokerError) -> bool {
    matches!(error, BrokerError::Declare { reason, .. } if reason.contains("PRECONDITION"))
}
