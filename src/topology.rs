// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Topology
//!
//! Every name the worker uses on the broker is derived from a configured
//! prefix `P` and the worker name:
//!
//! - primary exchange: `P.exchange` (topic, shared by all workers)
//! - primary queue: `P.<worker>.queue`
//! - primary routing key: `P.<worker>.route`
//! - retry exchange: `P.<worker>.retry.exchange` (direct)
//!
//! The `test` worker has no worker segment: its queue is `P.queue` and its
//! routing key `P.route`.
//!
//! [`AmqpTopology`] collects exchange, queue and binding definitions and
//! installs them in order; [`install_primary`] declares the primary part of
//! the topology and is re-run on every channel (re)establishment.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tracing::debug;

/// At most one unacknowledged delivery per consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// Logical workers a producer can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Worker {
    Test,
    Activity,
    Notification,
    Verification,
    Transaction,
}

impl Worker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Worker::Test => "test",
            Worker::Activity => "activity",
            Worker::Notification => "notification",
            Worker::Verification => "verification",
            Worker::Transaction => "transaction",
        }
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Worker {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(Worker::Test),
            "activity" => Ok(Worker::Activity),
            "notification" => Ok(Worker::Notification),
            "verification" => Ok(Worker::Verification),
            "transaction" => Ok(Worker::Transaction),
            other => Err(AmqpError::UnknownWorker(other.to_owned())),
        }
    }
}

/// Broker identifiers of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNames {
    namespace: String,
    exchange: String,
    queue: String,
    routing_key: String,
    retry_exchange: String,
}

impl TopologyNames {
    /// Derives every broker name of `worker` under `prefix`.
    ///
    /// # Parameters
    /// * `prefix` - The configured queue prefix (`RABBITMQ_QUEUE_PREFIX`)
    /// * `worker` - The worker the names belong to
    ///
    /// # Returns
    /// The exchange, queue, routing key and retry names of the worker
    pub fn new(prefix: &str, worker: Worker) -> TopologyNames {
        let namespace = match worker {
            Worker::Test => prefix.to_owned(),
            other => format!("{}.{}", prefix, other),
        };

        TopologyNames {
            exchange: format!("{}.exchange", prefix),
            queue: format!("{}.queue", namespace),
            routing_key: format!("{}.route", namespace),
            retry_exchange: format!("{}.retry.exchange", namespace),
            namespace,
        }
    }

    /// The topic exchange shared by every worker.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The queue the worker consumes from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The key binding the queue to the shared exchange.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The direct exchange feeding the retry tier queues and the parking queue.
    pub fn retry_exchange(&self) -> &str {
        &self.retry_exchange
    }

    /// Name of the delay queue for a retry tier.
    ///
    /// # Parameters
    /// * `tier` - The tier label (`30s`, `5m`, ...)
    ///
    /// # Returns
    /// `<namespace>.retry.<tier>`
    pub fn retry_queue(&self, tier: &str) -> String {
        format!("{}.retry.{}", self.namespace, tier)
    }

    /// Name of the consumer-less queue holding messages that exhausted their retries.
    pub fn parking_queue(&self) -> String {
        format!("{}.parked", self.namespace)
    }
}

/// Ordered collection of exchanges, queues and bindings to declare.
pub struct AmqpTopology<'tp, C: AmqpChannel + ?Sized> {
    channel: &'tp C,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl<'tp, C: AmqpChannel + ?Sized> AmqpTopology<'tp, C> {
    /// Creates an empty topology declared through `channel`.
    ///
    /// # Parameters
    /// * `channel` - The channel every declaration goes through
    ///
    /// # Returns
    /// A topology with no exchanges, queues or bindings
    pub fn new(channel: &'tp C) -> AmqpTopology<'tp, C> {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Adds an exchange to declare.
    ///
    /// # Parameters
    /// * `def` - The exchange definition
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue to declare.
    ///
    /// # Parameters
    /// * `def` - The queue definition
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue binding, declared after every exchange and queue.
    ///
    /// # Parameters
    /// * `binding` - The binding configuration
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares all exchanges, then all queues, then all bindings.
    ///
    /// Stops at the first failure; every step is idempotent so the whole
    /// install can simply be repeated.
    pub async fn install(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.channel.declare_exchange(exch).await?;
        }

        for queue in &self.queues {
            self.channel.declare_queue(queue).await?;
        }

        for binding in &self.queues_binding {
            self.channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}

/// Declares the primary exchange, queue and binding of `names`, then sets the
/// consumer prefetch to [`PREFETCH_COUNT`].
///
/// A parameter mismatch with an already existing entity makes the broker
/// close the channel; the error is returned so the connection manager can
/// start over.
pub async fn install_primary<C>(channel: &C, names: &TopologyNames) -> Result<(), AmqpError>
where
    C: AmqpChannel + ?Sized,
{
    AmqpTopology::new(channel)
        .exchange(ExchangeDefinition::new(names.exchange()).topic().durable())
        .queue(QueueDefinition::new(names.queue()).durable())
        .queue_binding(
            QueueBinding::new(names.queue())
                .exchange(names.exchange())
                .routing_key(names.routing_key()),
        )
        .install()
        .await?;

    channel.qos(PREFETCH_COUNT).await?;

    debug!(queue = names.queue(), "primary topology installed");

    Ok(())
}
