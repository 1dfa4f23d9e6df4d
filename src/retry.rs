// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delay-Tier Retry Topology
//!
//! A failed message is parked in a delay queue that nobody consumes. The
//! queue has a message TTL and dead-letters expired messages to the primary
//! exchange under the primary routing key, so after the delay the message is
//! delivered to the worker again, headers intact.
//!
//! Tiers are picked from the retry count only:
//!
//! | retry count | tier  | delay      |
//! |-------------|-------|------------|
//! | 1           | `30s` | 30 000 ms  |
//! | 2           | `5m`  | 300 000 ms |
//! | 3 and above | `30m` | 1 800 000 ms |

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::{AmqpTopology, TopologyNames},
};
use std::{collections::HashSet, sync::Mutex, time::Duration};
use tracing::debug;

/// Routing key of the parking queue on the retry exchange
pub const PARKING_ROUTING_KEY: &str = "parked.route";

/// One delay tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTier {
    pub name: &'static str,
    pub delay_ms: u32,
}

impl RetryTier {
    pub const THIRTY_SECONDS: RetryTier = RetryTier {
        name: "30s",
        delay_ms: 30_000,
    };
    pub const FIVE_MINUTES: RetryTier = RetryTier {
        name: "5m",
        delay_ms: 300_000,
    };
    pub const THIRTY_MINUTES: RetryTier = RetryTier {
        name: "30m",
        delay_ms: 1_800_000,
    };

    pub fn delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.delay_ms))
    }

    /// Routing key binding the tier queue to the retry exchange.
    pub fn routing_key(&self) -> String {
        format!("retry.{}.route", self.name)
    }

    /// Selects the tier for the `retry_count`-th retry.
    ///
    /// The table is ordered by threshold; the last entry whose threshold is
    /// reached wins. Counts below the first threshold use the first tier.
    pub fn for_retry(retry_count: u32) -> RetryTier {
        RETRY_TIERS
            .iter()
            .take_while(|(threshold, _)| retry_count >= *threshold)
            .last()
            .map(|(_, tier)| *tier)
            .unwrap_or(RETRY_TIERS[0].1)
    }
}

/// `(minimum retry count, tier)`, ascending.
pub const RETRY_TIERS: [(u32, RetryTier); 3] = [
    (1, RetryTier::THIRTY_SECONDS),
    (2, RetryTier::FIVE_MINUTES),
    (3, RetryTier::THIRTY_MINUTES),
];

/// Fully resolved tier: where to publish and which queue holds the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTierDescriptor {
    pub tier: RetryTier,
    pub queue_name: String,
    pub routing_key: String,
}

impl RetryTierDescriptor {
    pub fn delay_ms(&self) -> u32 {
        self.tier.delay_ms
    }
}

/// Lazily declares the retry exchange, the tier queues and the parking queue.
///
/// Each entity is declared on first use and remembered, so later retries on
/// the same channel skip the round-trip. A new channel needs a new
/// `RetryTopology`.
pub struct RetryTopology {
    names: TopologyNames,
    declared: Mutex<HashSet<String>>,
}

impl RetryTopology {
    pub fn new(names: TopologyNames) -> RetryTopology {
        RetryTopology {
            names,
            declared: Mutex::new(HashSet::new()),
        }
    }

    pub fn names(&self) -> &TopologyNames {
        &self.names
    }

    /// Resolves the queue and routing key for `tier`.
    pub fn descriptor(&self, tier: RetryTier) -> RetryTierDescriptor {
        RetryTierDescriptor {
            tier,
            queue_name: self.names.retry_queue(tier.name),
            routing_key: tier.routing_key(),
        }
    }

    /// Declares the durable direct retry exchange.
    pub async fn ensure_retry_exchange<C>(&self, channel: &C) -> Result<(), AmqpError>
    where
        C: AmqpChannel + ?Sized,
    {
        let exchange = self.names.retry_exchange().to_owned();
        if self.is_declared(&exchange) {
            return Ok(());
        }

        channel
            .declare_exchange(&ExchangeDefinition::new(&exchange).direct().durable())
            .await?;

        self.mark_declared(exchange);
        Ok(())
    }

    /// Declares the delay queue for `retry_count` and binds it to the retry
    /// exchange. The retry exchange must already exist.
    pub async fn ensure_tier<C>(
        &self,
        channel: &C,
        retry_count: u32,
    ) -> Result<RetryTierDescriptor, AmqpError>
    where
        C: AmqpChannel + ?Sized,
    {
        let descriptor = self.descriptor(RetryTier::for_retry(retry_count));
        if self.is_declared(&descriptor.queue_name) {
            return Ok(descriptor);
        }

        debug!(
            queue = descriptor.queue_name.as_str(),
            delay_ms = descriptor.delay_ms(),
            "declaring retry tier"
        );

        AmqpTopology::new(channel)
            .queue(
                QueueDefinition::new(&descriptor.queue_name)
                    .durable()
                    .ttl(descriptor.delay_ms() as i32)
                    .dead_letter_to(self.names.exchange(), self.names.routing_key()),
            )
            .queue_binding(
                QueueBinding::new(&descriptor.queue_name)
                    .exchange(self.names.retry_exchange())
                    .routing_key(&descriptor.routing_key),
            )
            .install()
            .await?;

        self.mark_declared(descriptor.queue_name.clone());
        Ok(descriptor)
    }

    /// Declares the parking queue and binds it to the retry exchange under
    /// [`PARKING_ROUTING_KEY`]. The retry exchange must already exist.
    pub async fn ensure_parking<C>(&self, channel: &C) -> Result<String, AmqpError>
    where
        C: AmqpChannel + ?Sized,
    {
        let queue = self.names.parking_queue();
        if self.is_declared(&queue) {
            return Ok(queue);
        }

        AmqpTopology::new(channel)
            .queue(QueueDefinition::new(&queue).durable())
            .queue_binding(
                QueueBinding::new(&queue)
                    .exchange(self.names.retry_exchange())
                    .routing_key(PARKING_ROUTING_KEY),
            )
            .install()
            .await?;

        self.mark_declared(queue.clone());
        Ok(queue)
    }

    fn is_declared(&self, name: &str) -> bool {
        self.declared
            .lock()
            .map(|set| set.contains(name))
            .unwrap_or(false)
    }

    fn mark_declared(&self, name: String) {
        if let Ok(mut set) = self.declared.lock() {
            set.insert(name);
        }
    }
}
