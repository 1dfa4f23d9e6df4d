// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker: exchanges route to bound queues by exact key, queues
//! keep their declared arguments, and [`InMemoryBroker::expire`] plays the
//! part of a TTL running out by dead-lettering a queue's messages.

use activity_consumer::{
    channel::AmqpChannel,
    dispatcher::InboundDelivery,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub headers: FieldTable,
    pub delivery_mode: Option<u8>,
}

impl StoredMessage {
    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers.inner().get(key)
    }
}

#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub exchange: String,
    pub routing_key: String,
    pub message: StoredMessage,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueDefinition>,
    messages: HashMap<String, VecDeque<StoredMessage>>,
    bindings: Vec<QueueBinding>,
    published: Vec<PublishRecord>,
    acked: Vec<u64>,
    rejected: Vec<(u64, bool)>,
    prefetch: Option<u16>,
    next_tag: u64,
}

impl State {
    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange_name() == exchange && b.key() == routing_key)
            .map(|b| b.queue().to_owned())
            .collect();

        for queue in targets {
            self.messages
                .entry(queue)
                .or_default()
                .push_back(message.clone());
        }
    }
}

#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state().exchanges.get(name).copied()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.state().queues.get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.state().messages.get(queue).map_or(0, VecDeque::len)
    }

    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state()
            .messages
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.state().published.clone()
    }

    pub fn published_to(&self, exchange: &str) -> Vec<PublishRecord> {
        self.published()
            .into_iter()
            .filter(|p| p.exchange == exchange)
            .collect()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state().acked.clone()
    }

    pub fn rejected(&self) -> Vec<(u64, bool)> {
        self.state().rejected.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state().prefetch
    }

    /// Takes the head of `queue` as a delivery with a fresh tag.
    pub fn deliver(&self, queue: &str) -> Option<InboundDelivery> {
        let mut state = self.state();
        let message = state.messages.get_mut(queue)?.pop_front()?;
        state.next_tag += 1;

        Some(InboundDelivery {
            delivery_tag: state.next_tag,
            data: message.payload,
            headers: message.headers,
        })
    }

    /// Lets the TTL of every message in `queue` run out: each one is
    /// dead-lettered to the queue's configured exchange and routing key with
    /// its headers as they were, plus the broker's `x-first-death-queue`.
    pub fn expire(&self, queue: &str) -> usize {
        let mut state = self.state();
        let (exchange, key) = match state.queues.get(queue).and_then(|q| {
            q.dead_letter()
                .map(|(exchange, key)| (exchange.to_owned(), key.to_owned()))
        }) {
            Some(target) => target,
            None => return 0,
        };

        let expired: Vec<StoredMessage> = state
            .messages
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default();
        let count = expired.len();

        for mut message in expired {
            let mut headers = message.headers.inner().clone();
            headers.insert(
                ShortString::from("x-first-death-queue"),
                AMQPValue::LongString(LongString::from(queue.to_owned())),
            );
            message.headers = FieldTable::from(headers);
            state.route(&exchange, &key, message);
        }

        count
    }
}

#[async_trait]
impl AmqpChannel for InMemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state();
        match state.exchanges.get(def.name()) {
            Some(kind) if *kind != def.exchange_kind() => {
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            _ => {
                state
                    .exchanges
                    .insert(def.name().to_owned(), def.exchange_kind());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.state();
        match state.queues.get(def.name()) {
            Some(existing) if existing != def => {
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
            _ => {
                state.queues.insert(def.name().to_owned(), def.clone());
                state.messages.entry(def.name().to_owned()).or_default();
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state();
        if !state.exchanges.contains_key(binding.exchange_name())
            || !state.queues.contains_key(binding.queue())
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue().to_owned(),
            ));
        }

        let exists = state.bindings.iter().any(|b| {
            b.queue() == binding.queue()
                && b.exchange_name() == binding.exchange_name()
                && b.key() == binding.key()
        });
        if !exists {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.state().prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        if !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::PublishingError(exchange.to_owned()));
        }

        let message = StoredMessage {
            payload: payload.to_vec(),
            headers: properties.headers().clone().unwrap_or_default(),
            delivery_mode: *properties.delivery_mode(),
        };

        state.published.push(PublishRecord {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message: message.clone(),
        });
        state.route(exchange, routing_key, message);

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.state().acked.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.state().rejected.push((delivery_tag, requeue));
        Ok(())
    }
}

/// `x-retry-count` of `message` as written by the worker.
pub fn retry_header(message: &StoredMessage) -> Option<i64> {
    match message.header("x-retry-count") {
        Some(AMQPValue::LongLongInt(v)) => Some(*v),
        _ => None,
    }
}
