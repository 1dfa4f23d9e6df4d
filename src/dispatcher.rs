// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Decodes each delivery from the primary queue, routes it by its
//! `(action, type)` key to a registered handler and settles it:
//!
//! - garbled envelope: ack and drop, never retried
//! - no handler for the key: ack and drop, never retried
//! - handler success: ack
//! - handler failure: reject without requeue, then hand the message to the
//!   [`RetryOrchestrator`]
//!
//! Nothing a single message does escapes [`Dispatcher::dispatch`] other than
//! broker errors, which are logged by the consume loop.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage, EventKey},
    orchestrator::{retry_count, RetryOrchestrator, RetryOutcome},
    otel,
};
use futures_util::{pin_mut, Stream, StreamExt};
use lapin::{message::Delivery, types::FieldTable};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tracing::{debug, error, info, warn};

/// Wire format of every message: `{"action": .., "type": .., "data": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(key: &EventKey, data: serde_json::Value) -> Envelope {
        Envelope {
            action: key.action.clone(),
            kind: key.kind.clone(),
            data,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey::new(&self.action, &self.kind)
    }
}

/// The parts of a broker delivery the dispatcher works with.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub headers: FieldTable,
}

impl From<&Delivery> for InboundDelivery {
    fn from(delivery: &Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            data: delivery.data.clone(),
            headers: delivery.properties.headers().clone().unwrap_or_default(),
        }
    }
}

/// Why a delivery was acknowledged without being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The body is not a valid envelope.
    Malformed,
    /// No handler is registered for the envelope key.
    Unroutable,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acknowledged,
    Dropped(DropReason),
    Retried(RetryOutcome),
}

/// Handlers by event key, registered once at startup and shared by every
/// dispatcher the worker creates across reconnects.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKey, Arc<dyn ConsumerHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers `handler` for `key`, replacing any previous one.
    pub fn register(mut self, key: EventKey, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.handlers.insert(key, handler);
        self
    }

    pub fn get(&self, key: &EventKey) -> Option<&Arc<dyn ConsumerHandler>> {
        self.handlers.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &EventKey> {
        self.handlers.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct Dispatcher<C: AmqpChannel + ?Sized> {
    channel: Arc<C>,
    orchestrator: RetryOrchestrator<C>,
    registry: HandlerRegistry,
}

impl<C: AmqpChannel + ?Sized> Dispatcher<C> {
    pub fn new(
        channel: Arc<C>,
        orchestrator: RetryOrchestrator<C>,
        registry: HandlerRegistry,
    ) -> Dispatcher<C> {
        Dispatcher {
            channel,
            orchestrator,
            registry,
        }
    }

    /// Handles and settles a single delivery.
    pub async fn dispatch(&self, delivery: &InboundDelivery) -> Result<DispatchOutcome, AmqpError> {
        let tracer = global::tracer("amqp consumer");

        let envelope = match serde_json::from_slice::<Envelope>(&delivery.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                let (_, mut span) = otel::new_span(&delivery.headers, &tracer, "unknown");
                let msg = "removing message from queue - reason: unknown or garbled message";
                warn!(error = err.to_string(), "{}", msg);
                span.set_status(Status::Error {
                    description: Cow::from(msg),
                });

                self.channel.ack(delivery.delivery_tag).await?;
                return Ok(DispatchOutcome::Dropped(DropReason::Malformed));
            }
        };

        let key = envelope.key();
        let (ctx, mut span) = otel::new_span(&delivery.headers, &tracer, &key.to_string());

        info!(event = %key, "[Received]");

        let Some(handler) = self.registry.get(&key) else {
            let msg = "removing message from queue - reason: unsupported msg type";
            debug!(event = %key, "{}", msg);
            span.set_status(Status::Error {
                description: Cow::from(msg),
            });

            self.channel.ack(delivery.delivery_tag).await?;
            return Ok(DispatchOutcome::Dropped(DropReason::Unroutable));
        };

        let msg = ConsumerMessage {
            key: key.clone(),
            data: envelope.data,
            retry_count: retry_count(&delivery.headers),
        };

        match handler.exec(&ctx, &msg).await {
            Ok(()) => {
                self.channel.ack(delivery.delivery_tag).await?;
                span.set_status(Status::Ok);
                info!(event = %key, "[Processed]");
                Ok(DispatchOutcome::Acknowledged)
            }
            Err(err) => {
                error!(error = err.to_string(), event = %key, "error whiling handling msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("handler failure"),
                });

                self.channel.reject(delivery.delivery_tag, false).await?;

                let outcome = self.orchestrator.retry(delivery, &key).await?;
                Ok(DispatchOutcome::Retried(outcome))
            }
        }
    }

    /// Dispatches deliveries one at a time until the stream ends.
    ///
    /// The stream ends when the channel or connection closes; a stream error
    /// is returned so the connection manager reconnects.
    pub async fn consume_blocking<S>(&self, consumer: S) -> Result<(), AmqpError>
    where
        S: Stream<Item = Result<Delivery, lapin::Error>>,
    {
        pin_mut!(consumer);

        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    let inbound = InboundDelivery::from(&delivery);
                    if let Err(err) = self.dispatch(&inbound).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    return Err(AmqpError::ConsumerError(err.to_string()));
                }
            }
        }

        Ok(())
    }
}
