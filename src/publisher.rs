// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Producer side of the worker protocol. Services hand over a batch of
//! `{worker, message}` pairs; each message is published as persistent JSON to
//! the shared exchange under the worker's routing key, carrying the current
//! trace context in its headers.

use crate::{
    channel::AmqpChannel,
    dispatcher::Envelope,
    errors::AmqpError,
    orchestrator::PERSISTENT_DELIVERY_MODE,
    otel,
    topology::{TopologyNames, Worker},
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// One message addressed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub worker: Worker,
    pub message: Envelope,
}

/// Returned once every message of a batch has been handed to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub done: bool,
}

pub struct Publisher<C: AmqpChannel + ?Sized> {
    channel: Arc<C>,
    prefix: String,
}

impl<C: AmqpChannel + ?Sized> Publisher<C> {
    /// Creates a publisher for the workers under `prefix`.
    ///
    /// # Parameters
    /// * `channel` - The AMQP channel messages are published on
    /// * `prefix` - The configured queue prefix
    ///
    /// # Returns
    /// A shared publisher
    pub fn new(channel: Arc<C>, prefix: &str) -> Arc<Publisher<C>> {
        Arc::new(Publisher {
            channel,
            prefix: prefix.to_owned(),
        })
    }

    /// Publishes every request in order.
    ///
    /// An empty batch is rejected. The first failing publish aborts the batch;
    /// messages published before it stay published.
    ///
    /// # Parameters
    /// * `ctx` - The caller's trace context, injected into every message
    /// * `requests` - The `{worker, message}` pairs to publish
    ///
    /// # Returns
    /// `{done: true}` once every message was handed to the broker
    pub async fn publish(
        &self,
        ctx: &Context,
        requests: &[PublishRequest],
    ) -> Result<PublishReceipt, AmqpError> {
        if requests.is_empty() {
            error!("nothing to publish");
            return Err(AmqpError::NothingToPublish);
        }

        for request in requests {
            let names = TopologyNames::new(&self.prefix, request.worker);

            let payload = serde_json::to_vec(&request.message).map_err(|err| {
                error!(error = err.to_string(), "failure to serialize message");
                AmqpError::InternalError
            })?;

            let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
            otel::inject_context(ctx, &mut headers);

            self.channel
                .publish(
                    names.exchange(),
                    names.routing_key(),
                    &payload,
                    BasicProperties::default()
                        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
                        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                        .with_headers(FieldTable::from(headers)),
                )
                .await?;

            debug!(
                worker = %request.worker,
                event = %request.message.key(),
                "message published"
            );
        }

        debug!(count = requests.len(), "published message(s) to rabbitmq");

        Ok(PublishReceipt { done: true })
    }
}
