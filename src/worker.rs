// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Channel setup of a queue worker: primary topology, consumer registration,
//! and a dispatcher with its own retry state for the lifetime of the channel.

use crate::{
    configs::WorkerConfigs,
    connection::{AmqpSession, ChannelSetup},
    dispatcher::{Dispatcher, HandlerRegistry},
    errors::AmqpError,
    orchestrator::RetryOrchestrator,
    retry::RetryTopology,
    topology::{install_primary, TopologyNames},
};
use async_trait::async_trait;
use lapin::{options::BasicConsumeOptions, types::FieldTable};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct QueueWorker {
    names: TopologyNames,
    registry: HandlerRegistry,
    settings: WorkerConfigs,
    consumer_tag: String,
}

impl QueueWorker {
    pub fn new(
        names: TopologyNames,
        registry: HandlerRegistry,
        settings: WorkerConfigs,
        consumer_tag: &str,
    ) -> QueueWorker {
        QueueWorker {
            names,
            registry,
            settings,
            consumer_tag: consumer_tag.to_owned(),
        }
    }

    pub fn names(&self) -> &TopologyNames {
        &self.names
    }
}

#[async_trait]
impl ChannelSetup<AmqpSession> for QueueWorker {
    async fn setup(&self, session: Arc<AmqpSession>) -> Result<(), AmqpError> {
        let channel = session.channel();

        if self.registry.is_empty() {
            warn!(
                queue = self.names.queue(),
                "no handlers registered, every message will be dropped"
            );
        }

        install_primary(channel.as_ref(), &self.names).await?;

        let consumer = match channel
            .basic_consume(
                self.names.queue(),
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.names.queue(),
                    "failure to declare consumer"
                );
                Err(AmqpError::BindingConsumerError(self.names.queue().to_owned()))
            }
        }?;

        info!(
            queue = self.names.queue(),
            handlers = self.registry.keys().count(),
            "consumer started, waiting for messages"
        );

        let orchestrator = RetryOrchestrator::new(
            channel.clone(),
            RetryTopology::new(self.names.clone()),
            self.settings.max_retries,
            self.settings.exhaustion_policy,
        );

        Dispatcher::new(channel, orchestrator, self.registry.clone())
            .consume_blocking(consumer)
            .await
    }
}
