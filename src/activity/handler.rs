// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{ActivityEvent, ActivityLogger};
use crate::{
    errors::HandlerError,
    handler::{ConsumerHandler, ConsumerMessage},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{info, warn};

/// Handler registered for `log` / `activity` envelopes.
pub struct ActivityLoggingHandler {
    logger: Arc<dyn ActivityLogger>,
}

impl ActivityLoggingHandler {
    pub fn new(logger: Arc<dyn ActivityLogger>) -> Arc<ActivityLoggingHandler> {
        Arc::new(ActivityLoggingHandler { logger })
    }
}

#[async_trait]
impl ConsumerHandler for ActivityLoggingHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let event = serde_json::from_value::<ActivityEvent>(msg.data.clone()).map_err(|err| {
            warn!(error = err.to_string(), "activity payload rejected");
            HandlerError::InvalidPayload(err.to_string())
        })?;

        info!(
            entity = %event.entity,
            event = event.event.as_str(),
            retry_count = msg.retry_count,
            "logging activity"
        );

        self.logger.log_activity(event).await
    }
}
