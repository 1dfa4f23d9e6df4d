// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler is registered for one [`EventKey`] and receives the `data` part of
//! every envelope routed to it.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing key of an envelope: its `action` and `type` fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub action: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl EventKey {
    pub fn new(action: &str, kind: &str) -> EventKey {
        EventKey {
            action: action.to_owned(),
            kind: kind.to_owned(),
        }
    }

    /// `log` / `activity`, sent by every service that records an audit event.
    pub fn log_activity() -> EventKey {
        EventKey::new("log", "activity")
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.action, self.kind)
    }
}

/// A decoded message as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub key: EventKey,
    pub data: serde_json::Value,
    /// Number of retries already spent on this message, 0 on first delivery.
    pub retry_count: u32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one message. Any error sends the delivery to the retry pipeline.
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}
