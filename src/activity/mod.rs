// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Activity Logging
//!
//! The audit trail part of the worker: the event producers send under the
//! `log_activity` key, the record that gets persisted, and the handler that
//! turns one into the other.

mod device;
mod handler;
mod repository;
mod service;

pub use device::DeviceInfo;
pub use handler::ActivityLoggingHandler;
pub use repository::{ActivityRepository, PgActivityRepository, UserDirectory};
pub use service::{ActivityLogger, ActivityService};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who performed the activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Admin,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Admin => "admin",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client address as captured by the producer: either the request IP or the
/// whole `x-forwarded-for` chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientIp {
    Single(String),
    Forwarded(Vec<String>),
}

impl ClientIp {
    /// The originating address; the first entry of a forwarded chain.
    pub fn address(&self) -> Option<&str> {
        match self {
            ClientIp::Single(ip) => Some(ip.as_str()),
            ClientIp::Forwarded(chain) => chain.first().map(String::as_str),
        }
    }
}

/// Request metadata attached by the producing service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(default)]
    pub ip: Option<ClientIp>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// `data` of a `log_activity` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub entity_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
    pub entity: EntityKind,
    pub activity: String,
    pub resource: String,
    pub event: String,
    pub event_date: DateTime<Utc>,
    #[serde(default)]
    pub request: RequestMeta,
}

/// Row written to the `activities` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub entity_id: String,
    pub org_id: Option<String>,
    pub entity: EntityKind,
    pub activity: String,
    pub resource: String,
    pub event: String,
    pub event_date: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub device_info: DeviceInfo,
}

impl ActivityRecord {
    /// Derives the record from `event`: the IP comes from the request
    /// metadata, the device descriptor from its user agent.
    pub fn from_event(event: ActivityEvent) -> ActivityRecord {
        let ip_address = event
            .request
            .ip
            .as_ref()
            .and_then(ClientIp::address)
            .map(str::to_owned);
        let device_info = DeviceInfo::from_user_agent(event.request.user_agent.as_deref());

        ActivityRecord {
            entity_id: event.entity_id,
            org_id: event.org_id,
            entity: event.entity,
            activity: event.activity,
            resource: event.resource,
            event: event.event,
            event_date: event.event_date,
            ip_address,
            device_info,
        }
    }
}
