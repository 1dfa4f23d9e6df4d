// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use activity_consumer::{
    activity::{ActivityRecord, ActivityRepository, UserDirectory},
    channel::AmqpChannel,
    configs::ExhaustionPolicy,
    dispatcher::{Dispatcher, Envelope, HandlerRegistry},
    errors::HandlerError,
    handler::{ConsumerHandler, ConsumerMessage, EventKey},
    orchestrator::RetryOrchestrator,
    retry::RetryTopology,
    topology::{install_primary, TopologyNames, Worker},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::json;
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use super::InMemoryBroker;

pub const PREFIX: &str = "pm";

pub fn names() -> TopologyNames {
    TopologyNames::new(PREFIX, Worker::Activity)
}

/// Handler whose results are scripted per call; once the script runs out
/// every call succeeds.
#[derive(Default)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Result<(), HandlerError>>>,
    seen: Mutex<Vec<ConsumerMessage>>,
}

impl ScriptedHandler {
    pub fn new(script: Vec<Result<(), HandlerError>>) -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler {
            script: Mutex::new(script.into()),
            seen: Mutex::new(vec![]),
        })
    }

    pub fn always_failing(times: usize) -> Arc<ScriptedHandler> {
        ScriptedHandler::new(
            (0..times)
                .map(|_| Err(HandlerError::Repository("database unavailable".to_owned())))
                .collect(),
        )
    }

    pub fn seen(&self) -> Vec<ConsumerMessage> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConsumerHandler for ScriptedHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(msg.clone());
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    users: HashSet<String>,
    records: Mutex<Vec<ActivityRecord>>,
}

impl InMemoryStore {
    pub fn with_users(users: &[&str]) -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore {
            users: users.iter().map(|u| (*u).to_owned()).collect(),
            records: Mutex::new(vec![]),
        })
    }

    pub fn records(&self) -> Vec<ActivityRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn user_exists(&self, user_id: &str) -> Result<bool, HandlerError> {
        Ok(self.users.contains(user_id))
    }
}

#[async_trait]
impl ActivityRepository for InMemoryStore {
    async fn save(&self, record: &ActivityRecord) -> Result<(), HandlerError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Installs the primary topology on `broker` and builds a dispatcher with
/// `handler` registered for `log` / `activity`.
pub async fn activity_dispatcher(
    broker: &Arc<InMemoryBroker>,
    handler: Arc<dyn ConsumerHandler>,
    max_retries: u32,
    policy: ExhaustionPolicy,
) -> Dispatcher<InMemoryBroker> {
    install_primary(broker.as_ref(), &names()).await.unwrap();

    let orchestrator = RetryOrchestrator::new(
        broker.clone(),
        RetryTopology::new(names()),
        max_retries,
        policy,
    );
    let registry = HandlerRegistry::new().register(EventKey::log_activity(), handler);

    Dispatcher::new(broker.clone(), orchestrator, registry)
}

pub fn sign_in_event(entity_id: &str) -> serde_json::Value {
    json!({
        "entity_id": entity_id,
        "org_id": "6f1c2a4e-0000-4000-8000-000000000001",
        "entity": "user",
        "activity": "Ada logged in",
        "resource": "Auth",
        "event": "Login",
        "event_date": "2025-03-01T10:00:00.000Z",
        "request": {
            "ip": ["203.0.113.9", "10.0.0.1"],
            "user_agent": "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 \
                           (KHTML, like Gecko) Version/17.2 Safari/605.1.15"
        }
    })
}

/// Publishes a raw body straight onto the primary exchange, as a producer would.
pub async fn send_raw(broker: &InMemoryBroker, body: &[u8]) {
    let names = names();
    broker
        .publish(
            names.exchange(),
            names.routing_key(),
            body,
            lapin::BasicProperties::default(),
        )
        .await
        .unwrap();
}

pub async fn send(broker: &InMemoryBroker, key: &EventKey, data: serde_json::Value) {
    let body = serde_json::to_vec(&Envelope::new(key, data)).unwrap();
    send_raw(broker, &body).await;
}
