// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Settings are read from the process environment, after loading an optional
//! `.env` file. Everything except the queue prefix and the database URL has a
//! default suitable for a local broker.

use crate::errors::ConfigError;
use std::{str::FromStr, time::Duration};

/// What the retry orchestrator does once a message has used its retry budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Move the message to the consumer-less parking queue and stop retrying.
    #[default]
    Park,
    /// Republish the message unchanged onto the primary queue.
    Requeue,
}

impl FromStr for ExhaustionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "park" => Ok(ExhaustionPolicy::Park),
            "requeue" => Ok(ExhaustionPolicy::Requeue),
            other => Err(ConfigError::Invalid(
                "ACTIVITY_EXHAUSTION_POLICY".to_owned(),
                other.to_owned(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfigs {
    pub name: String,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub tls: bool,
    pub queue_prefix: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl RabbitMQConfigs {
    /// Builds the AMQP URI for these settings.
    pub fn uri(&self) -> String {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        format!(
            "{}://{}:{}@{}:{}/{}",
            scheme, self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Retry behaviour of the activity worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfigs {
    pub max_retries: u32,
    pub exhaustion_policy: ExhaustionPolicy,
}

impl Default for WorkerConfigs {
    fn default() -> Self {
        WorkerConfigs {
            max_retries: 1,
            exhaustion_policy: ExhaustionPolicy::Park,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfigs {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub worker: WorkerConfigs,
    pub database: DatabaseConfigs,
}

impl Configs {
    /// Loads `.env` (if present) and reads the configuration from the environment.
    pub fn from_env() -> Result<Configs, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Configs, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_prefix = lookup("RABBITMQ_QUEUE_PREFIX")
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing("RABBITMQ_QUEUE_PREFIX".to_owned()))?;

        let rabbitmq = RabbitMQConfigs {
            host: lookup("RABBITMQ_HOST").unwrap_or_else(|| "localhost".to_owned()),
            port: parse_or(&lookup, "RABBITMQ_PORT", 5672)?,
            user: lookup("RABBITMQ_USERNAME").unwrap_or_else(|| "guest".to_owned()),
            password: lookup("RABBITMQ_PASSWORD").unwrap_or_else(|| "guest".to_owned()),
            vhost: lookup("RABBITMQ_VHOST").unwrap_or_else(|| "%2f".to_owned()),
            tls: parse_or(&lookup, "RABBITMQ_ISTLS", false)?,
            queue_prefix,
            reconnect_initial: Duration::from_millis(parse_or(
                &lookup,
                "RABBITMQ_RECONNECT_INITIAL_MS",
                1_000,
            )?),
            reconnect_max: Duration::from_millis(parse_or(
                &lookup,
                "RABBITMQ_RECONNECT_MAX_MS",
                30_000,
            )?),
        };

        let worker = WorkerConfigs {
            max_retries: parse_or(&lookup, "ACTIVITY_MAX_RETRIES", 1)?,
            exhaustion_policy: match lookup("ACTIVITY_EXHAUSTION_POLICY") {
                Some(value) => value.parse()?,
                None => ExhaustionPolicy::default(),
            },
        };

        let database = DatabaseConfigs {
            url: lookup("DATABASE_URL"),
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
        };

        Ok(Configs {
            app: AppConfigs {
                name: lookup("APP_NAME").unwrap_or_else(|| "activity-consumer".to_owned()),
            },
            rabbitmq,
            worker,
            database,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key.to_owned(), raw)),
        None => Ok(default),
    }
}
