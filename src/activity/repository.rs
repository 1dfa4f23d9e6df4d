// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Persistence seams of the activity worker and their Postgres implementation.

use super::ActivityRecord;
use crate::errors::HandlerError;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, error};

/// Stored when the producer did not capture a client address.
const UNKNOWN_IP: &str = "Unknown";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityRepository: Send + Sync {
    async fn save(&self, record: &ActivityRecord) -> Result<(), HandlerError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, user_id: &str) -> Result<bool, HandlerError>;
}

#[derive(Debug, Clone)]
pub struct PgActivityRepository {
    pool: PgPool,
}

impl PgActivityRepository {
    pub fn new(pool: PgPool) -> PgActivityRepository {
        PgActivityRepository { pool }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> HandlerError {
    error!(error = err.to_string(), operation, "database failure");
    HandlerError::Repository(format!("{}: {}", operation, err))
}

#[async_trait]
impl ActivityRepository for PgActivityRepository {
    async fn save(&self, record: &ActivityRecord) -> Result<(), HandlerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query(
            r#"
            INSERT INTO activities (
                entity_id,
                org_id,
                entity,
                resource,
                event,
                activity,
                ip_address,
                "deviceInfoBrowser",
                "deviceInfoOs",
                "deviceInfoVersion",
                event_date
            )
            VALUES ($1, $2::uuid, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&record.entity_id)
        .bind(record.org_id.as_deref())
        .bind(record.entity.as_str())
        .bind(&record.resource)
        .bind(&record.event)
        .bind(&record.activity)
        .bind(record.ip_address.as_deref().unwrap_or(UNKNOWN_IP))
        .bind(&record.device_info.browser)
        .bind(&record.device_info.os)
        .bind(&record.device_info.version)
        .bind(record.event_date.naive_utc())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert activity", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        debug!(
            entity = %record.entity,
            event = record.event.as_str(),
            "activity stored"
        );

        Ok(())
    }
}

#[async_trait]
impl UserDirectory for PgActivityRepository {
    async fn user_exists(&self, user_id: &str) -> Result<bool, HandlerError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM users WHERE user_id::text = $1)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("lookup user", e))
    }
}
