// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{ActivityEvent, ActivityRecord, ActivityRepository, EntityKind, UserDirectory};
use crate::errors::HandlerError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Records one activity event in the audit trail.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityLogger: Send + Sync {
    async fn log_activity(&self, event: ActivityEvent) -> Result<(), HandlerError>;
}

/// Validates the acting entity, derives the client address and device, then
/// persists the record.
pub struct ActivityService {
    users: Arc<dyn UserDirectory>,
    activities: Arc<dyn ActivityRepository>,
}

impl ActivityService {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        activities: Arc<dyn ActivityRepository>,
    ) -> ActivityService {
        ActivityService { users, activities }
    }
}

#[async_trait]
impl ActivityLogger for ActivityService {
    async fn log_activity(&self, event: ActivityEvent) -> Result<(), HandlerError> {
        // admins live outside the users table
        if event.entity == EntityKind::User && !self.users.user_exists(&event.entity_id).await? {
            warn!(entity_id = event.entity_id.as_str(), "activity for unknown user");
            return Err(HandlerError::NotFound("User".to_owned()));
        }

        let record = ActivityRecord::from_event(event);
        self.activities.save(&record).await?;

        debug!(
            entity_id = record.entity_id.as_str(),
            resource = record.resource.as_str(),
            "activity logged"
        );

        Ok(())
    }
}
