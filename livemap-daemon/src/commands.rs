//! Marker write path.
//!
//! Commands persist through the [`MarkerRepository`] first and only then
//! publish on the broker, so every open stream (the caller's included)
//! converges through its ordinary incremental path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use livemap_broker::Broker;
use livemap_core::events::LivemapEvent;
use livemap_core::source::MarkerRepository;
use livemap_core::types::{Marker, MarkerCreator, MarkerData, MarkerId, UserInfo};
use livemap_core::SourceError;

use crate::access::{can_edit, Permissions};
use crate::error::CommandError;

/// Client-supplied marker fields. `id: None` creates a new marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MarkerId>,
    pub job: String,
    pub x: f64,
    pub y: f64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub data: MarkerData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MarkerInput {
    fn validate(&self) -> Result<(), CommandError> {
        if self.job.trim().is_empty() {
            return Err(invalid("job must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !self.x.is_finite() || !self.y.is_finite() {
            return Err(invalid("position must be finite"));
        }
        match &self.data {
            MarkerData::Circle { radius, opacity } => {
                if !radius.is_finite() || *radius <= 0.0 {
                    return Err(invalid("circle radius must be positive"));
                }
                if opacity.is_some_and(|o| !(0.0..=1.0).contains(&o)) {
                    return Err(invalid("circle opacity must be within 0..=1"));
                }
            }
            MarkerData::Icon { icon } => {
                if icon.trim().is_empty() {
                    return Err(invalid("icon must not be empty"));
                }
            }
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> CommandError {
    CommandError::InvalidRequest(reason.to_string())
}

#[derive(Clone)]
pub struct CommandService {
    markers: Arc<dyn MarkerRepository>,
    permissions: Arc<dyn Permissions>,
    broker: Broker<LivemapEvent>,
    default_color: String,
}

impl CommandService {
    pub fn new(
        markers: Arc<dyn MarkerRepository>,
        permissions: Arc<dyn Permissions>,
        broker: Broker<LivemapEvent>,
        default_color: impl Into<String>,
    ) -> Self {
        Self {
            markers,
            permissions,
            broker,
            default_color: default_color.into(),
        }
    }

    /// Create a marker, or overwrite the one named by `input.id`.
    ///
    /// The creator and creation time of an existing marker are kept.
    /// Updating a soft-deleted marker is `NotFound`.
    pub async fn create_or_update_marker(
        &self,
        user: &UserInfo,
        input: MarkerInput,
    ) -> Result<Marker, CommandError> {
        input.validate()?;
        self.ensure_job(user, &input.job)?;

        let now = Utc::now();
        let color = input
            .color
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.default_color.clone());

        let mut moved_from = None;
        let stored = match input.id {
            None => {
                let marker = Marker {
                    id: MarkerId(0),
                    job: input.job,
                    x: input.x,
                    y: input.y,
                    name: input.name,
                    description: input.description,
                    color,
                    data: input.data,
                    creator: Some(MarkerCreator {
                        user_id: user.user_id,
                        job: user.job.clone(),
                        job_grade: user.job_grade,
                    }),
                    created_at: now,
                    updated_at: now,
                    expires_at: input.expires_at,
                    deleted_at: None,
                };
                let repo = self.markers.clone();
                blocking(move || repo.create_marker(&marker)).await?
            }
            Some(id) => {
                let existing = self
                    .load(id)
                    .await?
                    .filter(|m| m.deleted_at.is_none())
                    .ok_or(CommandError::NotFound(id))?;
                self.ensure_job(user, &existing.job)?;
                self.ensure_access(user, &existing)?;
                if existing.job != input.job {
                    moved_from = Some(existing.job.clone());
                }

                let marker = Marker {
                    id,
                    job: input.job,
                    x: input.x,
                    y: input.y,
                    name: input.name,
                    description: input.description,
                    color,
                    data: input.data,
                    creator: existing.creator,
                    created_at: existing.created_at,
                    updated_at: now,
                    expires_at: input.expires_at,
                    deleted_at: None,
                };
                let repo = self.markers.clone();
                blocking(move || repo.update_marker(&marker)).await?
            }
        };

        tracing::info!(
            marker_id = %stored.id,
            job = %stored.job,
            kind = stored.data.kind(),
            user_id = %user.user_id,
            "marker saved",
        );
        // Clients of the previous job drop it; the update reaches the new one.
        if let Some(job) = moved_from {
            self.broker
                .publish(LivemapEvent::MarkerDelete { id: stored.id, job })
                .await;
        }
        self.broker
            .publish(LivemapEvent::MarkerUpdate(stored.clone()))
            .await;
        Ok(stored)
    }

    /// Soft-delete a marker. Deleting an already deleted marker returns it
    /// unchanged and publishes nothing.
    pub async fn delete_marker(
        &self,
        user: &UserInfo,
        id: MarkerId,
    ) -> Result<Marker, CommandError> {
        let existing = self.load(id).await?.ok_or(CommandError::NotFound(id))?;
        self.ensure_job(user, &existing.job)?;
        self.ensure_access(user, &existing)?;
        if existing.deleted_at.is_some() {
            return Ok(existing);
        }

        let repo = self.markers.clone();
        let deleted = blocking(move || repo.soft_delete_marker(id, Utc::now()))
            .await?
            .ok_or(CommandError::NotFound(id))?;

        tracing::info!(marker_id = %id, job = %deleted.job, user_id = %user.user_id, "marker deleted");
        self.broker
            .publish(LivemapEvent::MarkerDelete {
                id,
                job: deleted.job.clone(),
            })
            .await;
        Ok(deleted)
    }

    async fn load(&self, id: MarkerId) -> Result<Option<Marker>, CommandError> {
        let repo = self.markers.clone();
        blocking(move || repo.get_marker(id)).await
    }

    fn ensure_job(&self, user: &UserInfo, job: &str) -> Result<(), CommandError> {
        if self.permissions.is_superuser(user)
            || self.permissions.marker_jobs(user).iter().any(|j| j == job)
        {
            Ok(())
        } else {
            Err(CommandError::PermissionDenied(format!(
                "markers of job '{job}' are not editable"
            )))
        }
    }

    fn ensure_access(&self, user: &UserInfo, marker: &Marker) -> Result<(), CommandError> {
        if self.permissions.is_superuser(user) {
            return Ok(());
        }
        let level = self.permissions.marker_access(user);
        if can_edit(level, user, marker.creator.as_ref()) {
            Ok(())
        } else {
            Err(CommandError::PermissionDenied(format!(
                "access level '{level}' does not cover marker {}",
                marker.id
            )))
        }
    }
}

async fn blocking<R, F>(f: F) -> Result<R, CommandError>
where
    F: FnOnce() -> Result<R, SourceError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CommandError::Join(e.to_string()))?
        .map_err(CommandError::from)
}
