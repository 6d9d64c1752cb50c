//! Authoritative-storage collaborator contracts.
//!
//! The tracker and the command path only ever talk to storage through these
//! traits. Implementations are blocking; async callers run them under
//! `tokio::task::spawn_blocking`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::types::{Marker, MarkerId, UnitId, UserId};

/// One row of the location table joined with the user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub user_id: UserId,
    pub x: f64,
    pub y: f64,
    pub updated_at: DateTime<Utc>,
    pub hidden: bool,
    pub profile_job: String,
    pub profile_grade: i32,
    /// Job set on the location row itself; wins over the profile job.
    pub override_job: Option<String>,
    pub override_grade: Option<i32>,
    pub name: Option<String>,
    pub job_label: Option<String>,
    pub grade_label: Option<String>,
    pub color: Option<String>,
}

impl LocationRecord {
    pub fn effective_job(&self) -> &str {
        self.override_job.as_deref().unwrap_or(&self.profile_job)
    }

    pub fn effective_grade(&self) -> i32 {
        self.override_grade.unwrap_or(self.profile_grade)
    }
}

/// Reads the live position table.
pub trait LocationSource: Send + Sync {
    /// Every location of a user in `jobs` updated at or after `since`.
    /// An empty `jobs` slice means every job.
    fn active_locations(
        &self,
        jobs: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<LocationRecord>, SourceError>;
}

/// Resolves unit assignments owned by the dispatch collaborator.
pub trait UnitDirectory: Send + Sync {
    fn unit_for_user(&self, user_id: UserId) -> Result<Option<UnitId>, SourceError>;

    /// Current assignment of every id in `user_ids`; unassigned users map to
    /// `None`. Fails as a whole if any lookup fails.
    fn units_for_users(
        &self,
        user_ids: &[UserId],
    ) -> Result<BTreeMap<UserId, Option<UnitId>>, SourceError> {
        user_ids
            .iter()
            .map(|&user_id| Ok((user_id, self.unit_for_user(user_id)?)))
            .collect()
    }
}

/// Persistent map markers.
pub trait MarkerRepository: Send + Sync {
    /// Non-deleted markers of `jobs`, including markers that expired after
    /// `expired_since` so callers can surface their eviction. An empty
    /// `jobs` slice means every job.
    fn list_markers(
        &self,
        jobs: &[String],
        expired_since: DateTime<Utc>,
    ) -> Result<Vec<Marker>, SourceError>;

    /// Looks up a marker, soft-deleted ones included.
    fn get_marker(&self, id: MarkerId) -> Result<Option<Marker>, SourceError>;

    /// Inserts `marker` under a freshly assigned id and returns the stored row.
    fn create_marker(&self, marker: &Marker) -> Result<Marker, SourceError>;

    /// Overwrites an existing marker. `NotFound` if `marker.id` is unknown.
    fn update_marker(&self, marker: &Marker) -> Result<Marker, SourceError>;

    /// Sets `deleted_at` unless already set. Returns the resulting row, or
    /// `None` if the id is unknown.
    fn soft_delete_marker(
        &self,
        id: MarkerId,
        at: DateTime<Utc>,
    ) -> Result<Option<Marker>, SourceError>;
}
