//! Domain types for the livemap.
//!
//! Positions are world coordinates as reported by the game engine. Every type
//! here is serde-serializable and is used unchanged on the wire, in the
//! replicated store and in bucket snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identity of a tracked user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i32> for UserId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// Identity of a map marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerId(pub u64);

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for MarkerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identity of a dispatch unit. Units are owned by the dispatch collaborator;
/// the livemap only ever stores the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for UnitId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Store keys
// ---------------------------------------------------------------------------

/// Canonical key of a user marker or mapping: `"<id>"`.
pub fn id_key(id: UserId) -> String {
    id.0.to_string()
}

/// Job-scoped key of a user marker: `"<job>.<grade>.<id>"`.
pub fn job_key(job: &str, grade: i32, id: UserId) -> String {
    format!("{job}.{grade}.{id}")
}

/// Prefix selecting every job-scoped key of `job`.
pub fn job_prefix(job: &str) -> String {
    format!("{job}.")
}

// ---------------------------------------------------------------------------
// User markers
// ---------------------------------------------------------------------------

/// A tracked, positioned user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMarker {
    pub user_id: UserId,
    pub x: f64,
    pub y: f64,
    pub job: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_label: Option<String>,
    pub job_grade: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_grade_label: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<UnitId>,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal: Option<String>,
    /// Off-duty users stay tracked but are never broadcast to others.
    #[serde(default)]
    pub hidden: bool,
    pub updated_at: DateTime<Utc>,
}

impl UserMarker {
    pub fn id_key(&self) -> String {
        id_key(self.user_id)
    }

    pub fn job_key(&self) -> String {
        job_key(&self.job, self.job_grade, self.user_id)
    }

    pub fn on_duty(&self) -> bool {
        !self.hidden
    }
}

/// Cached user → unit assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMapping {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<UnitId>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Map markers
// ---------------------------------------------------------------------------

/// Marker payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarkerData {
    Circle {
        radius: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opacity: Option<f32>,
    },
    Icon {
        icon: String,
    },
}

impl MarkerData {
    pub fn kind(&self) -> &'static str {
        match self {
            MarkerData::Circle { .. } => "circle",
            MarkerData::Icon { .. } => "icon",
        }
    }
}

/// Who created a marker, captured at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerCreator {
    pub user_id: UserId,
    pub job: String,
    pub job_grade: i32,
}

/// A job-owned map annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: MarkerId,
    pub job: String,
    pub x: f64,
    pub y: f64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: String,
    pub data: MarkerData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<MarkerCreator>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Marker {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    /// Visible iff not soft-deleted and not expired.
    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.deleted_at.is_none() && !self.is_expired_at(now)
    }
}

// ---------------------------------------------------------------------------
// Callers
// ---------------------------------------------------------------------------

/// Identity of a connected caller as handed over by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: UserId,
    pub job: String,
    pub job_grade: i32,
    #[serde(default)]
    pub superuser: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
