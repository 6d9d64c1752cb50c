//! Change events carried on the broker and their topic names.
//!
//! Topics follow `{domain}.{topic}.{type}.{job}`; the job segment is omitted
//! for tracker batches, which span every tracked job.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Marker, MarkerId, UserId};

pub const DOMAIN: &str = "livemap";

/// Result of one reconciliation cycle that changed something.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMarkersEvent {
    pub added: Vec<UserId>,
    pub removed: Vec<UserId>,
    pub updated: usize,
}

impl UserMarkersEvent {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated == 0
    }
}

/// Everything the stream handlers listen to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LivemapEvent {
    UserMarkers(UserMarkersEvent),
    MarkerUpdate(Marker),
    MarkerDelete { id: MarkerId, job: String },
}

impl LivemapEvent {
    pub fn topic(&self) -> Topic {
        match self {
            LivemapEvent::UserMarkers(_) => Topic::new("users", TopicKind::Update, None),
            LivemapEvent::MarkerUpdate(marker) => {
                Topic::new("markers", TopicKind::Update, Some(marker.job.clone()))
            }
            LivemapEvent::MarkerDelete { job, .. } => {
                Topic::new("markers", TopicKind::Delete, Some(job.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Update,
    Delete,
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKind::Update => write!(f, "update"),
            TopicKind::Delete => write!(f, "delete"),
        }
    }
}

/// A structured event-bus topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub topic: &'static str,
    pub kind: TopicKind,
    pub job: Option<String>,
}

impl Topic {
    pub fn new(topic: &'static str, kind: TopicKind, job: Option<String>) -> Self {
        Self { topic, kind, job }
    }

    /// Whether a subscriber restricted to `jobs` cares about this topic.
    /// Job-less topics match everyone.
    pub fn matches_jobs(&self, jobs: &[String]) -> bool {
        match &self.job {
            Some(job) => jobs.iter().any(|j| j == job),
            None => true,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DOMAIN}.{}.{}", self.topic, self.kind)?;
        if let Some(job) = &self.job {
            write!(f, ".{job}")?;
        }
        Ok(())
    }
}
