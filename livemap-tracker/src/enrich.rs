//! Turns authoritative location rows into user markers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use livemap_core::source::{LocationRecord, UnitDirectory};
use livemap_core::types::{id_key, UnitId, UserId, UserMapping, UserMarker};
use livemap_store::Store;

use crate::error::TrackerError;
use crate::postal::PostalLookup;

/// Unit assignments resolved once per cycle.
pub type UnitAssignments = BTreeMap<UserId, Option<UnitId>>;

pub struct Enricher {
    default_color: String,
    postals: Arc<dyn PostalLookup>,
    units: Arc<dyn UnitDirectory>,
    mappings: Arc<Store<UserMapping>>,
}

impl Enricher {
    pub fn new(
        default_color: impl Into<String>,
        postals: Arc<dyn PostalLookup>,
        units: Arc<dyn UnitDirectory>,
        mappings: Arc<Store<UserMapping>>,
    ) -> Self {
        Self {
            default_color: default_color.into(),
            postals,
            units,
            mappings,
        }
    }

    /// Batched unit lookup for one cycle. `None` when the batch failed, in
    /// which case [`Enricher::enrich`] asks the directory per user.
    pub fn lookup_units(&self, user_ids: &[UserId]) -> Option<UnitAssignments> {
        match self.units.units_for_users(user_ids) {
            Ok(units) => Some(units),
            Err(err) => {
                tracing::warn!(
                    users = user_ids.len(),
                    error = %err,
                    "batched unit lookup failed, falling back to per-user lookups",
                );
                None
            }
        }
    }

    /// Location override wins over the profile job; missing colors fall
    /// back to the default. The unit comes from `units` when present and the
    /// mapping bucket is brought in line with it.
    pub fn enrich(
        &self,
        record: LocationRecord,
        units: Option<&UnitAssignments>,
        now: DateTime<Utc>,
    ) -> Result<UserMarker, TrackerError> {
        let unit_id = match units {
            Some(units) => units.get(&record.user_id).copied().flatten(),
            None => self
                .units
                .unit_for_user(record.user_id)
                .map_err(TrackerError::Units)?,
        };
        self.sync_mapping(record.user_id, unit_id, now)?;

        let job = record.effective_job().to_string();
        let job_grade = record.effective_grade();
        let color = record
            .color
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.default_color.clone());

        Ok(UserMarker {
            user_id: record.user_id,
            postal: self.postals.nearest(record.x, record.y),
            x: record.x,
            y: record.y,
            job,
            job_label: record.job_label,
            job_grade,
            job_grade_label: record.grade_label,
            name: record.name.unwrap_or_default(),
            unit_id,
            color,
            hidden: record.hidden,
            updated_at: record.updated_at,
        })
    }

    /// Writes the mapping only when the assignment differs from what is held.
    fn sync_mapping(
        &self,
        user_id: UserId,
        unit_id: Option<UnitId>,
        now: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        let key = id_key(user_id);
        if let Some(mapping) = self.mappings.get(&key) {
            if mapping.unit_id == unit_id {
                return Ok(());
            }
            tracing::debug!(
                user_id = %user_id,
                from = ?mapping.unit_id.map(|u| u.0),
                to = ?unit_id.map(|u| u.0),
                "unit assignment changed",
            );
        }
        self.mappings.put(
            key,
            UserMapping {
                user_id,
                unit_id,
                updated_at: now,
            },
        )?;
        Ok(())
    }
}
