//! The reconciliation loop.
//!
//! One cycle: query → enrich → plan → apply → publish. A failed query aborts
//! the cycle before anything is applied; per-user failures are collected in
//! [`CycleErrors`] and the cycle carries on.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use livemap_broker::Broker;
use livemap_core::config::LivemapConfig;
use livemap_core::events::{LivemapEvent, UserMarkersEvent};
use livemap_core::source::{LocationSource, UnitDirectory};
use livemap_core::types::{id_key, UnitId, UserId, UserMapping, UserMarker};
use livemap_store::StoreError;

use crate::diff::{self, Change, CyclePlan};
use crate::enrich::Enricher;
use crate::error::{CycleErrors, TrackerError};
use crate::index::TrackerStores;
use crate::postal::PostalLookup;

// ---------------------------------------------------------------------------
// Settings and report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    pub refresh_interval: Duration,
    pub location_window: chrono::Duration,
    pub stale_grace: chrono::Duration,
    pub visible_jobs: Vec<String>,
    pub default_color: String,
}

impl From<&LivemapConfig> for TrackerSettings {
    fn from(config: &LivemapConfig) -> Self {
        Self {
            refresh_interval: config.refresh_interval(),
            location_window: config.location_window(),
            stale_grace: config.stale_grace(),
            visible_jobs: config.visible_jobs.clone(),
            default_color: config.default_color.clone(),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from(&LivemapConfig::default())
    }
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub added: Vec<UserId>,
    pub removed: Vec<UserId>,
    pub updated: usize,
    pub unchanged: usize,
    pub retained: usize,
    pub duration: Duration,
    pub errors: CycleErrors,
}

impl CycleReport {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || self.updated > 0
    }

    pub fn event(&self) -> UserMarkersEvent {
        UserMarkersEvent {
            added: self.added.clone(),
            removed: self.removed.clone(),
            updated: self.updated,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct TrackerManager {
    settings: TrackerSettings,
    stores: TrackerStores,
    locations: Arc<dyn LocationSource>,
    enricher: Arc<Enricher>,
    broker: Broker<LivemapEvent>,
}

impl TrackerManager {
    pub fn new(
        settings: TrackerSettings,
        stores: TrackerStores,
        locations: Arc<dyn LocationSource>,
        units: Arc<dyn UnitDirectory>,
        postals: Arc<dyn PostalLookup>,
        broker: Broker<LivemapEvent>,
    ) -> Self {
        let enricher = Arc::new(Enricher::new(
            settings.default_color.clone(),
            postals,
            units,
            stores.mappings.clone(),
        ));
        Self {
            settings,
            stores,
            locations,
            enricher,
            broker,
        }
    }

    pub fn stores(&self) -> &TrackerStores {
        &self.stores
    }

    pub async fn refresh_once(&self) -> Result<CycleReport, TrackerError> {
        self.refresh_at(Utc::now()).await
    }

    /// Run one cycle as of `now`.
    pub async fn refresh_at(&self, now: DateTime<Utc>) -> Result<CycleReport, TrackerError> {
        let started = Instant::now();

        let locations = self.locations.clone();
        let enricher = self.enricher.clone();
        let jobs = self.settings.visible_jobs.clone();
        let since = now - self.settings.location_window;
        let (markers, seen, errors) = tokio::task::spawn_blocking(move || {
            let records = locations.active_locations(&jobs, since)?;
            let user_ids: Vec<UserId> = records.iter().map(|r| r.user_id).collect();
            let units = enricher.lookup_units(&user_ids);
            let mut markers = Vec::with_capacity(records.len());
            let mut seen = BTreeSet::new();
            let mut errors = CycleErrors::default();
            for record in records {
                let user_id = record.user_id;
                seen.insert(user_id);
                match enricher.enrich(record, units.as_ref(), now) {
                    Ok(marker) => markers.push(marker),
                    Err(err) => errors.push(user_id, err),
                }
            }
            Ok::<_, TrackerError>((markers, seen, errors))
        })
        .await
        .map_err(|err| TrackerError::Join(err.to_string()))??;

        let current = self.stores.by_id.list("");
        let plan = diff::plan(&current, markers, &seen, now, self.settings.stale_grace);
        let mut report = self.apply(plan, errors);
        report.duration = started.elapsed();

        if !report.errors.is_empty() {
            tracing::warn!(
                failed = report.errors.len(),
                error = %report.errors,
                "tracker cycle completed with per-user errors",
            );
        }

        if report.has_changes() {
            let delivered = self
                .broker
                .publish(LivemapEvent::UserMarkers(report.event()))
                .await;
            tracing::trace!(delivered, "published user markers event");
        }

        tracing::debug!(
            added = report.added.len(),
            removed = report.removed.len(),
            updated = report.updated,
            unchanged = report.unchanged,
            retained = report.retained,
            duration_ms = report.duration.as_millis() as u64,
            "tracker cycle complete",
        );
        Ok(report)
    }

    fn apply(&self, plan: CyclePlan, mut errors: CycleErrors) -> CycleReport {
        let mut report = CycleReport {
            unchanged: plan.unchanged,
            retained: plan.retained,
            ..CycleReport::default()
        };

        for upsert in plan.upserts {
            let user_id = upsert.marker.user_id;
            let incoming = upsert.marker;
            let result = self.stores.by_id.compute_update(&id_key(user_id), |stored| {
                match stored {
                    Some(stored) if diff::is_current(stored, &incoming) => None,
                    _ => Some(incoming.clone()),
                }
            });
            let applied = match result {
                Ok(Some(_)) => true,
                Ok(None) => false,
                // Written; only the index hook failed.
                Err(err @ StoreError::Hooks { .. }) => {
                    errors.push(user_id, err);
                    true
                }
                Err(err) => {
                    errors.push(user_id, err);
                    false
                }
            };

            match (applied, upsert.change) {
                (true, Change::Added) => report.added.push(user_id),
                (true, Change::Updated) => report.updated += 1,
                (false, _) => report.unchanged += 1,
            }
        }

        for user_id in plan.removals {
            let key = id_key(user_id);
            match self.stores.by_id.delete(&key) {
                Ok(_) => report.removed.push(user_id),
                Err(err) if err.is_not_found() => continue,
                Err(err @ StoreError::Hooks { .. }) => {
                    report.removed.push(user_id);
                    errors.push(user_id, err);
                }
                Err(err) => {
                    errors.push(user_id, err);
                    continue;
                }
            }
            match self.stores.mappings.delete(&key) {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => errors.push(user_id, err),
            }
        }

        report.errors = errors;
        report
    }

    /// Apply a unit assignment change from dispatch right away instead of
    /// waiting for the next cycle, which re-reads the directory anyway.
    /// Returns the updated marker if the user is tracked.
    pub async fn assign_unit(
        &self,
        user_id: UserId,
        unit_id: Option<UnitId>,
    ) -> Result<Option<UserMarker>, TrackerError> {
        let key = id_key(user_id);
        self.stores.mappings.put(
            key.clone(),
            UserMapping {
                user_id,
                unit_id,
                updated_at: Utc::now(),
            },
        )?;

        let updated = self.stores.by_id.compute_update(&key, |stored| {
            stored.filter(|m| m.unit_id != unit_id).map(|m| UserMarker {
                unit_id,
                ..m.clone()
            })
        })?;

        if updated.is_some() {
            tracing::info!(user_id = %user_id, unit_id = ?unit_id.map(|u| u.0), "unit assignment changed");
            self.broker
                .publish(LivemapEvent::UserMarkers(UserMarkersEvent {
                    added: vec![],
                    removed: vec![],
                    updated: 1,
                }))
                .await;
        }
        Ok(updated)
    }

    /// Tick until shutdown. Failed cycles are logged and retried on the next
    /// tick.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.settings.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.settings.refresh_interval.as_millis() as u64,
            jobs = self.settings.visible_jobs.len(),
            "tracker started",
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh_once().await {
                        tracing::warn!(error = %err, "tracker cycle aborted");
                    }
                }
            }
        }

        tracing::info!("tracker stopped");
    }
}
