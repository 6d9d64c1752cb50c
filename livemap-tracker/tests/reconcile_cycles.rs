use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;

use livemap_broker::{spawn, Broker, BrokerConfig, Subscription};
use livemap_core::events::LivemapEvent;
use livemap_core::source::{LocationRecord, LocationSource, UnitDirectory};
use livemap_core::{SourceError, UnitId, UserId};
use livemap_tracker::{Postals, TrackerManager, TrackerSettings, TrackerStores};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeLocations {
    rows: Mutex<Vec<LocationRecord>>,
    fail: Mutex<bool>,
}

impl FakeLocations {
    fn set(&self, rows: Vec<LocationRecord>) {
        *self.rows.lock().unwrap() = rows;
    }

    fn fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl LocationSource for FakeLocations {
    fn active_locations(
        &self,
        jobs: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<LocationRecord>, SourceError> {
        if *self.fail.lock().unwrap() {
            return Err(SourceError::InvalidData("database unavailable".into()));
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.updated_at >= since)
            .filter(|r| jobs.is_empty() || jobs.iter().any(|j| j == r.effective_job()))
            .cloned()
            .collect())
    }
}

/// Dispatch directory; ids in `broken` fail their lookup.
#[derive(Default)]
struct FakeUnits {
    assigned: Mutex<BTreeMap<UserId, UnitId>>,
    broken: Mutex<BTreeSet<UserId>>,
}

impl FakeUnits {
    fn assign(&self, user_id: UserId, unit_id: UnitId) {
        self.assigned.lock().unwrap().insert(user_id, unit_id);
    }

    fn break_user(&self, user_id: UserId) {
        self.broken.lock().unwrap().insert(user_id);
    }
}

impl UnitDirectory for FakeUnits {
    fn unit_for_user(&self, user_id: UserId) -> Result<Option<UnitId>, SourceError> {
        if self.broken.lock().unwrap().contains(&user_id) {
            return Err(SourceError::InvalidData(format!("no dispatch record for {user_id}")));
        }
        Ok(self.assigned.lock().unwrap().get(&user_id).copied())
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn row(id: i32, job: &str, grade: i32, x: f64, y: f64, at: DateTime<Utc>) -> LocationRecord {
    LocationRecord {
        user_id: UserId(id),
        x,
        y,
        updated_at: at,
        hidden: false,
        profile_job: job.to_string(),
        profile_grade: grade,
        override_job: None,
        override_grade: None,
        name: None,
        job_label: None,
        grade_label: None,
        color: None,
    }
}

struct Harness {
    manager: TrackerManager,
    locations: Arc<FakeLocations>,
    units: Arc<FakeUnits>,
    events: Subscription<LivemapEvent>,
    _broker: Broker<LivemapEvent>,
    _shutdown: broadcast::Sender<()>,
}

async fn harness(settings: TrackerSettings) -> Harness {
    let (shutdown, _) = broadcast::channel(1);
    let (broker, _handle) = spawn(BrokerConfig::default(), shutdown.subscribe());
    let events = broker.subscribe().await.unwrap();
    let locations = Arc::new(FakeLocations::default());
    let units = Arc::new(FakeUnits::default());
    let manager = TrackerManager::new(
        settings,
        TrackerStores::new(),
        locations.clone(),
        units.clone(),
        Arc::new(Postals::default()),
        broker.clone(),
    );
    Harness {
        manager,
        locations,
        units,
        events,
        _broker: broker,
        _shutdown: shutdown,
    }
}

async fn next_event(events: &mut Subscription<LivemapEvent>) -> Option<LivemapEvent> {
    tokio::time::timeout(StdDuration::from_millis(200), events.recv())
        .await
        .ok()
        .flatten()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_sighting_lands_in_both_indices_and_is_announced() {
    let mut h = harness(TrackerSettings::default()).await;
    h.locations.set(vec![row(1, "ambulance", 3, 1.0, 1.0, t0())]);

    let report = h.manager.refresh_at(t0()).await.unwrap();
    assert_eq!(report.added, vec![UserId(1)]);

    let stores = h.manager.stores();
    assert!(stores.by_job.contains("ambulance.3.1"));
    assert!(stores.by_id.contains("1"));
    assert!(stores.mappings.contains("1"));

    match next_event(&mut h.events).await {
        Some(LivemapEvent::UserMarkers(event)) => {
            assert_eq!(event.added, vec![UserId(1)]);
            assert!(event.removed.is_empty());
        }
        other => panic!("expected user markers event, got {other:?}"),
    }
}

#[tokio::test]
async fn move_updates_in_place_and_repeats_are_silent() {
    let mut h = harness(TrackerSettings::default()).await;
    h.locations.set(vec![row(1, "ambulance", 3, 1.0, 1.0, t0())]);
    h.manager.refresh_at(t0()).await.unwrap();
    next_event(&mut h.events).await.unwrap();

    let moved_at = t0() + Duration::seconds(2);
    h.locations.set(vec![row(1, "ambulance", 3, 5.0, 5.0, moved_at)]);
    let report = h.manager.refresh_at(moved_at).await.unwrap();
    assert!(report.added.is_empty() && report.removed.is_empty());
    assert_eq!(report.updated, 1);
    let stored = h.manager.stores().by_job.get("ambulance.3.1").unwrap();
    assert_eq!((stored.x, stored.y), (5.0, 5.0));
    assert!(next_event(&mut h.events).await.is_some());

    let report = h.manager.refresh_at(moved_at).await.unwrap();
    assert!(!report.has_changes());
    assert_eq!(report.unchanged, 1);
    assert!(next_event(&mut h.events).await.is_none(), "no duplicate event");
}

#[tokio::test]
async fn departure_is_removed_once_after_grace() {
    let mut h = harness(TrackerSettings::default()).await;
    h.locations.set(vec![row(1, "ambulance", 3, 1.0, 1.0, t0())]);
    h.manager.refresh_at(t0()).await.unwrap();
    next_event(&mut h.events).await.unwrap();

    h.locations.set(vec![]);
    let report = h.manager.refresh_at(t0() + Duration::seconds(10)).await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.retained, 1);
    assert!(h.manager.stores().by_id.contains("1"));

    let report = h.manager.refresh_at(t0() + Duration::seconds(45)).await.unwrap();
    assert_eq!(report.removed, vec![UserId(1)]);
    assert!(h.manager.stores().by_job.is_empty());
    assert!(h.manager.stores().mappings.is_empty());
    match next_event(&mut h.events).await {
        Some(LivemapEvent::UserMarkers(event)) => assert_eq!(event.removed, vec![UserId(1)]),
        other => panic!("expected removal event, got {other:?}"),
    }

    let report = h.manager.refresh_at(t0() + Duration::seconds(60)).await.unwrap();
    assert!(report.removed.is_empty());
    assert!(next_event(&mut h.events).await.is_none());
}

#[tokio::test]
async fn query_failure_aborts_without_touching_the_store() {
    let h = harness(TrackerSettings::default()).await;
    h.locations.set(vec![row(1, "police", 1, 0.0, 0.0, t0())]);
    h.manager.refresh_at(t0()).await.unwrap();

    h.locations.fail(true);
    let err = h
        .manager
        .refresh_at(t0() + Duration::hours(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("location query failed"), "got: {err}");
    assert!(h.manager.stores().by_id.contains("1"));
}

#[tokio::test]
async fn only_visible_jobs_are_tracked() {
    let settings = TrackerSettings {
        visible_jobs: vec!["police".into()],
        ..TrackerSettings::default()
    };
    let h = harness(settings).await;
    h.locations.set(vec![
        row(1, "police", 1, 0.0, 0.0, t0()),
        row(2, "taxi", 0, 0.0, 0.0, t0()),
    ]);
    let report = h.manager.refresh_at(t0()).await.unwrap();
    assert_eq!(report.added, vec![UserId(1)]);
    assert_eq!(h.manager.stores().by_id.len(), 1);
}

#[tokio::test]
async fn assign_unit_updates_marker_and_mapping() {
    let mut h = harness(TrackerSettings::default()).await;
    h.locations.set(vec![row(1, "police", 1, 0.0, 0.0, t0())]);
    h.manager.refresh_at(t0()).await.unwrap();
    next_event(&mut h.events).await.unwrap();

    h.units.assign(UserId(1), UnitId(12));
    let marker = h
        .manager
        .assign_unit(UserId(1), Some(UnitId(12)))
        .await
        .unwrap()
        .expect("tracked user");
    assert_eq!(marker.unit_id, Some(UnitId(12)));
    assert_eq!(
        h.manager.stores().by_job.get("police.1.1").unwrap().unit_id,
        Some(UnitId(12))
    );
    assert_eq!(
        h.manager.stores().mappings.get("1").unwrap().unit_id,
        Some(UnitId(12))
    );
    match next_event(&mut h.events).await {
        Some(LivemapEvent::UserMarkers(event)) => assert_eq!(event.updated, 1),
        other => panic!("expected update event, got {other:?}"),
    }

    // The next cycle reads the same assignment back.
    let report = h.manager.refresh_at(t0()).await.unwrap();
    assert!(!report.has_changes());
}

#[tokio::test]
async fn assign_unit_for_untracked_user_only_caches_mapping() {
    let h = harness(TrackerSettings::default()).await;
    let result = h.manager.assign_unit(UserId(5), Some(UnitId(1))).await.unwrap();
    assert!(result.is_none());
    assert!(h.manager.stores().mappings.contains("5"));
}

#[tokio::test]
async fn unit_reassignment_reaches_a_tracked_user() {
    let mut h = harness(TrackerSettings::default()).await;
    h.units.assign(UserId(1), UnitId(4));
    h.locations.set(vec![row(1, "police", 1, 0.0, 0.0, t0())]);
    h.manager.refresh_at(t0()).await.unwrap();
    next_event(&mut h.events).await.unwrap();
    assert_eq!(h.manager.stores().by_id.get("1").unwrap().unit_id, Some(UnitId(4)));

    h.units.assign(UserId(1), UnitId(7));
    let moved_at = t0() + Duration::seconds(5);
    h.locations.set(vec![row(1, "police", 1, 2.0, 2.0, moved_at)]);
    let report = h.manager.refresh_at(moved_at).await.unwrap();
    assert_eq!(report.updated, 1);

    let stores = h.manager.stores();
    assert_eq!(stores.by_id.get("1").unwrap().unit_id, Some(UnitId(7)));
    assert_eq!(stores.by_job.get("police.1.1").unwrap().unit_id, Some(UnitId(7)));
    assert_eq!(stores.mappings.get("1").unwrap().unit_id, Some(UnitId(7)));
    assert!(next_event(&mut h.events).await.is_some());
}

#[tokio::test]
async fn reassignment_alone_updates_a_stationary_user() {
    let mut h = harness(TrackerSettings::default()).await;
    h.locations.set(vec![row(1, "police", 1, 0.0, 0.0, t0())]);
    h.manager.refresh_at(t0()).await.unwrap();
    next_event(&mut h.events).await.unwrap();

    h.units.assign(UserId(1), UnitId(3));
    let report = h.manager.refresh_at(t0() + Duration::seconds(1)).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(h.manager.stores().by_id.get("1").unwrap().unit_id, Some(UnitId(3)));
    match next_event(&mut h.events).await {
        Some(LivemapEvent::UserMarkers(event)) => assert_eq!(event.updated, 1),
        other => panic!("expected update event, got {other:?}"),
    }
}

#[tokio::test]
async fn one_failing_user_does_not_hold_back_the_cycle() {
    let mut h = harness(TrackerSettings::default()).await;
    h.units.break_user(UserId(2));
    h.locations.set(vec![
        row(1, "ambulance", 3, 1.0, 1.0, t0()),
        row(2, "ambulance", 3, 2.0, 2.0, t0()),
    ]);

    let report = h.manager.refresh_at(t0()).await.unwrap();
    assert_eq!(report.added, vec![UserId(1)]);
    assert_eq!(report.errors.len(), 1);
    let (failed, err) = &report.errors.errors[0];
    assert_eq!(*failed, UserId(2));
    assert!(err.to_string().contains("unit lookup failed"), "got: {err}");

    let stores = h.manager.stores();
    assert!(stores.by_id.contains("1"));
    assert!(stores.by_job.contains("ambulance.3.1"));
    assert!(!stores.by_id.contains("2"));
    match next_event(&mut h.events).await {
        Some(LivemapEvent::UserMarkers(event)) => assert_eq!(event.added, vec![UserId(1)]),
        other => panic!("expected user markers event, got {other:?}"),
    }
}

#[tokio::test]
async fn older_row_never_overwrites_a_newer_marker() {
    let mut h = harness(TrackerSettings::default()).await;
    let newer = t0() + Duration::seconds(10);
    h.locations.set(vec![row(1, "ambulance", 3, 5.0, 5.0, newer)]);
    h.manager.refresh_at(newer).await.unwrap();
    next_event(&mut h.events).await.unwrap();

    h.locations.set(vec![row(1, "ambulance", 3, 1.0, 1.0, t0())]);
    let report = h.manager.refresh_at(newer + Duration::seconds(1)).await.unwrap();
    assert!(!report.has_changes());
    assert_eq!(report.unchanged, 1);

    let stored = h.manager.stores().by_id.get("1").unwrap();
    assert_eq!((stored.x, stored.y), (5.0, 5.0));
    assert_eq!(stored.updated_at, newer);
    assert!(next_event(&mut h.events).await.is_none());
}

#[tokio::test]
async fn a_user_is_announced_as_added_only_once() {
    let mut h = harness(TrackerSettings::default()).await;
    h.locations.set(vec![row(1, "police", 2, 0.0, 0.0, t0())]);
    let first = h.manager.refresh_at(t0()).await.unwrap();
    assert_eq!(first.added, vec![UserId(1)]);
    next_event(&mut h.events).await.unwrap();

    let moved_at = t0() + Duration::seconds(3);
    h.locations.set(vec![row(1, "police", 2, 3.0, 4.0, moved_at)]);
    let second = h.manager.refresh_at(moved_at).await.unwrap();
    assert!(second.added.is_empty());
    assert_eq!(second.updated, 1);
    match next_event(&mut h.events).await {
        Some(LivemapEvent::UserMarkers(event)) => {
            assert!(event.added.is_empty());
            assert_eq!(event.updated, 1);
        }
        other => panic!("expected update event, got {other:?}"),
    }
}

#[tokio::test]
async fn a_queried_user_is_kept_even_when_past_grace() {
    let h = harness(TrackerSettings::default()).await;
    h.locations.set(vec![row(1, "police", 2, 0.0, 0.0, t0())]);
    h.manager.refresh_at(t0()).await.unwrap();

    let report = h.manager.refresh_at(t0() + Duration::minutes(10)).await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.unchanged, 1);
    assert!(h.manager.stores().by_id.contains("1"));
}

#[tokio::test]
async fn location_override_decides_the_job_index_key() {
    let h = harness(TrackerSettings::default()).await;
    let mut overridden = row(1, "police", 2, 0.0, 0.0, t0());
    overridden.override_job = Some("ambulance".to_string());
    overridden.override_grade = Some(1);
    h.locations.set(vec![overridden]);

    h.manager.refresh_at(t0()).await.unwrap();
    let stores = h.manager.stores();
    assert!(stores.by_job.contains("ambulance.1.1"));
    assert!(!stores.by_job.contains("police.2.1"));
    assert_eq!(stores.by_id.get("1").unwrap().job, "ambulance");
}
