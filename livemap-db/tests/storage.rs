use chrono::{DateTime, Duration, Utc};

use livemap_core::source::{LocationSource, MarkerRepository, UnitDirectory};
use livemap_core::types::{Marker, MarkerCreator, MarkerData, MarkerId, UnitId, UserId};
use livemap_core::SourceError;
use livemap_db::{Database, LocationUpdate, UserProfile};

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn profile(id: i32, job: &str, grade: i32) -> UserProfile {
    UserProfile {
        user_id: UserId(id),
        name: format!("User {id}"),
        job: job.to_string(),
        job_grade: grade,
        job_label: None,
        grade_label: None,
    }
}

fn location(id: i32, at: DateTime<Utc>) -> LocationUpdate {
    LocationUpdate {
        user_id: UserId(id),
        x: 1.0,
        y: 2.0,
        hidden: false,
        job: None,
        job_grade: None,
        color: None,
        updated_at: at,
    }
}

fn marker(job: &str) -> Marker {
    Marker {
        id: MarkerId(0),
        job: job.to_string(),
        x: 10.0,
        y: 20.0,
        name: "roadblock".to_string(),
        description: Some("north exit".to_string()),
        color: "#ff0000".to_string(),
        data: MarkerData::Circle {
            radius: 30.0,
            opacity: Some(0.5),
        },
        creator: Some(MarkerCreator {
            user_id: UserId(1),
            job: job.to_string(),
            job_grade: 2,
        }),
        created_at: t0(),
        updated_at: t0(),
        expires_at: None,
        deleted_at: None,
    }
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

#[test]
fn active_locations_respect_window_and_jobs() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_user(&profile(1, "police", 2)).unwrap();
    db.upsert_user(&profile(2, "ambulance", 1)).unwrap();
    db.upsert_user(&profile(3, "police", 0)).unwrap();
    db.record_location(&location(1, t0())).unwrap();
    db.record_location(&location(2, t0())).unwrap();
    db.record_location(&location(3, t0() - Duration::hours(5))).unwrap();

    let since = t0() - Duration::hours(4);
    let police = db.active_locations(&["police".to_string()], since).unwrap();
    assert_eq!(police.len(), 1);
    assert_eq!(police[0].user_id, UserId(1));
    assert_eq!(police[0].name.as_deref(), Some("User 1"));
    assert_eq!(police[0].updated_at, t0());

    let all = db.active_locations(&[], since).unwrap();
    assert_eq!(all.len(), 2);
}

#[test]
fn override_job_is_used_for_filtering_and_reported() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_user(&profile(1, "unemployed", 0)).unwrap();
    db.record_location(&LocationUpdate {
        job: Some("ambulance".to_string()),
        job_grade: Some(3),
        ..location(1, t0())
    })
    .unwrap();

    let rows = db
        .active_locations(&["ambulance".to_string()], t0() - Duration::hours(1))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].effective_job(), "ambulance");
    assert_eq!(rows[0].effective_grade(), 3);
    assert_eq!(rows[0].profile_job, "unemployed");
}

#[test]
fn removing_a_location_drops_it_from_the_query() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_user(&profile(1, "police", 0)).unwrap();
    db.record_location(&location(1, t0())).unwrap();
    assert!(db.remove_location(UserId(1)).unwrap());
    assert!(!db.remove_location(UserId(1)).unwrap());
    assert!(db.active_locations(&[], t0() - Duration::hours(1)).unwrap().is_empty());
}

#[test]
fn unit_assignments_can_be_set_and_cleared() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(db.unit_for_user(UserId(1)).unwrap(), None);
    db.set_unit(UserId(1), Some(UnitId(4)), t0()).unwrap();
    assert_eq!(db.unit_for_user(UserId(1)).unwrap(), Some(UnitId(4)));
    db.set_unit(UserId(1), None, t0()).unwrap();
    assert_eq!(db.unit_for_user(UserId(1)).unwrap(), None);
}

#[test]
fn batched_unit_lookup_covers_every_requested_user() {
    let db = Database::open_in_memory().unwrap();
    db.set_unit(UserId(1), Some(UnitId(4)), t0()).unwrap();
    db.set_unit(UserId(3), Some(UnitId(9)), t0()).unwrap();

    let units = db.units_for_users(&[UserId(1), UserId(2)]).unwrap();
    assert_eq!(units.len(), 2);
    assert_eq!(units[&UserId(1)], Some(UnitId(4)));
    assert_eq!(units[&UserId(2)], None);
    assert!(db.units_for_users(&[]).unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Markers
// ---------------------------------------------------------------------------

#[test]
fn create_assigns_ids_and_keeps_payload() {
    let db = Database::open_in_memory().unwrap();
    let first = db.create_marker(&marker("police")).unwrap();
    let second = db.create_marker(&marker("police")).unwrap();
    assert_ne!(first.id, second.id);

    let loaded = db.get_marker(first.id).unwrap().unwrap();
    assert_eq!(loaded, first);
    assert_eq!(loaded.creator.as_ref().map(|c| c.job_grade), Some(2));
}

#[test]
fn update_of_unknown_marker_is_not_found() {
    let db = Database::open_in_memory().unwrap();
    let mut m = marker("police");
    m.id = MarkerId(42);
    let err = db.update_marker(&m).unwrap_err();
    assert!(matches!(err, SourceError::NotFound { entity: "marker", .. }), "got: {err}");
}

#[test]
fn update_rewrites_mutable_fields() {
    let db = Database::open_in_memory().unwrap();
    let mut m = db.create_marker(&marker("police")).unwrap();
    m.name = "checkpoint".to_string();
    m.data = MarkerData::Icon {
        icon: "flag".to_string(),
    };
    m.updated_at = t0() + Duration::minutes(1);

    let updated = db.update_marker(&m).unwrap();
    assert_eq!(updated.name, "checkpoint");
    assert_eq!(updated.data.kind(), "icon");
    assert_eq!(updated.created_at, t0());
}

#[test]
fn listing_hides_deleted_and_long_expired_markers() {
    let db = Database::open_in_memory().unwrap();
    let live = db.create_marker(&marker("police")).unwrap();
    let recently_expired = db
        .create_marker(&Marker {
            expires_at: Some(t0() - Duration::minutes(10)),
            ..marker("police")
        })
        .unwrap();
    db.create_marker(&Marker {
        expires_at: Some(t0() - Duration::hours(3)),
        ..marker("police")
    })
    .unwrap();
    let deleted = db.create_marker(&marker("police")).unwrap();
    db.soft_delete_marker(deleted.id, t0()).unwrap();
    db.create_marker(&marker("ambulance")).unwrap();

    let listed = db
        .list_markers(&["police".to_string()], t0() - Duration::hours(1))
        .unwrap();
    let ids: Vec<_> = listed.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![live.id, recently_expired.id]);
}

#[test]
fn soft_delete_is_idempotent() {
    let db = Database::open_in_memory().unwrap();
    let m = db.create_marker(&marker("police")).unwrap();

    let first = db.soft_delete_marker(m.id, t0()).unwrap().unwrap();
    let second = db
        .soft_delete_marker(m.id, t0() + Duration::minutes(5))
        .unwrap()
        .unwrap();
    assert_eq!(first.deleted_at, Some(t0()));
    assert_eq!(second.deleted_at, Some(t0()));

    assert!(db.soft_delete_marker(MarkerId(999), t0()).unwrap().is_none());
}
