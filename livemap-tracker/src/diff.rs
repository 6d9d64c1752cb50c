//! Reconciliation planning.
//!
//! [`plan`] is pure: it compares the canonical bucket with one cycle's
//! enriched query result and decides what to write and what to remove.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};

use livemap_core::types::{UserId, UserMarker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Updated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upsert {
    pub marker: UserMarker,
    pub change: Change,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CyclePlan {
    pub upserts: Vec<Upsert>,
    pub removals: Vec<UserId>,
    /// Incoming records identical to, or older than, what is stored.
    pub unchanged: usize,
    /// Absent from the query but still inside the grace window.
    pub retained: usize,
}

/// Plan one cycle.
///
/// `seen` is every user id the query returned, including those whose
/// enrichment failed; none of them is removed this cycle.
pub fn plan(
    current: &[UserMarker],
    incoming: Vec<UserMarker>,
    seen: &BTreeSet<UserId>,
    now: DateTime<Utc>,
    grace: Duration,
) -> CyclePlan {
    let current: BTreeMap<UserId, &UserMarker> =
        current.iter().map(|m| (m.user_id, m)).collect();

    // A user can show up more than once; the newest row wins.
    let mut latest: BTreeMap<UserId, UserMarker> = BTreeMap::new();
    for marker in incoming {
        match latest.get(&marker.user_id) {
            Some(existing) if existing.updated_at >= marker.updated_at => {}
            _ => {
                latest.insert(marker.user_id, marker);
            }
        }
    }

    let mut out = CyclePlan::default();
    for (user_id, marker) in latest {
        match current.get(&user_id) {
            None => out.upserts.push(Upsert {
                marker,
                change: Change::Added,
            }),
            Some(stored) if is_current(stored, &marker) => out.unchanged += 1,
            Some(_) => out.upserts.push(Upsert {
                marker,
                change: Change::Updated,
            }),
        }
    }

    for (user_id, stored) in current {
        if seen.contains(&user_id) {
            continue;
        }
        if now.signed_duration_since(stored.updated_at) > grace {
            out.removals.push(user_id);
        } else {
            out.retained += 1;
        }
    }

    out
}

/// Whether `stored` already reflects `incoming`: identical, or newer.
pub fn is_current(stored: &UserMarker, incoming: &UserMarker) -> bool {
    stored == incoming || stored.updated_at > incoming.updated_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn marker(id: i32, x: f64, updated: i64) -> UserMarker {
        UserMarker {
            user_id: UserId(id),
            x,
            y: 0.0,
            job: "ambulance".into(),
            job_label: None,
            job_grade: 3,
            job_grade_label: None,
            name: String::new(),
            unit_id: None,
            color: "#fff".into(),
            postal: None,
            hidden: false,
            updated_at: at(updated),
        }
    }

    fn seen(ids: &[i32]) -> BTreeSet<UserId> {
        ids.iter().copied().map(UserId).collect()
    }

    #[test]
    fn new_users_are_added() {
        let out = plan(&[], vec![marker(1, 1.0, 0)], &seen(&[1]), at(0), Duration::seconds(30));
        assert_eq!(out.upserts.len(), 1);
        assert_eq!(out.upserts[0].change, Change::Added);
        assert!(out.removals.is_empty());
    }

    #[test]
    fn identical_record_is_unchanged() {
        let stored = marker(1, 1.0, 0);
        let out = plan(
            &[stored.clone()],
            vec![stored],
            &seen(&[1]),
            at(5),
            Duration::seconds(30),
        );
        assert!(out.upserts.is_empty());
        assert_eq!(out.unchanged, 1);
    }

    #[test]
    fn older_record_never_overwrites_newer_stored_value() {
        let out = plan(
            &[marker(1, 5.0, 10)],
            vec![marker(1, 1.0, 5)],
            &seen(&[1]),
            at(10),
            Duration::seconds(30),
        );
        assert!(out.upserts.is_empty());
        assert_eq!(out.unchanged, 1);
    }

    #[test]
    fn moved_user_is_updated() {
        let out = plan(
            &[marker(1, 1.0, 0)],
            vec![marker(1, 5.0, 2)],
            &seen(&[1]),
            at(2),
            Duration::seconds(30),
        );
        assert_eq!(out.upserts[0].change, Change::Updated);
        assert_eq!(out.upserts[0].marker.x, 5.0);
    }

    #[rstest]
    #[case::inside_grace(20, 0, 1)]
    #[case::at_grace_edge(30, 0, 1)]
    #[case::past_grace(31, 1, 0)]
    fn absent_users_respect_grace(
        #[case] now: i64,
        #[case] removed: usize,
        #[case] retained: usize,
    ) {
        let out = plan(
            &[marker(1, 1.0, 0)],
            vec![],
            &seen(&[]),
            at(now),
            Duration::seconds(30),
        );
        assert_eq!(out.removals.len(), removed);
        assert_eq!(out.retained, retained);
    }

    #[test]
    fn seen_user_is_never_removed_even_without_a_marker() {
        // Enrichment failed for user 1 this cycle.
        let out = plan(
            &[marker(1, 1.0, 0)],
            vec![],
            &seen(&[1]),
            at(3_600),
            Duration::seconds(30),
        );
        assert!(out.removals.is_empty());
    }

    #[test]
    fn added_and_removed_are_disjoint() {
        let current = vec![marker(1, 0.0, 0), marker(2, 0.0, 0)];
        let incoming = vec![marker(2, 1.0, 100), marker(3, 0.0, 100)];
        let out = plan(&current, incoming, &seen(&[2, 3]), at(100), Duration::seconds(30));

        let added: BTreeSet<_> = out
            .upserts
            .iter()
            .filter(|u| u.change == Change::Added)
            .map(|u| u.marker.user_id)
            .collect();
        let removed: BTreeSet<_> = out.removals.iter().copied().collect();
        assert!(added.is_disjoint(&removed));
        assert_eq!(added, seen(&[3]));
        assert_eq!(removed, seen(&[1]));
    }

    #[test]
    fn duplicate_rows_keep_the_newest() {
        let out = plan(
            &[],
            vec![marker(1, 1.0, 5), marker(1, 9.0, 7), marker(1, 4.0, 6)],
            &seen(&[1]),
            at(7),
            Duration::seconds(30),
        );
        assert_eq!(out.upserts.len(), 1);
        assert_eq!(out.upserts[0].marker.x, 9.0);
    }
}
