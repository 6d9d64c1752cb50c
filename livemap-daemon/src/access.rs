//! Permission resolution.
//!
//! [`Permissions`] is the seam to the policy engine. [`ConfigPermissions`]
//! answers from the `access` rules of `config.yaml`: every rule whose `job`
//! matches the caller's job and whose `min_grade` the caller meets applies,
//! and matching rules are merged (job lists unioned, grade limits and access
//! levels maxed).

use std::collections::{BTreeMap, BTreeSet};

use livemap_core::config::{AccessLevel, AccessRule, LivemapConfig};
use livemap_core::types::{MarkerCreator, UserId, UserInfo};

/// Job → highest visible grade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobGrades(BTreeMap<String, i32>);

impl JobGrades {
    pub fn new(grades: BTreeMap<String, i32>) -> Self {
        Self(grades)
    }

    pub fn allows(&self, job: &str, grade: i32) -> bool {
        self.0.get(job).is_some_and(|limit| grade <= *limit)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, i32> {
        &self.0
    }
}

pub trait Permissions: Send + Sync {
    fn is_superuser(&self, user: &UserInfo) -> bool;

    /// Jobs whose markers `user` sees and may edit.
    fn marker_jobs(&self, user: &UserInfo) -> Vec<String>;

    fn user_job_grades(&self, user: &UserInfo) -> JobGrades;

    fn marker_access(&self, user: &UserInfo) -> AccessLevel;
}

#[derive(Debug, Clone, Default)]
pub struct ConfigPermissions {
    rules: Vec<AccessRule>,
    superusers: BTreeSet<UserId>,
}

impl ConfigPermissions {
    pub fn new(rules: Vec<AccessRule>, superusers: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            rules,
            superusers: superusers.into_iter().collect(),
        }
    }

    pub fn from_config(config: &LivemapConfig) -> Self {
        Self::new(config.access.clone(), config.superusers.iter().copied())
    }

    fn matching<'a>(&'a self, user: &'a UserInfo) -> impl Iterator<Item = &'a AccessRule> + 'a {
        self.rules
            .iter()
            .filter(move |rule| rule.job == user.job && user.job_grade >= rule.min_grade)
    }
}

impl Permissions for ConfigPermissions {
    fn is_superuser(&self, user: &UserInfo) -> bool {
        user.superuser || self.superusers.contains(&user.user_id)
    }

    fn marker_jobs(&self, user: &UserInfo) -> Vec<String> {
        let jobs: BTreeSet<&String> = self
            .matching(user)
            .flat_map(|rule| rule.marker_jobs.iter())
            .collect();
        jobs.into_iter().cloned().collect()
    }

    fn user_job_grades(&self, user: &UserInfo) -> JobGrades {
        let mut grades = BTreeMap::new();
        for (job, limit) in self.matching(user).flat_map(|rule| rule.user_jobs.iter()) {
            grades
                .entry(job.clone())
                .and_modify(|current: &mut i32| *current = (*current).max(*limit))
                .or_insert(*limit);
        }
        JobGrades(grades)
    }

    fn marker_access(&self, user: &UserInfo) -> AccessLevel {
        self.matching(user)
            .map(|rule| rule.marker_access)
            .max()
            .unwrap_or_default()
    }
}

/// Whether `caller` holding `level` may change a marker made by `creator`.
/// Markers without a creator are only editable with [`AccessLevel::Any`].
pub fn can_edit(level: AccessLevel, caller: &UserInfo, creator: Option<&MarkerCreator>) -> bool {
    if level == AccessLevel::Any {
        return true;
    }
    let Some(creator) = creator else {
        return false;
    };
    if creator.user_id == caller.user_id {
        return true;
    }
    let same_job = creator.job == caller.job;
    match level {
        AccessLevel::Own => false,
        AccessLevel::LowerRank => same_job && creator.job_grade < caller.job_grade,
        AccessLevel::SameRank => same_job && creator.job_grade <= caller.job_grade,
        AccessLevel::Any => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn user(id: i32, job: &str, grade: i32) -> UserInfo {
        UserInfo {
            user_id: UserId(id),
            job: job.to_string(),
            job_grade: grade,
            superuser: false,
        }
    }

    fn rule(job: &str, min_grade: i32, markers: &[&str], users: &[(&str, i32)], access: AccessLevel) -> AccessRule {
        AccessRule {
            job: job.to_string(),
            min_grade,
            marker_jobs: markers.iter().map(|s| s.to_string()).collect(),
            user_jobs: users.iter().map(|(j, g)| (j.to_string(), *g)).collect(),
            marker_access: access,
        }
    }

    fn permissions() -> ConfigPermissions {
        ConfigPermissions::new(
            vec![
                rule("police", 0, &["police"], &[("police", 2)], AccessLevel::Own),
                rule(
                    "police",
                    3,
                    &["police", "ambulance"],
                    &[("police", 10), ("ambulance", 1)],
                    AccessLevel::LowerRank,
                ),
            ],
            [UserId(99)],
        )
    }

    #[test]
    fn rules_merge_by_grade() {
        let perms = permissions();

        let cadet = user(1, "police", 1);
        assert_eq!(perms.marker_jobs(&cadet), vec!["police"]);
        assert!(perms.user_job_grades(&cadet).allows("police", 2));
        assert!(!perms.user_job_grades(&cadet).allows("police", 3));
        assert_eq!(perms.marker_access(&cadet), AccessLevel::Own);

        let chief = user(2, "police", 5);
        assert_eq!(perms.marker_jobs(&chief), vec!["ambulance", "police"]);
        assert!(perms.user_job_grades(&chief).allows("police", 10));
        assert!(perms.user_job_grades(&chief).allows("ambulance", 1));
        assert_eq!(perms.marker_access(&chief), AccessLevel::LowerRank);
    }

    #[test]
    fn unknown_job_gets_nothing() {
        let perms = permissions();
        let taxi = user(3, "taxi", 4);
        assert!(perms.marker_jobs(&taxi).is_empty());
        assert!(perms.user_job_grades(&taxi).is_empty());
        assert_eq!(perms.marker_access(&taxi), AccessLevel::Own);
    }

    #[test]
    fn superusers_from_config_or_identity() {
        let perms = permissions();
        assert!(perms.is_superuser(&user(99, "taxi", 0)));
        let mut flagged = user(5, "taxi", 0);
        flagged.superuser = true;
        assert!(perms.is_superuser(&flagged));
        assert!(!perms.is_superuser(&user(5, "taxi", 0)));
    }

    #[rstest]
    #[case::own_self(AccessLevel::Own, 1, "police", 0, true)]
    #[case::own_other(AccessLevel::Own, 2, "police", 0, false)]
    #[case::lower_rank_lower(AccessLevel::LowerRank, 2, "police", 2, true)]
    #[case::lower_rank_same(AccessLevel::LowerRank, 2, "police", 3, false)]
    #[case::same_rank_same(AccessLevel::SameRank, 2, "police", 3, true)]
    #[case::same_rank_higher(AccessLevel::SameRank, 2, "police", 4, false)]
    #[case::other_job(AccessLevel::SameRank, 2, "ambulance", 0, false)]
    #[case::any(AccessLevel::Any, 2, "ambulance", 9, true)]
    fn edit_rights_relative_to_creator(
        #[case] level: AccessLevel,
        #[case] creator_id: i32,
        #[case] creator_job: &str,
        #[case] creator_grade: i32,
        #[case] allowed: bool,
    ) {
        let caller = user(1, "police", 3);
        let creator = MarkerCreator {
            user_id: UserId(creator_id),
            job: creator_job.to_string(),
            job_grade: creator_grade,
        };
        assert_eq!(can_edit(level, &caller, Some(&creator)), allowed);
    }

    #[test]
    fn creatorless_markers_need_any() {
        let caller = user(1, "police", 3);
        assert!(!can_edit(AccessLevel::SameRank, &caller, None));
        assert!(can_edit(AccessLevel::Any, &caller, None));
    }
}
