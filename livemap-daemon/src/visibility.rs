//! Per-caller visibility scope.

use livemap_core::types::{id_key, UserInfo, UserMarker};
use livemap_tracker::TrackerStores;

use crate::access::{JobGrades, Permissions};

/// What one connected caller may see, resolved once when the stream opens.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub user: UserInfo,
    pub superuser: bool,
    pub marker_jobs: Vec<String>,
    pub user_grades: JobGrades,
}

impl Scope {
    pub fn resolve(permissions: &dyn Permissions, user: UserInfo) -> Self {
        Self {
            superuser: permissions.is_superuser(&user),
            marker_jobs: permissions.marker_jobs(&user),
            user_grades: permissions.user_job_grades(&user),
            user,
        }
    }

    pub fn user_jobs(&self) -> Vec<String> {
        self.user_grades.jobs().map(str::to_string).collect()
    }

    pub fn sees_markers(&self) -> bool {
        self.superuser || !self.marker_jobs.is_empty()
    }

    pub fn sees_users(&self) -> bool {
        self.superuser || !self.user_grades.is_empty()
    }

    pub fn sees_marker_job(&self, job: &str) -> bool {
        self.superuser || self.marker_jobs.iter().any(|j| j == job)
    }

    /// Job filter for marker queries; empty selects every job.
    pub fn marker_query_jobs(&self) -> Vec<String> {
        if self.superuser {
            Vec::new()
        } else {
            self.marker_jobs.clone()
        }
    }

    pub fn sees_user(&self, marker: &UserMarker) -> bool {
        if marker.user_id == self.user.user_id {
            return true;
        }
        if marker.hidden {
            return false;
        }
        self.superuser || self.user_grades.allows(&marker.job, marker.job_grade)
    }

    /// The caller's own tracked marker, hidden or not.
    pub fn own_marker(&self, stores: &TrackerStores) -> Option<UserMarker> {
        stores.by_id.get(&id_key(self.user.user_id))
    }

    /// Every user the caller may see right now, and whether the caller is
    /// on duty. Off-duty callers only see themselves when `require_on_duty`
    /// is set, unless they are superusers.
    pub fn visible_users(
        &self,
        stores: &TrackerStores,
        require_on_duty: bool,
    ) -> (Vec<UserMarker>, bool) {
        let own = self.own_marker(stores);
        let on_duty = own.as_ref().is_some_and(UserMarker::on_duty);

        if !on_duty && require_on_duty && !self.superuser {
            return (own.into_iter().collect(), false);
        }

        let mut users: Vec<UserMarker> = if self.superuser {
            stores.by_id.list("")
        } else {
            self.user_grades
                .jobs()
                .flat_map(|job| stores.users_of_job(job))
                .collect()
        };
        users.retain(|m| m.user_id != self.user.user_id && self.sees_user(m));
        users.extend(own);
        users.sort_by_key(|m| m.user_id);
        (users, on_duty)
    }
}
