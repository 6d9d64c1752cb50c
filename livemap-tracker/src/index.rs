//! The tracker's buckets and the hook that keeps the job index in step.
//!
//! ```text
//! user_markers_by_id   "<id>"              canonical
//! user_markers_by_job  "<job>.<grade>.<id>" maintained only by JobIndex
//! user_mappings        "<id>"              unit assignment cache
//! ```

use std::sync::Arc;

use livemap_core::types::{job_prefix, UserMapping, UserMarker};
use livemap_store::{HookError, Store, StoreObserver};

pub const USER_MARKERS_BY_ID: &str = "user_markers_by_id";
pub const USER_MARKERS_BY_JOB: &str = "user_markers_by_job";
pub const USER_MAPPINGS: &str = "user_mappings";

/// Mirrors the canonical bucket into the job-keyed bucket.
pub struct JobIndex {
    by_job: Arc<Store<UserMarker>>,
}

impl JobIndex {
    pub fn new(by_job: Arc<Store<UserMarker>>) -> Self {
        Self { by_job }
    }

    fn remove(&self, key: &str) -> Result<(), HookError> {
        match self.by_job.delete(key) {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(HookError::new("job_index", err)),
        }
    }
}

impl StoreObserver<UserMarker> for JobIndex {
    fn name(&self) -> &'static str {
        "job_index"
    }

    fn on_update(
        &self,
        _key: &str,
        old: Option<&UserMarker>,
        new: &UserMarker,
    ) -> Result<Option<UserMarker>, HookError> {
        let new_key = new.job_key();
        if let Some(old) = old {
            let old_key = old.job_key();
            if old_key != new_key {
                self.remove(&old_key)?;
            }
        }
        self.by_job
            .put(new_key, new.clone())
            .map_err(|e| HookError::new("job_index", e))?;
        Ok(None)
    }

    fn on_delete(&self, _key: &str, old: &UserMarker) -> Result<(), HookError> {
        self.remove(&old.job_key())
    }
}

/// The three buckets the tracker writes and the stream handlers read.
#[derive(Debug, Clone)]
pub struct TrackerStores {
    pub by_id: Arc<Store<UserMarker>>,
    pub by_job: Arc<Store<UserMarker>>,
    pub mappings: Arc<Store<UserMapping>>,
}

impl TrackerStores {
    pub fn new() -> Self {
        let by_job = Arc::new(Store::new(USER_MARKERS_BY_JOB));
        let index: Arc<dyn StoreObserver<UserMarker>> = Arc::new(JobIndex::new(by_job.clone()));
        Self {
            by_id: Arc::new(Store::with_observers(USER_MARKERS_BY_ID, vec![index])),
            by_job,
            mappings: Arc::new(Store::new(USER_MAPPINGS)),
        }
    }

    /// Every tracked user of `job`, hidden ones included.
    pub fn users_of_job(&self, job: &str) -> Vec<UserMarker> {
        self.by_job.list(&job_prefix(job))
    }
}

impl Default for TrackerStores {
    fn default() -> Self {
        Self::new()
    }
}
