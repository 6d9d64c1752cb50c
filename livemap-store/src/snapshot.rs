//! Bucket snapshots: warm-start persistence for a [`Store`].
//!
//! One JSON document per bucket at `<dir>/<bucket>.json`. Writes use the
//! atomic `.tmp` + rename pattern so a crash mid-save never leaves a torn
//! file behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::store::Store;

/// On-disk bucket payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketFile<T> {
    pub bucket: String,
    pub saved_at: DateTime<Utc>,
    pub entries: BTreeMap<String, T>,
}

/// `<dir>/<bucket>.json`
pub fn bucket_path_at(dir: &Path, bucket: &str) -> PathBuf {
    dir.join(format!("{bucket}.json"))
}

/// Write every entry of `store` to its bucket file under `dir`.
///
/// Returns the number of entries written.
pub fn save_at<T>(dir: &Path, store: &Store<T>) -> Result<usize, StoreError>
where
    T: Clone + Send + Sync + Serialize + 'static,
{
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let file = BucketFile {
        bucket: store.bucket().to_string(),
        saved_at: Utc::now(),
        entries: store.entries("").into_iter().collect(),
    };
    let count = file.entries.len();

    let path = bucket_path_at(dir, store.bucket());
    let json = serde_json::to_string(&file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(count)
}

/// Read the bucket file for `bucket`. `None` if no snapshot exists yet.
pub fn read_at<T>(dir: &Path, bucket: &str) -> Result<Option<BucketFile<T>>, StoreError>
where
    T: DeserializeOwned,
{
    let path = bucket_path_at(dir, bucket);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let file: BucketFile<T> = serde_json::from_str(&contents)?;
    if file.bucket != bucket {
        return Err(StoreError::BucketMismatch {
            path,
            expected: bucket.to_string(),
            found: file.bucket,
        });
    }
    Ok(Some(file))
}

/// Load the snapshot for `store`'s bucket and replay it through the store's
/// observers. Returns the number of restored entries (0 without a snapshot).
pub fn load_at<T>(dir: &Path, store: &Store<T>) -> Result<usize, StoreError>
where
    T: Clone + Send + Sync + DeserializeOwned + 'static,
{
    match read_at::<T>(dir, store.bucket())? {
        Some(file) => {
            tracing::debug!(
                bucket = %file.bucket,
                saved_at = %file.saved_at,
                entries = file.entries.len(),
                "restoring bucket snapshot",
            );
            store.restore(file.entries)
        }
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_snapshot_restores_nothing() {
        let tmp = TempDir::new().unwrap();
        let store: Store<u32> = Store::new("numbers");
        assert_eq!(load_at(tmp.path(), &store).unwrap(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn save_then_load_into_fresh_store() {
        let tmp = TempDir::new().unwrap();
        let store: Store<u32> = Store::new("numbers");
        store.put("a", 1).unwrap();
        store.put("b", 2).unwrap();
        assert_eq!(save_at(tmp.path(), &store).unwrap(), 2);

        let fresh: Store<u32> = Store::new("numbers");
        assert_eq!(load_at(tmp.path(), &fresh).unwrap(), 2);
        assert_eq!(fresh.entries(""), store.entries(""));
    }

    #[test]
    fn tmp_file_cleaned_up_after_save() {
        let tmp = TempDir::new().unwrap();
        let store: Store<u32> = Store::new("numbers");
        save_at(tmp.path(), &store).unwrap();
        let tmp_path = bucket_path_at(tmp.path(), "numbers").with_extension("json.tmp");
        assert!(!tmp_path.exists());
    }

    #[test]
    fn snapshot_of_other_bucket_is_rejected() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            bucket_path_at(tmp.path(), "numbers"),
            r#"{"bucket":"letters","saved_at":"2024-01-01T00:00:00Z","entries":{}}"#,
        )
        .unwrap();

        let store: Store<u32> = Store::new("numbers");
        let err = load_at(tmp.path(), &store).unwrap_err();
        assert!(matches!(err, StoreError::BucketMismatch { .. }), "got: {err}");
    }
}
