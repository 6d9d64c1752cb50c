//! Generic replicated key-value bucket.
//!
//! Keys are dot-composed strings so that prefix listing is a range scan over
//! the ordered map. All mutation goes through one write lock, the observer
//! pipeline and the change feed, in that order, so watchers see mutations in
//! the order they were applied.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;

use crate::error::{HookError, StoreError};
use crate::observer::StoreObserver;
use crate::watch::{StoreEvent, Watcher};

/// Change-feed depth per store. Slower watchers lag and skip.
pub const DEFAULT_WATCH_CAPACITY: usize = 1024;

pub struct Store<T> {
    bucket: String,
    entries: RwLock<BTreeMap<String, T>>,
    observers: Vec<Arc<dyn StoreObserver<T>>>,
    events: broadcast::Sender<StoreEvent<T>>,
}

impl<T> std::fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("bucket", &self.bucket)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Store<T> {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self::with_observers(bucket, Vec::new())
    }

    pub fn with_observers(
        bucket: impl Into<String>,
        observers: Vec<Arc<dyn StoreObserver<T>>>,
    ) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_WATCH_CAPACITY);
        Self {
            bucket: bucket.into(),
            entries: RwLock::new(BTreeMap::new()),
            observers,
            events,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Values whose key starts with `prefix`, in key order. `""` lists everything.
    pub fn list(&self, prefix: &str) -> Vec<T> {
        let entries = self.read();
        scan(&entries, prefix).map(|(_, v)| v.clone()).collect()
    }

    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let entries = self.read();
        scan(&entries, prefix).map(|(k, _)| k.clone()).collect()
    }

    pub fn entries(&self, prefix: &str) -> Vec<(String, T)> {
        let entries = self.read();
        scan(&entries, prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Store `value` under `key`.
    ///
    /// `Err(StoreError::Hooks)` means the value *was* stored but at least one
    /// observer failed.
    pub fn put(&self, key: impl Into<String>, value: T) -> Result<(), StoreError> {
        let key = key.into();
        let mut entries = self.write();
        self.apply_put(&mut entries, key, value).map(|_| ())
    }

    /// Read-modify-write under the store lock.
    ///
    /// `f` sees the current value and returns the replacement, or `None` to
    /// leave the entry untouched (no observers run, no event is emitted).
    /// Returns the stored value when a mutation happened.
    pub fn compute_update<F>(&self, key: &str, f: F) -> Result<Option<T>, StoreError>
    where
        F: FnOnce(Option<&T>) -> Option<T>,
    {
        let mut entries = self.write();
        let Some(next) = f(entries.get(key)) else {
            return Ok(None);
        };
        self.apply_put(&mut entries, key.to_string(), next).map(Some)
    }

    /// Remove `key`, returning the removed value.
    pub fn delete(&self, key: &str) -> Result<T, StoreError> {
        let mut entries = self.write();
        let Some(old) = entries.remove(key) else {
            return Err(StoreError::NotFound {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            });
        };

        let errors: Vec<HookError> = self
            .observers
            .iter()
            .filter_map(|observer| observer.on_delete(key, &old).err())
            .collect();

        let _ = self.events.send(StoreEvent::Delete {
            key: key.to_string(),
            old: old.clone(),
        });
        drop(entries);

        self.finish(key, errors).map(|_| old)
    }

    /// Replays `entries` through the regular put pipeline so dependent
    /// indices are rebuilt. Every entry is applied; hook errors are
    /// aggregated into one report.
    pub fn restore(
        &self,
        entries: impl IntoIterator<Item = (String, T)>,
    ) -> Result<usize, StoreError> {
        let mut applied = 0usize;
        let mut failures = Vec::new();
        for (key, value) in entries {
            applied += 1;
            if let Err(StoreError::Hooks { errors, .. }) = self.put(key, value) {
                failures.extend(errors);
            }
        }
        self.finish("*", failures).map(|_| applied)
    }

    /// Feed of every mutation applied after this call.
    pub fn watch(&self) -> Watcher<T> {
        Watcher::new(self.bucket.clone(), None, self.events.subscribe())
    }

    /// Feed narrowed to one key.
    pub fn watch_key(&self, key: impl Into<String>) -> Watcher<T> {
        Watcher::new(self.bucket.clone(), Some(key.into()), self.events.subscribe())
    }

    fn apply_put(
        &self,
        entries: &mut BTreeMap<String, T>,
        key: String,
        value: T,
    ) -> Result<T, StoreError> {
        let mut value = value;
        let mut errors = Vec::new();
        {
            let old = entries.get(&key);
            for observer in &self.observers {
                match observer.on_update(&key, old, &value) {
                    Ok(Some(replacement)) => value = replacement,
                    Ok(None) => {}
                    Err(err) => errors.push(err),
                }
            }
        }

        entries.insert(key.clone(), value.clone());
        let _ = self.events.send(StoreEvent::Put {
            key: key.clone(),
            value: value.clone(),
        });

        self.finish(&key, errors).map(|_| value)
    }

    fn finish(&self, key: &str, errors: Vec<HookError>) -> Result<(), StoreError> {
        if errors.is_empty() {
            return Ok(());
        }
        for err in &errors {
            tracing::warn!(bucket = %self.bucket, key, error = %err, "store hook failed");
        }
        Err(StoreError::Hooks {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            errors,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, T>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, T>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn scan<'a, T>(
    entries: &'a BTreeMap<String, T>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a T)> + 'a {
    entries
        .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(prefix))
}
