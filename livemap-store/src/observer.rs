//! Mutation hooks.
//!
//! Observers run synchronously inside every mutation, while the store's write
//! lock is held, in registration order. An observer must never call back into
//! the store that invokes it; driving a *different* store is the intended use.

use crate::error::HookError;

pub trait StoreObserver<T>: Send + Sync {
    /// Short name used in hook error reports and logs.
    fn name(&self) -> &'static str;

    /// Called before `new` is stored under `key`. Returning `Some(value)`
    /// replaces what gets stored; `None` keeps `new` as is.
    fn on_update(&self, key: &str, old: Option<&T>, new: &T) -> Result<Option<T>, HookError> {
        let _ = (key, old, new);
        Ok(None)
    }

    /// Called after `key` was removed; `old` is the removed value.
    fn on_delete(&self, key: &str, old: &T) -> Result<(), HookError> {
        let _ = (key, old);
        Ok(())
    }
}
