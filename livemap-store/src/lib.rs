//! livemap replicated store: watchable key-value buckets with mutation hooks.
//!
//! - [`store`]: [`Store`], the bucket itself
//! - [`observer`]: [`StoreObserver`] hooks that keep dependent views in step
//! - [`watch`]: change feeds ([`Watcher`], [`StoreEvent`])
//! - [`snapshot`]: bucket snapshots for warm restarts
//! - [`error`]: [`StoreError`], [`HookError`]

pub mod error;
pub mod observer;
pub mod snapshot;
pub mod store;
pub mod watch;

pub use error::{HookError, StoreError};
pub use observer::StoreObserver;
pub use store::Store;
pub use watch::{StoreEvent, Watcher};
