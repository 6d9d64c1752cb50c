//! # livemap-tracker
//!
//! Periodic reconciliation of authoritative location rows into the
//! replicated user-marker buckets.
//!
//! Build a [`TrackerManager`] over a [`TrackerStores`] and call
//! [`TrackerManager::run`], or drive single cycles with
//! [`TrackerManager::refresh_once`].

pub mod diff;
pub mod enrich;
pub mod error;
pub mod index;
pub mod manager;
pub mod postal;

pub use error::{CycleErrors, TrackerError};
pub use index::{JobIndex, TrackerStores, USER_MAPPINGS, USER_MARKERS_BY_ID, USER_MARKERS_BY_JOB};
pub use manager::{CycleReport, TrackerManager, TrackerSettings};
pub use postal::{Postal, PostalLookup, Postals};
