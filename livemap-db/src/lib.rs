//! livemap-db: SQLite authoritative storage.
//!
//! [`Database`] implements every storage collaborator trait from
//! `livemap_core::source` over one connection. Calls are blocking; async
//! callers go through `spawn_blocking`.

pub mod database;
pub mod error;
pub mod migrations;
mod open;

pub use database::{Database, LocationUpdate, UserProfile};
pub use error::{DbError, DbResult};
pub use open::{open_db, open_db_in_memory};
