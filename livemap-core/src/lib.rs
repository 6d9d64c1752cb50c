//! livemap core library: domain types, events, configuration, storage contracts.
//!
//! - [`types`]: newtypes, user markers, map markers, caller identity
//! - [`events`]: broker events and topic names
//! - [`config`]: `config.yaml` load / save
//! - [`source`]: authoritative-storage collaborator traits
//! - [`error`]: [`ConfigError`], [`SourceError`]

pub mod config;
pub mod error;
pub mod events;
pub mod source;
pub mod types;

pub use config::{AccessLevel, AccessRule, LivemapConfig};
pub use error::{ConfigError, SourceError};
pub use events::{LivemapEvent, Topic, TopicKind, UserMarkersEvent};
pub use source::{LocationRecord, LocationSource, MarkerRepository, UnitDirectory};
pub use types::{
    Marker, MarkerCreator, MarkerData, MarkerId, UnitId, UserId, UserInfo, UserMapping,
    UserMarker,
};
