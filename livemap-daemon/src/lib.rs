//! livemap daemon: streaming service, marker commands and the socket runtime.
//!
//! - [`stream`]: per-client live streams
//! - [`commands`]: marker create / update / delete
//! - [`access`] / [`visibility`]: who sees what
//! - [`chunk`]: bounded delta parts
//! - [`protocol`]: NDJSON wire types and the blocking client

pub mod access;
pub mod chunk;
pub mod commands;
mod error;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod server;
pub mod stream;
pub mod visibility;

pub use access::{can_edit, ConfigPermissions, JobGrades, Permissions};
pub use commands::{CommandService, MarkerInput};
pub use error::{CommandError, DaemonError, ErrorCode, StreamError};
pub use protocol::{
    open_stream, request_create_or_update_marker, request_delete_marker, request_status,
    request_stop, send_request, DaemonRequest, DaemonResponse, MarkersDelta, StreamReader,
    StreamResponse, UsersDelta,
};
pub use runtime::{run, start_blocking};
pub use server::ServerState;
pub use stream::{StreamService, StreamSettings};
pub use visibility::Scope;
