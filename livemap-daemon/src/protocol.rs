//! NDJSON socket protocol.
//!
//! Every request is one JSON line tagged by `cmd`. Every reply is one
//! [`DaemonResponse`] line, except `stream`, which keeps the connection open
//! and writes one `{"ok":true,"data":<StreamResponse>}` line per message
//! until the stream ends (a final `ok: false` line carries the reason).

use std::io::{BufRead, BufReader, Lines, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use livemap_core::types::{Marker, MarkerId, UserInfo, UserMarker};

use crate::commands::MarkerInput;
use crate::error::{io_err, DaemonError, ErrorCode};
use crate::paths::socket_path;

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    Stream { user: UserInfo },
    CreateOrUpdateMarker { user: UserInfo, marker: MarkerInput },
    DeleteMarker { user: UserInfo, id: MarkerId },
    Status,
    Stop,
}

impl DaemonRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DaemonRequest::Stream { .. } => "stream",
            DaemonRequest::CreateOrUpdateMarker { .. } => "create_or_update_marker",
            DaemonRequest::DeleteMarker { .. } => "delete_marker",
            DaemonRequest::Status => "status",
            DaemonRequest::Stop => "stop",
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            code: Some(code.as_str().to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream messages
// ---------------------------------------------------------------------------

/// One message of a live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamResponse {
    /// Sent once, first: what the caller is allowed to see.
    Jobs {
        markers: Vec<String>,
        users: Vec<String>,
    },
    Markers(MarkersDelta),
    Users(UsersDelta),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkersDelta {
    pub updated: Vec<Marker>,
    pub deleted: Vec<MarkerId>,
    pub part: u32,
    pub partial: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsersDelta {
    pub updated: Vec<UserMarker>,
    pub deleted: Vec<livemap_core::UserId>,
    pub part: u32,
    pub partial: bool,
    /// Drop every user the client holds before applying `updated`.
    #[serde(default)]
    pub clear: bool,
    pub on_duty: bool,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let (socket, stream) = connect(home, request)?;
    let mut lines = BufReader::new(stream).lines();
    read_response(&socket, &mut lines)?.ok_or_else(|| {
        DaemonError::Protocol("daemon closed connection before responding".to_string())
    })
}

pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &DaemonRequest::Status) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::Stop)?;
    response_into_data(response).map(|_| ())
}

pub fn request_create_or_update_marker(
    home: &Path,
    user: UserInfo,
    marker: MarkerInput,
) -> Result<Marker, DaemonError> {
    let response = send_request(home, &DaemonRequest::CreateOrUpdateMarker { user, marker })?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

pub fn request_delete_marker(
    home: &Path,
    user: UserInfo,
    id: MarkerId,
) -> Result<Marker, DaemonError> {
    let response = send_request(home, &DaemonRequest::DeleteMarker { user, id })?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

/// Open a live stream. The iterator ends when the daemon closes the
/// connection; a terminal error line is yielded as `Err`.
pub fn open_stream(home: &Path, user: UserInfo) -> Result<StreamReader, DaemonError> {
    let (socket, stream) = connect(home, &DaemonRequest::Stream { user })?;
    Ok(StreamReader {
        socket,
        lines: BufReader::new(stream).lines(),
        done: false,
    })
}

pub struct StreamReader {
    socket: PathBuf,
    lines: Lines<BufReader<UnixStream>>,
    done: bool,
}

impl Iterator for StreamReader {
    type Item = Result<StreamResponse, DaemonError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match read_response(&self.socket, &mut self.lines) {
            Ok(Some(response)) => response_into_data(response)
                .and_then(|data| serde_json::from_value(data).map_err(DaemonError::from)),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(err) => Err(err),
        };
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

fn connect(home: &Path, request: &DaemonRequest) -> Result<(PathBuf, UnixStream), DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;
    Ok((socket, stream))
}

fn read_response(
    socket: &Path,
    lines: &mut Lines<BufReader<UnixStream>>,
) -> Result<Option<DaemonResponse>, DaemonError> {
    loop {
        match lines.next() {
            None => return Ok(None),
            Some(Err(err)) => return Err(io_err(socket, err)),
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => return Ok(Some(serde_json::from_str(line.trim_end())?)),
        }
    }
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Remote {
            code: response
                .code
                .unwrap_or_else(|| ErrorCode::Internal.as_str().to_string()),
            message: response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        })
    }
}
