//! Unix socket front end.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

use livemap_broker::Broker;
use livemap_core::events::LivemapEvent;
use livemap_tracker::TrackerStores;

use crate::commands::CommandService;
use crate::error::{io_err, DaemonError, ErrorCode};
use crate::protocol::{DaemonRequest, DaemonResponse, StreamResponse};
use crate::stream::StreamService;

/// Messages a stream handler may queue ahead of the socket writer.
const STREAM_BUFFER: usize = 64;

/// Everything a socket client can reach.
pub struct ServerState {
    pub socket: PathBuf,
    pub streams: StreamService,
    pub commands: CommandService,
    pub stores: TrackerStores,
    pub broker: Broker<LivemapEvent>,
    pub started_at: DateTime<Utc>,
    active_streams: AtomicUsize,
}

impl ServerState {
    pub fn new(
        socket: PathBuf,
        streams: StreamService,
        commands: CommandService,
        stores: TrackerStores,
        broker: Broker<LivemapEvent>,
    ) -> Self {
        Self {
            socket,
            streams,
            commands,
            stores,
            broker,
            started_at: Utc::now(),
            active_streams: AtomicUsize::new(0),
        }
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> Value {
        let now = Utc::now();
        json!({
            "running": true,
            "pid": std::process::id(),
            "socket": self.socket.display().to_string(),
            "started_at": self.started_at.to_rfc3339(),
            "uptime_secs": (now - self.started_at).num_seconds().max(0),
            "tracked_users": self.stores.by_id.len(),
            "unit_mappings": self.stores.mappings.len(),
            "active_streams": self.active_streams(),
            "subscribers": self.broker.subscriber_count(),
            "events_published": self.broker.published(),
            "events_dropped": self.broker.dropped(),
        })
    }
}

pub(crate) async fn socket_server_task(
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = state.socket.clone();
    if let Some(dir) = socket.parent() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, shutdown_tx).await {
                        tracing::warn!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

pub(crate) async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(
                        ErrorCode::InvalidRequest,
                        format!("invalid request JSON: {err}"),
                    ),
                )
                .await?;
                continue;
            }
        };
        tracing::debug!(cmd = request.name(), "socket request");

        let response = match request {
            DaemonRequest::Stream { user } => {
                // The connection belongs to the stream from here on.
                return serve_stream(user, &state, &shutdown_tx, lines, writer).await;
            }
            DaemonRequest::CreateOrUpdateMarker { user, marker } => {
                match state.commands.create_or_update_marker(&user, marker).await {
                    Ok(marker) => DaemonResponse::ok(serde_json::to_value(&marker)?),
                    Err(err) => DaemonResponse::error(err.code(), err.to_string()),
                }
            }
            DaemonRequest::DeleteMarker { user, id } => {
                match state.commands.delete_marker(&user, id).await {
                    Ok(marker) => DaemonResponse::ok(serde_json::to_value(&marker)?),
                    Err(err) => DaemonResponse::error(err.code(), err.to_string()),
                }
            }
            DaemonRequest::Status => DaemonResponse::ok(state.status()),
            DaemonRequest::Stop => {
                write_response(&mut writer, &DaemonResponse::ok(json!({ "stopping": true })))
                    .await?;
                let _ = shutdown_tx.send(());
                break;
            }
        };

        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

/// Pump a stream handler's messages onto the socket until either side ends.
async fn serve_stream(
    user: livemap_core::UserInfo,
    state: &Arc<ServerState>,
    shutdown_tx: &broadcast::Sender<()>,
    mut lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
) -> Result<(), DaemonError> {
    let user_id = user.user_id;
    let (tx, mut rx) = mpsc::channel::<StreamResponse>(STREAM_BUFFER);
    let streams = state.streams.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    let handler = tokio::spawn(async move { streams.stream(user, tx, shutdown_rx).await });

    state.active_streams.fetch_add(1, Ordering::Relaxed);
    let pumped = pump(&mut rx, &mut lines, &mut writer).await;
    state.active_streams.fetch_sub(1, Ordering::Relaxed);
    drop(rx);

    match handler.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::info!(user_id = %user_id, error = %err, "stream ended");
            if pumped.is_ok() {
                let _ = write_response(
                    &mut writer,
                    &DaemonResponse::error(err.code(), err.to_string()),
                )
                .await;
            }
        }
        Err(err) => {
            return Err(DaemonError::Protocol(format!(
                "stream task join failure: {err}"
            )))
        }
    }
    pumped
}

async fn pump(
    rx: &mut mpsc::Receiver<StreamResponse>,
    lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { return Ok(()) };
                let response = DaemonResponse::ok(serde_json::to_value(&message)?);
                write_response(writer, &response).await?;
            }
            line = lines.next_line() => match line {
                // Input after the stream request is ignored.
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return Ok(()),
            }
        }
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::Protocol(format!(
            "daemon socket already in use: {}",
            socket.display()
        )));
    }
    tracing::warn!(socket = %socket.display(), "removing stale daemon socket before bind");

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
