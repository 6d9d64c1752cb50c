use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;

use livemap_broker::BrokerConfig;
use livemap_core::config::{load_at as load_config, LivemapConfig};
use livemap_core::events::LivemapEvent;
use livemap_db::Database;
use livemap_store::snapshot;
use livemap_tracker::{Postals, TrackerManager, TrackerSettings, TrackerStores};

use crate::access::{ConfigPermissions, Permissions};
use crate::commands::CommandService;
use crate::error::{io_err, DaemonError};
use crate::paths::{cache_dir, database_path, livemap_root, postals_path, socket_path};
use crate::server::{socket_server_task, ServerState};
use crate::stream::{StreamService, StreamSettings};

/// Build a multi-thread runtime and run the daemon on it until shutdown.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon: tracker loop, broker, socket server and signal handler,
/// all rooted in one shutdown channel. Bucket snapshots are restored before
/// the first cycle and written back after every task has stopped.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let config = load_config(&home)?;
    let db = Arc::new(Database::open(database_path(&home))?);

    let stores = TrackerStores::new();
    warm_start(&cache_dir(&home), &stores);
    let postals = Arc::new(Postals::load(&postals_path(&home))?);

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (broker, broker_handle) = livemap_broker::spawn::<LivemapEvent>(
        BrokerConfig {
            capacity: config.broker_capacity,
            subscriber_buffer: config.subscriber_buffer,
        },
        shutdown_tx.subscribe(),
    );

    let permissions: Arc<dyn Permissions> = Arc::new(ConfigPermissions::from_config(&config));
    let tracker = Arc::new(TrackerManager::new(
        TrackerSettings::from(&config),
        stores.clone(),
        db.clone(),
        db.clone(),
        postals,
        broker.clone(),
    ));
    let state = Arc::new(ServerState::new(
        socket_path(&home),
        StreamService::new(
            StreamSettings::from(&config),
            stores.clone(),
            db.clone(),
            permissions.clone(),
            broker.clone(),
        ),
        CommandService::new(db, permissions, broker.clone(), config.default_color.clone()),
        stores.clone(),
        broker,
    ));
    log_startup(&home, &config, &stores);

    let tracker_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tracker.run(shutdown.subscribe()).await;
            Ok::<(), DaemonError>(())
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(state, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (tracker_result, socket_result, signal_result, broker_result) =
        tokio::join!(tracker_handle, socket_handle, signal_handle, broker_handle);

    save_snapshots(&cache_dir(&home), &stores);

    handle_join("tracker", tracker_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    handle_join("broker", broker_result.map(Ok))?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Restore the canonical and mapping buckets; the job index is rebuilt by
/// its hook. A bad snapshot is logged and skipped.
fn warm_start(dir: &Path, stores: &TrackerStores) {
    match snapshot::load_at(dir, &stores.by_id) {
        Ok(count) => tracing::info!(bucket = %stores.by_id.bucket(), entries = count, "restored snapshot"),
        Err(err) => tracing::warn!(bucket = %stores.by_id.bucket(), error = %err, "skipping snapshot"),
    }
    match snapshot::load_at(dir, &stores.mappings) {
        Ok(count) => tracing::info!(bucket = %stores.mappings.bucket(), entries = count, "restored snapshot"),
        Err(err) => tracing::warn!(bucket = %stores.mappings.bucket(), error = %err, "skipping snapshot"),
    }
}

fn save_snapshots(dir: &Path, stores: &TrackerStores) {
    if let Err(err) = snapshot::save_at(dir, &stores.by_id) {
        tracing::warn!(bucket = %stores.by_id.bucket(), error = %err, "failed to save snapshot");
    }
    if let Err(err) = snapshot::save_at(dir, &stores.mappings) {
        tracing::warn!(bucket = %stores.mappings.bucket(), error = %err, "failed to save snapshot");
    }
}

fn log_startup(home: &Path, config: &LivemapConfig, stores: &TrackerStores) {
    tracing::info!(
        root = %livemap_root(home).display(),
        refresh_ms = config.refresh_interval_ms,
        visible_jobs = ?config.visible_jobs,
        access_rules = config.access.len(),
        tracked_users = stores.by_id.len(),
        "livemap daemon starting",
    );
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [livemap_root(home), cache_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// `RUST_LOG` filter (default `info`); `LIVEMAP_LOG_FORMAT=json` switches to
/// JSON lines.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LIVEMAP_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
