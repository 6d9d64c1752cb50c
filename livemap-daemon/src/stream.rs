//! Per-client live stream.
//!
//! ```text
//! open → resolve scope → Jobs → initial markers + users
//!      → loop { broker event | refresh tick | client gone | shutdown }
//! ```
//!
//! Each client keeps its own cursor: the users it was last sent (compared by
//! value), the marker versions it holds, and the expired markers it was
//! already told to evict. Deltas are computed against that cursor.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use livemap_broker::Broker;
use livemap_core::config::LivemapConfig;
use livemap_core::events::LivemapEvent;
use livemap_core::source::MarkerRepository;
use livemap_core::types::{Marker, MarkerId, UserId, UserInfo, UserMarker};
use livemap_tracker::TrackerStores;

use crate::access::Permissions;
use crate::chunk;
use crate::error::StreamError;
use crate::protocol::{MarkersDelta, StreamResponse, UsersDelta};
use crate::visibility::Scope;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub refresh_interval: Duration,
    pub user_chunk_size: usize,
    pub marker_chunk_size: usize,
    pub chunk_pause: Duration,
    pub require_on_duty: bool,
    pub marker_expiry_lookback: chrono::Duration,
}

impl From<&LivemapConfig> for StreamSettings {
    fn from(config: &LivemapConfig) -> Self {
        Self {
            refresh_interval: config.stream_refresh_interval(),
            user_chunk_size: config.user_chunk_size,
            marker_chunk_size: config.marker_chunk_size,
            chunk_pause: config.chunk_pause(),
            require_on_duty: config.require_on_duty,
            marker_expiry_lookback: config.marker_expiry_lookback(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&LivemapConfig::default())
    }
}

/// Cursor of one connected client.
#[derive(Debug, Default)]
struct ClientState {
    users: HashMap<UserId, UserMarker>,
    /// `None` until the first users delta went out.
    on_duty: Option<bool>,
    markers: HashMap<MarkerId, DateTime<Utc>>,
    evicted: BTreeSet<MarkerId>,
    markers_sent: bool,
}

#[derive(Clone)]
pub struct StreamService {
    settings: StreamSettings,
    stores: TrackerStores,
    markers: Arc<dyn MarkerRepository>,
    permissions: Arc<dyn Permissions>,
    broker: Broker<LivemapEvent>,
}

impl StreamService {
    pub fn new(
        settings: StreamSettings,
        stores: TrackerStores,
        markers: Arc<dyn MarkerRepository>,
        permissions: Arc<dyn Permissions>,
        broker: Broker<LivemapEvent>,
    ) -> Self {
        Self {
            settings,
            stores,
            markers,
            permissions,
            broker,
        }
    }

    /// Drive one client stream into `tx` until shutdown or until the
    /// receiving side goes away.
    ///
    /// Returns `Err(StreamError::PermissionDenied)` before anything is sent
    /// when the caller can see neither markers nor users, and
    /// `Err(StreamError::Closed)` when a send fails mid-stream.
    pub async fn stream(
        &self,
        user: UserInfo,
        tx: mpsc::Sender<StreamResponse>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), StreamError> {
        let scope = Scope::resolve(self.permissions.as_ref(), user);
        let markers_open = scope.sees_markers();
        let users_open = scope.sees_users();
        if !markers_open && !users_open {
            return Err(StreamError::PermissionDenied(scope.user.user_id));
        }

        // Subscribe before the snapshot so nothing published in between is lost.
        let mut events = self.broker.subscribe().await?;
        let mut client = ClientState::default();

        send(
            &tx,
            StreamResponse::Jobs {
                markers: scope.marker_jobs.clone(),
                users: scope.user_jobs(),
            },
        )
        .await?;

        if markers_open {
            self.refresh_markers(&scope, &mut client, &tx).await?;
        } else {
            send(&tx, StreamResponse::Markers(MarkersDelta::default())).await?;
        }
        if users_open {
            self.refresh_users(&scope, &mut client, &tx).await?;
        } else {
            send(&tx, StreamResponse::Users(UsersDelta::default())).await?;
        }

        tracing::info!(
            user_id = %scope.user.user_id,
            job = %scope.user.job,
            superuser = scope.superuser,
            marker_jobs = scope.marker_jobs.len(),
            users = client.users.len(),
            markers = client.markers.len(),
            "stream opened",
        );

        let period = self.settings.refresh_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tx.closed() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        LivemapEvent::UserMarkers(_) if users_open => {
                            self.refresh_users(&scope, &mut client, &tx).await?;
                        }
                        LivemapEvent::MarkerUpdate(marker)
                            if markers_open && scope.sees_marker_job(&marker.job) =>
                        {
                            self.marker_changed(marker, &mut client, &tx).await?;
                        }
                        LivemapEvent::MarkerDelete { id, job }
                            if markers_open && scope.sees_marker_job(&job) =>
                        {
                            client.markers.remove(&id);
                            send_markers(&tx, vec![], vec![id], true).await?;
                        }
                        _ => {}
                    }
                }
                _ = ticker.tick() => {
                    if markers_open {
                        self.refresh_markers(&scope, &mut client, &tx).await?;
                    }
                    if users_open {
                        self.refresh_users(&scope, &mut client, &tx).await?;
                    }
                }
            }
        }

        tracing::info!(user_id = %scope.user.user_id, "stream closed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    async fn refresh_users(
        &self,
        scope: &Scope,
        client: &mut ClientState,
        tx: &mpsc::Sender<StreamResponse>,
    ) -> Result<(), StreamError> {
        let (visible, on_duty) = scope.visible_users(&self.stores, self.settings.require_on_duty);

        let full = match client.on_duty {
            None => true,
            Some(false) if on_duty => {
                tracing::debug!(user_id = %scope.user.user_id, "caller went on duty");
                client.users.clear();
                true
            }
            Some(true) if !on_duty => {
                tracing::debug!(user_id = %scope.user.user_id, "caller went off duty");
                client.on_duty = Some(false);
                client.users = visible.iter().map(|m| (m.user_id, m.clone())).collect();
                return self.send_users(tx, visible, vec![], false, true, false).await;
            }
            Some(_) => false,
        };
        client.on_duty = Some(on_duty);

        let updated: Vec<UserMarker> = visible
            .iter()
            .filter(|m| client.users.get(&m.user_id) != Some(*m))
            .cloned()
            .collect();
        let visible_ids: BTreeSet<UserId> = visible.iter().map(|m| m.user_id).collect();
        let mut deleted: Vec<UserId> = client
            .users
            .keys()
            .filter(|id| !visible_ids.contains(*id))
            .copied()
            .collect();
        deleted.sort();

        if !full && updated.is_empty() && deleted.is_empty() {
            return Ok(());
        }

        client.users = visible.into_iter().map(|m| (m.user_id, m)).collect();
        self.send_users(tx, updated, deleted, !full, false, on_duty).await
    }

    async fn send_users(
        &self,
        tx: &mpsc::Sender<StreamResponse>,
        updated: Vec<UserMarker>,
        deleted: Vec<UserId>,
        partial: bool,
        clear: bool,
        on_duty: bool,
    ) -> Result<(), StreamError> {
        let parts = chunk::split(updated, deleted, self.settings.user_chunk_size, partial);
        let last = parts.len().saturating_sub(1);
        for (index, part) in parts.into_iter().enumerate() {
            send(
                tx,
                StreamResponse::Users(UsersDelta {
                    updated: part.updated,
                    deleted: part.deleted,
                    part: part.part,
                    partial: part.partial,
                    clear: clear && index == 0,
                    on_duty,
                }),
            )
            .await?;
            if index < last {
                tokio::time::sleep(self.settings.chunk_pause).await;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Markers
    // -----------------------------------------------------------------------

    /// Full marker resync. Sends the whole visible list only when it differs
    /// from what the client holds; expired markers are reported once.
    async fn refresh_markers(
        &self,
        scope: &Scope,
        client: &mut ClientState,
        tx: &mpsc::Sender<StreamResponse>,
    ) -> Result<(), StreamError> {
        let now = Utc::now();
        let jobs = scope.marker_query_jobs();
        let since = now - self.settings.marker_expiry_lookback;
        let repo = self.markers.clone();
        let listed = tokio::task::spawn_blocking(move || repo.list_markers(&jobs, since))
            .await
            .map_err(|e| StreamError::Join(e.to_string()))??;

        let (visible, expired): (Vec<Marker>, Vec<Marker>) =
            listed.into_iter().partition(|m| m.is_visible_at(now));

        let expired_ids: BTreeSet<MarkerId> = expired.iter().map(|m| m.id).collect();
        let mut deleted: Vec<MarkerId> = expired_ids
            .iter()
            .filter(|id| !client.evicted.contains(*id))
            .copied()
            .collect();
        client.evicted.retain(|id| expired_ids.contains(id));
        client.evicted.extend(deleted.iter().copied());

        let versions: HashMap<MarkerId, DateTime<Utc>> =
            visible.iter().map(|m| (m.id, m.updated_at)).collect();
        deleted.extend(
            client
                .markers
                .keys()
                .filter(|id| !versions.contains_key(*id) && !expired_ids.contains(*id))
                .copied(),
        );
        deleted.sort();
        deleted.dedup();

        if client.markers_sent && versions == client.markers && deleted.is_empty() {
            return Ok(());
        }
        client.markers_sent = true;
        client.markers = versions;

        let parts = chunk::split(visible, deleted, self.settings.marker_chunk_size, false);
        let last = parts.len().saturating_sub(1);
        for (index, part) in parts.into_iter().enumerate() {
            send(
                tx,
                StreamResponse::Markers(MarkersDelta {
                    updated: part.updated,
                    deleted: part.deleted,
                    part: part.part,
                    partial: part.partial,
                }),
            )
            .await?;
            if index < last {
                tokio::time::sleep(self.settings.chunk_pause).await;
            }
        }
        Ok(())
    }

    async fn marker_changed(
        &self,
        marker: Marker,
        client: &mut ClientState,
        tx: &mpsc::Sender<StreamResponse>,
    ) -> Result<(), StreamError> {
        if marker.is_visible_at(Utc::now()) {
            client.markers.insert(marker.id, marker.updated_at);
            send_markers(tx, vec![marker], vec![], true).await
        } else {
            client.markers.remove(&marker.id);
            if !client.evicted.insert(marker.id) {
                return Ok(());
            }
            send_markers(tx, vec![], vec![marker.id], true).await
        }
    }
}

async fn send_markers(
    tx: &mpsc::Sender<StreamResponse>,
    updated: Vec<Marker>,
    deleted: Vec<MarkerId>,
    partial: bool,
) -> Result<(), StreamError> {
    send(
        tx,
        StreamResponse::Markers(MarkersDelta {
            updated,
            deleted,
            part: 0,
            partial,
        }),
    )
    .await
}

async fn send(tx: &mpsc::Sender<StreamResponse>, message: StreamResponse) -> Result<(), StreamError> {
    tx.send(message).await.map_err(|_| StreamError::Closed)
}
