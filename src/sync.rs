//! Playlist synchronisation.
//!
//! Pulls the manifest from the server on a fixed period. A successful pull is
//! persisted, backfilled into the media cache and only then published to the
//! scheduler. Media the new playlist dropped is evicted after publishing. A
//! failed pull falls back to the last persisted playlist.

use crate::api::ServerClient;
use crate::cache::MediaCache;
use crate::error::{AgentError, Result};
use crate::model::Playlist;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// What the scheduler currently has to work with.
#[derive(Debug, Clone)]
pub enum PlaylistStatus {
    /// No sync has completed yet and nothing was persisted.
    Pending,
    Ready(Arc<Playlist>),
    /// A sync failed and no playlist was ever persisted.
    Unavailable,
}

pub struct PlaylistSync {
    store: Arc<Store>,
    api: ServerClient,
    cache: Arc<MediaCache>,
    playlist_tx: watch::Sender<PlaylistStatus>,
    online_tx: watch::Sender<bool>,
}

impl PlaylistSync {
    pub fn new(store: Arc<Store>, api: ServerClient, cache: Arc<MediaCache>) -> Self {
        let (playlist_tx, _) = watch::channel(PlaylistStatus::Pending);
        let (online_tx, _) = watch::channel(false);
        Self {
            store,
            api,
            cache,
            playlist_tx,
            online_tx,
        }
    }

    /// Receiver for the published playlist. Never blocks on an in-flight sync.
    pub fn subscribe(&self) -> watch::Receiver<PlaylistStatus> {
        self.playlist_tx.subscribe()
    }

    /// Receiver for the online/offline flag of the last sync.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    /// Whether the last sync reached the server.
    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// The playlist currently published, if any.
    pub fn current(&self) -> Option<Arc<Playlist>> {
        match &*self.playlist_tx.borrow() {
            PlaylistStatus::Ready(playlist) => Some(playlist.clone()),
            _ => None,
        }
    }

    /// Publish the persisted playlist, if any, so playback can start before
    /// the first network round trip completes.
    pub async fn prime(&self) -> Option<Arc<Playlist>> {
        match self.store.load_playlist().await {
            Ok(Some(playlist)) => {
                tracing::info!(
                    "Loaded persisted playlist {} with {} items",
                    playlist.version,
                    playlist.len()
                );
                let playlist = Arc::new(playlist);
                self.publish(playlist.clone());
                Some(playlist)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to read persisted playlist: {}", e);
                None
            }
        }
    }

    /// One sync attempt. Failures are not retried here; the next tick is the
    /// retry.
    pub async fn sync(&self, device_id: &str) -> Result<Arc<Playlist>> {
        match self.api.fetch_playlist(device_id).await {
            Ok(playlist) => {
                if let Err(e) = self.store.save_playlist(&playlist).await {
                    // keep serving it from memory; the previous file stays intact
                    tracing::error!("Failed to persist playlist {}: {}", playlist.version, e);
                }
                self.set_online(true);

                let report = self.cache.backfill(&playlist).await;
                if !report.failed.is_empty() {
                    tracing::warn!(
                        "{} media items not cached, they will be fetched at display time",
                        report.failed.len()
                    );
                }

                let playlist = Arc::new(playlist);
                self.publish(playlist.clone());

                // the old playlist's media stays on disk until subscribers
                // have had a chance to pick up the new one
                tokio::task::yield_now().await;
                self.cache.evict_unreferenced(&playlist).await;
                Ok(playlist)
            }
            Err(e) => {
                tracing::warn!("Playlist sync failed: {}", e);
                self.set_online(false);
                self.fallback().await
            }
        }
    }

    async fn fallback(&self) -> Result<Arc<Playlist>> {
        if let Some(playlist) = self.current() {
            tracing::info!("Continuing with playlist {} while offline", playlist.version);
            return Ok(playlist);
        }

        match self.prime().await {
            Some(playlist) => Ok(playlist),
            None => {
                self.playlist_tx.send_replace(PlaylistStatus::Unavailable);
                Err(AgentError::NoContentAvailable)
            }
        }
    }

    /// Replace the published playlist. Subscribers are only woken when the
    /// content actually changed.
    fn publish(&self, playlist: Arc<Playlist>) {
        self.playlist_tx.send_if_modified(|current| {
            let changed = match current {
                PlaylistStatus::Ready(existing) => !existing.same_content(&playlist),
                _ => true,
            };
            if changed {
                tracing::info!(
                    "Publishing playlist {} with {} items",
                    playlist.version,
                    playlist.len()
                );
            }
            *current = PlaylistStatus::Ready(playlist);
            changed
        });
    }

    fn set_online(&self, online: bool) {
        let previous = self.online_tx.send_replace(online);
        if previous != online {
            tracing::info!("Agent is now {}", if online { "online" } else { "offline" });
        }
    }
}

/// Run `sync` immediately and then every `period`.
pub fn spawn_playlist_sync(
    sync: Arc<PlaylistSync>,
    device_id: String,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match sync.sync(&device_id).await {
                Ok(playlist) => tracing::debug!("Playlist sync tick done ({})", playlist.version),
                Err(AgentError::NoContentAvailable) => {
                    tracing::error!("No playlist available yet, retrying in {:?}", period)
                }
                Err(e) => tracing::warn!("Playlist sync tick failed: {}", e),
            }
        }
    })
}
