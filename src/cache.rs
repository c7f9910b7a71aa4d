//! Media cache manager.
//!
//! Keeps a local blob for every item of the current playlist and evicts
//! blobs no current item references. Referenced-by-current-playlist is the
//! only retention rule; devices are sized for one playlist generation.

use crate::api::ServerClient;
use crate::error::{AgentError, Result};
use crate::model::{CachedMedia, Playlist, PlaylistItem};
use crate::store::{NewMedia, Store};
use rand::Rng;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one `ensure_cached` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheReport {
    pub already_cached: usize,
    pub fetched: usize,
    /// Media ids that could not be downloaded this cycle.
    pub failed: Vec<String>,
    pub evicted: Vec<String>,
}

pub struct MediaCache {
    store: Arc<Store>,
    api: ServerClient,
    fetch_attempts: u32,
    retry_backoff: Duration,
}

impl MediaCache {
    pub fn new(
        store: Arc<Store>,
        api: ServerClient,
        fetch_attempts: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            api,
            fetch_attempts: fetch_attempts.max(1),
            retry_backoff,
        }
    }

    /// Download every item of `playlist` that is not cached yet, then evict
    /// everything the playlist no longer references.
    pub async fn ensure_cached(&self, playlist: &Playlist) -> CacheReport {
        let mut report = self.backfill(playlist).await;
        report.evicted = self.evict_unreferenced(playlist).await;
        report
    }

    /// Download every item of `playlist` that is not cached yet. Nothing is
    /// evicted.
    pub async fn backfill(&self, playlist: &Playlist) -> CacheReport {
        let mut report = CacheReport::default();
        let mut seen = HashSet::new();

        for item in &playlist.items {
            if !seen.insert(item.media_id.as_str()) {
                continue;
            }

            if self.store.media_path(&item.media_id).await.is_some() {
                report.already_cached += 1;
                continue;
            }

            match self.fetch_with_retry(item).await {
                Ok(entry) => {
                    tracing::debug!(
                        "Cached {} ({:.2} KB)",
                        entry.media_id,
                        entry.size as f64 / 1024.0
                    );
                    report.fetched += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to cache {}: {}", item.media_id, e);
                    report.failed.push(item.media_id.clone());
                }
            }
        }

        tracing::info!(
            "Cache backfill for playlist {}: {} cached, {} fetched, {} failed",
            playlist.version,
            report.already_cached,
            report.fetched,
            report.failed.len()
        );
        report
    }

    /// Delete every cached blob not referenced by `playlist`. Returns the
    /// evicted media ids.
    pub async fn evict_unreferenced(&self, playlist: &Playlist) -> Vec<String> {
        let mut evicted = Vec::new();

        for media_id in self.store.cached_media_ids().await {
            if playlist.references(&media_id) {
                continue;
            }
            match self.store.remove_media(&media_id).await {
                Ok(_) => {
                    tracing::debug!("Evicted unreferenced media {}", media_id);
                    evicted.push(media_id);
                }
                Err(e) => tracing::warn!("Failed to evict {}: {}", media_id, e),
            }
        }

        if !evicted.is_empty() {
            tracing::info!(
                "Evicted {} media items not in playlist {}",
                evicted.len(),
                playlist.version
            );
        }
        evicted
    }

    /// Local path to display `item` from: the cached blob if present,
    /// otherwise the result of one direct fetch from its origin.
    pub async fn resolve(&self, item: &PlaylistItem) -> Result<PathBuf> {
        if let Some(path) = self.store.media_path(&item.media_id).await {
            return Ok(path);
        }

        tracing::info!("Cache miss for {}, fetching from origin", item.media_id);
        self.download(item)
            .await
            .map_err(|e| miss(item, e))?;

        self.store
            .media_path(&item.media_id)
            .await
            .ok_or_else(|| AgentError::PartialCacheMiss {
                media_id: item.media_id.clone(),
                reason: "blob vanished after download".into(),
            })
    }

    async fn fetch_with_retry(&self, item: &PlaylistItem) -> Result<CachedMedia> {
        let mut attempt = 1;
        loop {
            match self.download(item).await {
                Ok(entry) => return Ok(entry),
                Err(e) if e.is_transient() && attempt < self.fetch_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        "Download of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        item.media_id,
                        attempt,
                        self.fetch_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(miss(item, e)),
            }
        }
    }

    /// Exponential backoff with up to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_backoff.saturating_mul(1u32 << (attempt - 1).min(6));
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    async fn download(&self, item: &PlaylistItem) -> Result<CachedMedia> {
        let fetched = self.api.fetch_media(&item.url).await?;
        self.store
            .put_media(
                NewMedia {
                    media_id: &item.media_id,
                    url: &item.url,
                    filename: &item.filename,
                    etag: fetched.etag,
                    content_type: fetched.content_type,
                },
                &fetched.bytes,
            )
            .await
    }
}

fn miss(item: &PlaylistItem, err: AgentError) -> AgentError {
    match err {
        AgentError::PartialCacheMiss { .. } => err,
        other => AgentError::PartialCacheMiss {
            media_id: item.media_id.clone(),
            reason: other.to_string(),
        },
    }
}
