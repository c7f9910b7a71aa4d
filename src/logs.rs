//! Playback log queue.
//!
//! Play events are appended to local storage the moment an item starts and
//! delivered to the server in batches. A record is only marked synced after
//! the server acknowledged the batch containing it, so delivery is
//! at-least-once; the server dedupes on (device_id, media_id, played_at).

use crate::api::ServerClient;
use crate::error::{AgentError, Result};
use crate::model::{PlaybackLogRecord, PlaybackLogUpload, PlaylistItem};
use crate::store::{NewLogRecord, Store};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Result of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub submitted: usize,
    pub marked: usize,
    /// Records acknowledged by an earlier flush and removed now.
    pub pruned: usize,
}

pub struct PlaybackLog {
    store: Arc<Store>,
    api: ServerClient,
}

impl PlaybackLog {
    pub fn new(store: Arc<Store>, api: ServerClient) -> Self {
        Self { store, api }
    }

    /// Durably record that `item` started playing now.
    pub async fn record(&self, device_id: &str, item: &PlaylistItem) -> Result<PlaybackLogRecord> {
        let record = self
            .store
            .append_log(NewLogRecord {
                device_id,
                media_id: &item.media_id,
                campaign_id: &item.campaign_id,
                played_at: Utc::now(),
            })
            .await?;
        tracing::debug!("Recorded play #{} of {}", record.local_id, record.media_id);
        Ok(record)
    }

    /// Submit every unsynced record as one batch.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        // Records acknowledged last time are no longer needed.
        let pruned = self.store.prune_synced_logs().await?;

        let pending = self.store.unsynced_logs().await;
        if pending.is_empty() {
            return Ok(FlushOutcome {
                pruned,
                ..FlushOutcome::default()
            });
        }

        let batch: Vec<PlaybackLogUpload> = pending.iter().map(PlaybackLogUpload::from).collect();
        self.api
            .submit_playback_logs(&batch)
            .await
            .map_err(|e| AgentError::LogDeliveryFailure(e.to_string()))?;

        let ids: Vec<u64> = pending.iter().map(|r| r.local_id).collect();
        let marked = self.store.mark_logs_synced(&ids).await?;

        tracing::info!("Flushed {} playback logs", batch.len());
        Ok(FlushOutcome {
            submitted: batch.len(),
            marked,
            pruned,
        })
    }
}

/// Flush the queue every `period`, starting one period from now.
pub fn spawn_log_flush(log: Arc<PlaybackLog>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = log.flush().await {
                tracing::warn!("Playback log flush failed, will retry: {}", e);
            }
        }
    })
}
