//! Durable on-device storage.
//!
//! Four independent namespaces live under one data directory: the device
//! identity, the current playlist, the media cache and the playback-log queue.
//! Each namespace has its own lock; no operation spans two of them. Single
//! record namespaces are replaced with write-to-temp + rename so a crash never
//! leaves a half-written record behind.

use crate::error::{AgentError, Result};
use crate::model::{CachedMedia, DeviceIdentity, Playlist, PlaybackLogRecord};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use walkdir::WalkDir;

const IDENTITY_FILE: &str = "identity.json";
const PLAYLIST_FILE: &str = "playlist.json";
const MEDIA_DIR: &str = "media";
const BLOB_FILE: &str = "blob";
const META_FILE: &str = "meta.json";
const LOGS_DIR: &str = "logs";
const RECORDS_FILE: &str = "records.jsonl";
const NEXT_ID_FILE: &str = "next_id";

/// Everything needed to persist a freshly downloaded blob.
#[derive(Debug, Clone)]
pub struct NewMedia<'a> {
    pub media_id: &'a str,
    pub url: &'a str,
    pub filename: &'a str,
    pub etag: Option<String>,
    pub content_type: Option<String>,
}

/// A play event about to be appended to the log queue.
#[derive(Debug, Clone)]
pub struct NewLogRecord<'a> {
    pub device_id: &'a str,
    pub media_id: &'a str,
    pub campaign_id: &'a str,
    pub played_at: DateTime<Utc>,
}

struct LogQueueState {
    records: Vec<PlaybackLogRecord>,
    next_id: u64,
}

impl LogQueueState {
    fn unsynced_count(&self) -> usize {
        self.records.iter().filter(|r| !r.synced).count()
    }
}

/// Durable key/value and blob store shared by all agent tasks.
pub struct Store {
    root: PathBuf,
    max_unsynced: usize,
    identity: Mutex<()>,
    playlist: Mutex<()>,
    media: Mutex<HashMap<String, CachedMedia>>,
    logs: Mutex<LogQueueState>,
}

impl Store {
    /// Open (creating if needed) the store rooted at `root`.
    ///
    /// `max_unsynced` bounds the number of unsynced log records kept; beyond
    /// it the oldest are dropped.
    pub fn open(root: impl Into<PathBuf>, max_unsynced: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(MEDIA_DIR))?;
        fs::create_dir_all(root.join(LOGS_DIR))?;

        let media = scan_media(&root.join(MEDIA_DIR))?;
        let logs = load_log_queue(&root.join(LOGS_DIR))?;

        tracing::info!(
            "Store opened at {:?}: {} cached media, {} log records ({} unsynced)",
            root,
            media.len(),
            logs.records.len(),
            logs.unsynced_count()
        );

        Ok(Self {
            root,
            max_unsynced: max_unsynced.max(1),
            identity: Mutex::new(()),
            playlist: Mutex::new(()),
            media: Mutex::new(media),
            logs: Mutex::new(logs),
        })
    }

    // --- identity -------------------------------------------------------

    /// The persisted identity, or `None` before the first migration.
    pub async fn load_identity(&self) -> Result<Option<DeviceIdentity>> {
        let _guard = self.identity.lock().await;
        read_record(&self.root.join(IDENTITY_FILE)).await
    }

    /// Overwrite the persisted identity.
    pub async fn save_identity(&self, identity: &DeviceIdentity) -> Result<()> {
        let _guard = self.identity.lock().await;
        write_record(&self.root.join(IDENTITY_FILE), identity).await
    }

    // --- playlist -------------------------------------------------------

    /// The last playlist saved, or `None` if nothing was ever synced.
    pub async fn load_playlist(&self) -> Result<Option<Playlist>> {
        let _guard = self.playlist.lock().await;
        read_record(&self.root.join(PLAYLIST_FILE)).await
    }

    /// Replace the persisted playlist. Either the new playlist is fully
    /// written or the previous one stays in place.
    pub async fn save_playlist(&self, playlist: &Playlist) -> Result<()> {
        let _guard = self.playlist.lock().await;
        write_record(&self.root.join(PLAYLIST_FILE), playlist).await?;
        tracing::debug!(
            "Saved playlist {} with {} items",
            playlist.version,
            playlist.len()
        );
        Ok(())
    }

    // --- media cache ----------------------------------------------------

    fn media_dir(&self, media_id: &str) -> PathBuf {
        // media ids come from the server; never trust them as path components
        let mut name = urlencoding::encode(media_id).into_owned();
        if name.is_empty() || name.starts_with('.') {
            // encoded output never starts with a bare '%'
            name.insert(0, '%');
        }
        self.root.join(MEDIA_DIR).join(name)
    }

    /// Path of the cached blob for `media_id`, if present on disk.
    pub async fn media_path(&self, media_id: &str) -> Option<PathBuf> {
        let media = self.media.lock().await;
        if !media.contains_key(media_id) {
            return None;
        }
        let path = self.media_dir(media_id).join(BLOB_FILE);
        path.exists().then_some(path)
    }

    /// Metadata of a cached blob.
    pub async fn media_entry(&self, media_id: &str) -> Option<CachedMedia> {
        self.media.lock().await.get(media_id).cloned()
    }

    /// Ids of every cached blob, sorted.
    pub async fn cached_media_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.media.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Persist a blob and its metadata, replacing any previous copy.
    pub async fn put_media(&self, new: NewMedia<'_>, bytes: &[u8]) -> Result<CachedMedia> {
        let mut media = self.media.lock().await;

        let dir = self.media_dir(new.media_id);
        tokio::fs::create_dir_all(&dir).await?;

        let entry = CachedMedia {
            media_id: new.media_id.to_string(),
            url: new.url.to_string(),
            filename: new.filename.to_string(),
            size: bytes.len() as u64,
            content_hash: format!("{:x}", Sha256::digest(bytes)),
            etag: new.etag,
            content_type: new.content_type,
            cached_at: Utc::now(),
        };

        // blob first: metadata is the commit marker the open-time scan trusts
        write_atomic(&dir.join(BLOB_FILE), bytes).await?;
        write_record(&dir.join(META_FILE), &entry).await?;

        media.insert(entry.media_id.clone(), entry.clone());
        Ok(entry)
    }

    /// Delete a cached blob. Returns whether anything was removed.
    pub async fn remove_media(&self, media_id: &str) -> Result<bool> {
        let mut media = self.media.lock().await;
        let existed = media.remove(media_id).is_some();

        match tokio::fs::remove_dir_all(self.media_dir(media_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(e.into()),
        }
    }

    // --- playback log queue ---------------------------------------------

    /// Durably append a play event and return the stored record.
    pub async fn append_log(&self, new: NewLogRecord<'_>) -> Result<PlaybackLogRecord> {
        let mut logs = self.logs.lock().await;
        let dir = self.root.join(LOGS_DIR);

        let local_id = logs.next_id;
        // The high-water mark goes to disk before the record so an id is
        // never handed out twice, even across a crash.
        write_atomic(&dir.join(NEXT_ID_FILE), (local_id + 1).to_string().as_bytes()).await?;
        logs.next_id = local_id + 1;

        let record = PlaybackLogRecord {
            local_id,
            device_id: new.device_id.to_string(),
            media_id: new.media_id.to_string(),
            campaign_id: new.campaign_id.to_string(),
            played_at: new.played_at,
            synced: false,
        };

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(RECORDS_FILE))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        logs.records.push(record.clone());

        let unsynced = logs.unsynced_count();
        if unsynced > self.max_unsynced {
            // Drop down to 90% of the cap so we do not rewrite on every append.
            let target = self.max_unsynced - self.max_unsynced / 10;
            let excess = unsynced - target;
            let mut dropped = 0;
            logs.records.retain(|r| {
                if !r.synced && dropped < excess {
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
            tracing::warn!(
                "Playback log queue over capacity ({} unsynced), dropped {} oldest records",
                unsynced,
                dropped
            );
            rewrite_records(&dir, &logs.records).await?;
        }

        Ok(record)
    }

    /// All records not yet acknowledged by the server, oldest first.
    pub async fn unsynced_logs(&self) -> Vec<PlaybackLogRecord> {
        let logs = self.logs.lock().await;
        logs.records.iter().filter(|r| !r.synced).cloned().collect()
    }

    /// Every record currently retained, synced or not.
    pub async fn log_records(&self) -> Vec<PlaybackLogRecord> {
        self.logs.lock().await.records.clone()
    }

    /// Mark the given records synced. Unknown ids are ignored. Returns the
    /// number of records whose flag changed.
    pub async fn mark_logs_synced(&self, ids: &[u64]) -> Result<usize> {
        let ids: HashSet<u64> = ids.iter().copied().collect();
        let mut logs = self.logs.lock().await;

        let mut changed = 0;
        for record in logs.records.iter_mut() {
            if !record.synced && ids.contains(&record.local_id) {
                record.synced = true;
                changed += 1;
            }
        }

        if changed > 0 {
            rewrite_records(&self.root.join(LOGS_DIR), &logs.records).await?;
        }
        Ok(changed)
    }

    /// Delete synced records. Returns how many were removed.
    pub async fn prune_synced_logs(&self) -> Result<usize> {
        let mut logs = self.logs.lock().await;
        let before = logs.records.len();
        logs.records.retain(|r| !r.synced);
        let removed = before - logs.records.len();

        if removed > 0 {
            rewrite_records(&self.root.join(LOGS_DIR), &logs.records).await?;
        }
        Ok(removed)
    }
}

async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            // A corrupt record is treated as absent; the next write replaces it.
            tracing::warn!("Ignoring unreadable record {:?}: {}", path, e);
            Ok(None)
        }
    }
}

async fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json).await
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn rewrite_records(dir: &Path, records: &[PlaybackLogRecord]) -> Result<()> {
    let mut buf = Vec::with_capacity(records.len() * 160);
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    write_atomic(&dir.join(RECORDS_FILE), &buf).await
}

/// Rebuild the media index from disk, removing entries left half-written.
fn scan_media(media_root: &Path) -> Result<HashMap<String, CachedMedia>> {
    let mut index = HashMap::new();

    for entry in WalkDir::new(media_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();
        let blob = dir.join(BLOB_FILE);

        let meta: Option<CachedMedia> = fs::read(dir.join(META_FILE))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());

        match meta {
            Some(meta) if blob.is_file() => {
                index.insert(meta.media_id.clone(), meta);
            }
            _ => {
                tracing::debug!("Removing incomplete cache entry {:?}", dir);
                if let Err(e) = fs::remove_dir_all(dir) {
                    tracing::warn!("Failed to remove incomplete cache entry {:?}: {}", dir, e);
                }
            }
        }
    }

    Ok(index)
}

fn load_log_queue(dir: &Path) -> Result<LogQueueState> {
    let mut records = Vec::new();

    match fs::read_to_string(dir.join(RECORDS_FILE)) {
        Ok(content) => {
            for (lineno, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PlaybackLogRecord>(line) {
                    Ok(record) => records.push(record),
                    // a torn final line after a power cut
                    Err(e) => tracing::warn!("Skipping unreadable log record at line {}: {}", lineno + 1, e),
                }
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(AgentError::Storage(e.to_string())),
    }

    let persisted_next = fs::read_to_string(dir.join(NEXT_ID_FILE))
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(1);
    let after_records = records.iter().map(|r| r.local_id + 1).max().unwrap_or(1);

    Ok(LogQueueState {
        records,
        next_id: persisted_next.max(after_records),
    })
}
