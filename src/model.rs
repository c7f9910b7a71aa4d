//! Data model shared by the agent components.
//!
//! Wire types mirror the server's JSON; persisted types carry the extra
//! bookkeeping the device needs (local ids, synced flags, cache metadata).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// The device's stable identity, persisted once per physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_code: String,
    pub area_id: String,
    pub registered_at: DateTime<Utc>,
}

/// Canonical device record as returned by `GET /devices/{device_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub device_code: String,
    pub area_id: String,
    #[serde(deserialize_with = "server_timestamp")]
    pub registered_at: DateTime<Utc>,
}

impl From<DeviceRecord> for DeviceIdentity {
    fn from(record: DeviceRecord) -> Self {
        Self {
            device_id: record.id,
            device_code: record.device_code,
            area_id: record.area_id,
            registered_at: record.registered_at,
        }
    }
}

/// Kind of media a playlist item refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// One entry of the server-issued playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub media_id: String,
    pub campaign_id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    /// Display time for images. Videos advance on end of playback instead.
    #[serde(default)]
    pub duration_seconds: u32,
    #[serde(default)]
    pub filename: String,
}

impl PlaylistItem {
    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }
}

/// A versioned, ordered playlist. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub version: String,
    #[serde(deserialize_with = "server_timestamp")]
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<PlaylistItem>,
}

impl Playlist {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether any item in this playlist refers to `media_id`.
    pub fn references(&self, media_id: &str) -> bool {
        self.items.iter().any(|item| item.media_id == media_id)
    }

    /// Same version and same item sequence. `generated_at` is ignored.
    pub fn same_content(&self, other: &Playlist) -> bool {
        self.version == other.version && self.items == other.items
    }
}

/// Metadata stored next to every cached blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMedia {
    pub media_id: String,
    pub url: String,
    #[serde(default)]
    pub filename: String,
    pub size: u64,
    /// Hex SHA-256 of the blob.
    pub content_hash: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub cached_at: DateTime<Utc>,
}

/// A locally recorded play event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackLogRecord {
    pub local_id: u64,
    pub device_id: String,
    pub media_id: String,
    pub campaign_id: String,
    pub played_at: DateTime<Utc>,
    #[serde(default)]
    pub synced: bool,
}

/// Wire shape of one play event in a `POST /playback-logs` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackLogUpload {
    pub device_id: String,
    pub media_id: String,
    pub campaign_id: String,
    pub played_at: DateTime<Utc>,
}

impl From<&PlaybackLogRecord> for PlaybackLogUpload {
    fn from(record: &PlaybackLogRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            media_id: record.media_id.clone(),
            campaign_id: record.campaign_id.clone(),
            played_at: record.played_at,
        }
    }
}

/// Accepts RFC 3339 as well as the offset-less UTC timestamps the server
/// emits (`2024-05-01T09:30:00.123456`).
fn server_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_server_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {:?}", raw)))
}

fn parse_server_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
