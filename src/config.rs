//! Agent settings.
//!
//! Loaded from an optional TOML file layered under `SCREENDECK_*` environment
//! variables. Every field has a default so an empty environment still yields a
//! runnable (if device-less) configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "player.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Device id handed over by the provisioning flow, if any.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub intervals: IntervalSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub logs: LogSettings,
    #[serde(default)]
    pub playback: PlaybackSettings,
    #[serde(default)]
    pub identity: IdentitySettings,
    #[serde(default)]
    pub display: DisplaySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_media_timeout_secs")]
    pub media_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntervalSettings {
    #[serde(default = "default_playlist_sync_secs")]
    pub playlist_sync_secs: u64,
    #[serde(default = "default_log_flush_secs")]
    pub log_flush_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Download attempts per item per sync cycle.
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// Unsynced records kept before the oldest are dropped.
    #[serde(default = "default_max_unsynced")]
    pub max_unsynced: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackSettings {
    #[serde(default = "default_video_watchdog_secs")]
    pub video_watchdog_secs: u64,
    #[serde(default = "default_unavailable_retry_secs")]
    pub unavailable_retry_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentitySettings {
    /// Re-fetch the device record at startup even if one is persisted.
    #[serde(default)]
    pub refresh_on_start: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayBackend {
    #[default]
    Headless,
    Sdl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Cut,
    #[default]
    Fade,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplaySettings {
    #[serde(default)]
    pub backend: DisplayBackend,
    #[serde(default)]
    pub transition: TransitionKind,
    #[serde(default = "default_transition_duration_ms")]
    pub transition_duration_ms: u32,
    /// Simulated length of a video without a duration on the headless backend.
    #[serde(default = "default_headless_video_secs")]
    pub headless_video_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_id: None,
            data_dir: default_data_dir(),
            server: ServerSettings::default(),
            intervals: IntervalSettings::default(),
            cache: CacheSettings::default(),
            logs: LogSettings::default(),
            playback: PlaybackSettings::default(),
            identity: IdentitySettings::default(),
            display: DisplaySettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            media_timeout_secs: default_media_timeout_secs(),
        }
    }
}

impl Default for IntervalSettings {
    fn default() -> Self {
        Self {
            playlist_sync_secs: default_playlist_sync_secs(),
            log_flush_secs: default_log_flush_secs(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            fetch_attempts: default_fetch_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            max_unsynced: default_max_unsynced(),
        }
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            video_watchdog_secs: default_video_watchdog_secs(),
            unavailable_retry_secs: default_unavailable_retry_secs(),
        }
    }
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            backend: DisplayBackend::default(),
            transition: TransitionKind::default(),
            transition_duration_ms: default_transition_duration_ms(),
            headless_video_secs: default_headless_video_secs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_base_url() -> String {
    "http://localhost:8000/api".into()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_media_timeout_secs() -> u64 {
    120
}

fn default_playlist_sync_secs() -> u64 {
    15 * 60
}

fn default_log_flush_secs() -> u64 {
    60
}

fn default_heartbeat_secs() -> u64 {
    5 * 60
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_unsynced() -> usize {
    100_000
}

fn default_video_watchdog_secs() -> u64 {
    15 * 60
}

fn default_unavailable_retry_secs() -> u64 {
    30
}

fn default_transition_duration_ms() -> u32 {
    500
}

fn default_headless_video_secs() -> u64 {
    10
}

impl Settings {
    /// Load settings from `SCREENDECK_CONFIG` (or `player.toml`) and the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var("SCREENDECK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    /// Load settings from a specific file, still honouring environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("SCREENDECK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let settings: Settings = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        Ok(settings.normalized())
    }

    /// Treat a blank device id as absent.
    fn normalized(mut self) -> Self {
        if self
            .device_id
            .as_deref()
            .map(|id| id.trim().is_empty())
            .unwrap_or(false)
        {
            self.device_id = None;
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_secs(self.server.media_timeout_secs)
    }
}

impl IntervalSettings {
    pub fn playlist_sync(&self) -> Duration {
        Duration::from_secs(self.playlist_sync_secs.max(1))
    }

    pub fn log_flush(&self) -> Duration {
        Duration::from_secs(self.log_flush_secs.max(1))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.device_id.is_none());
        assert_eq!(settings.intervals.playlist_sync(), Duration::from_secs(900));
        assert_eq!(settings.intervals.log_flush(), Duration::from_secs(60));
        assert_eq!(settings.intervals.heartbeat(), Duration::from_secs(300));
        assert_eq!(settings.cache.fetch_attempts, 3);
        assert_eq!(settings.display.backend, DisplayBackend::Headless);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
device_id = "  "
data_dir = "/var/lib/screendeck"

[server]
base_url = "https://signage.example.com/api"

[intervals]
heartbeat_secs = 30

[display]
backend = "sdl"
transition = "cut"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert!(settings.device_id.is_none());
        assert_eq!(settings.data_dir, PathBuf::from("/var/lib/screendeck"));
        assert_eq!(settings.server.base_url, "https://signage.example.com/api");
        assert_eq!(settings.server.request_timeout_secs, 10);
        assert_eq!(settings.intervals.heartbeat_secs, 30);
        assert_eq!(settings.intervals.playlist_sync_secs, 900);
        assert_eq!(settings.display.backend, DisplayBackend::Sdl);
        assert_eq!(settings.display.transition, TransitionKind::Cut);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.logs.max_unsynced, 100_000);
    }
}
