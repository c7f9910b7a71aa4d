//! HTTP client for the signage server.
//!
//! Every call is bounded by a timeout; callers map failures onto their own
//! fallback behaviour.

use crate::error::{AgentError, Result};
use crate::model::{DeviceRecord, Playlist, PlaybackLogUpload};
use reqwest::header::{HeaderName, CONTENT_TYPE, ETAG};
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// A media blob fetched from its origin.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
}

/// Thin wrapper around a `reqwest::Client` that knows the server's routes.
#[derive(Debug, Clone)]
pub struct ServerClient {
    client: Client,
    base_url: Url,
    media_timeout: Duration,
}

impl ServerClient {
    pub fn new(base_url: &str, request_timeout: Duration, media_timeout: Duration) -> Result<Self> {
        // a trailing slash keeps the last path segment when joining
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| AgentError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| AgentError::NetworkUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            media_timeout,
        })
    }

    /// Build an endpoint URL from raw path segments, percent-encoding each.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let path = segments
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        self.base_url
            .join(&path)
            .map_err(|e| AgentError::InvalidUrl(format!("{}: {}", path, e)))
    }

    /// Resolve a media URL from the playlist. Relative URLs are served by the
    /// API server itself.
    pub fn media_url(&self, url: &str) -> Result<Url> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Url::parse(url)
        } else {
            let origin = self.base_url.join("/").unwrap_or_else(|_| self.base_url.clone());
            origin.join(url)
        }
        .map_err(|e| AgentError::MalformedServerResponse(format!("bad media url {}: {}", url, e)))
    }

    /// `GET /playlist/{device_id}`
    pub async fn fetch_playlist(&self, device_id: &str) -> Result<Playlist> {
        let url = self.endpoint(&["playlist", device_id])?;
        tracing::debug!("Fetching playlist from {}", url);

        let response = self.client.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| AgentError::MalformedServerResponse(format!("playlist: {}", e)))
    }

    /// `GET {url}` for one media item.
    pub async fn fetch_media(&self, url: &str) -> Result<FetchedMedia> {
        let url = self.media_url(url)?;
        tracing::debug!("Downloading {}", url);

        let response = self
            .client
            .get(url)
            .timeout(self.media_timeout)
            .send()
            .await?
            .error_for_status()?;

        let etag = header_value(&response, ETAG);
        let content_type = header_value(&response, CONTENT_TYPE);

        let bytes = response.bytes().await?;
        Ok(FetchedMedia {
            bytes: bytes.to_vec(),
            etag,
            content_type,
        })
    }

    /// `POST /playback-logs` with the whole batch. Success acknowledges every
    /// record in it.
    pub async fn submit_playback_logs(&self, logs: &[PlaybackLogUpload]) -> Result<()> {
        let url = self.endpoint(&["playback-logs"])?;
        self.client
            .post(url)
            .json(logs)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// `POST /devices/{device_id}/heartbeat`
    pub async fn heartbeat(&self, device_id: &str) -> Result<()> {
        let url = self.endpoint(&["devices", device_id, "heartbeat"])?;
        self.client.post(url).send().await?.error_for_status()?;
        Ok(())
    }

    /// `GET /devices/{device_id}` (public device record)
    pub async fn fetch_device(&self, device_id: &str) -> Result<DeviceRecord> {
        let url = self.endpoint(&["devices", device_id])?;
        let response = self.client.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| AgentError::MalformedServerResponse(format!("device record: {}", e)))
    }
}

fn header_value(response: &reqwest::Response, name: HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ServerClient {
        ServerClient::new(base, Duration::from_secs(1), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let api = client("http://signage.local:8000/api");
        let url = api.endpoint(&["playlist", "d1"]).unwrap();
        assert_eq!(url.as_str(), "http://signage.local:8000/api/playlist/d1");
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let api = client("http://signage.local/api/");
        let url = api.endpoint(&["devices", "a/b c", "heartbeat"]).unwrap();
        assert_eq!(url.as_str(), "http://signage.local/api/devices/a%2Fb%20c/heartbeat");
    }

    #[test]
    fn test_media_url_resolution() {
        let api = client("http://signage.local:8000/api");
        assert_eq!(
            api.media_url("https://storage.googleapis.com/bucket/m1.jpg")
                .unwrap()
                .as_str(),
            "https://storage.googleapis.com/bucket/m1.jpg"
        );
        assert_eq!(
            api.media_url("/uploads/m1.jpg").unwrap().as_str(),
            "http://signage.local:8000/uploads/m1.jpg"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ServerClient::new("not a url", Duration::from_secs(1), Duration::from_secs(1)).is_err());
    }
}
