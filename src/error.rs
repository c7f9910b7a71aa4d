//! Error taxonomy for the playback agent.
//!
//! Every variant except `MissingDeviceId` is local and self-healing: callers
//! fall back to cached state or retry on their next tick.

use thiserror::Error;

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Connect failure, timeout, or a 5xx status from the server.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The server refused the request with a 4xx status.
    #[error("server rejected request with status {0}")]
    Rejected(u16),

    /// The server answered but the body could not be understood.
    #[error("malformed server response: {0}")]
    MalformedServerResponse(String),

    /// No playlist was ever obtained and none is cached.
    #[error("no content available")]
    NoContentAvailable,

    /// A referenced media item could not be made available locally.
    #[error("media {media_id} unavailable: {reason}")]
    PartialCacheMiss { media_id: String, reason: String },

    /// A playback log batch was not acknowledged.
    #[error("playback log delivery failed: {0}")]
    LogDeliveryFailure(String),

    /// Local persistence failed.
    #[error("local store error: {0}")]
    Storage(String),

    #[error("invalid url {0}")]
    InvalidUrl(String),

    #[error("no device id configured and no persisted identity")]
    MissingDeviceId,
}

impl AgentError {
    /// Whether retrying the same request shortly afterwards may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::NetworkUnavailable(_))
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return AgentError::MalformedServerResponse(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_client_error() {
                return AgentError::Rejected(status.as_u16());
            }
        }
        AgentError::NetworkUnavailable(err.to_string())
    }
}
