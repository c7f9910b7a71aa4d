//! In-process mock of the signage server.
//!
//! Serves `/api/playlist/:device_id`, `/api/playback-logs`,
//! `/api/devices/:id[/heartbeat]` and `/media/:name` from shared state the
//! tests mutate directly.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use screendeck_player::api::ServerClient;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct MockState {
    /// When false every route answers 503.
    pub online: AtomicBool,
    pub playlist_body: Mutex<Option<String>>,
    pub playlist_delay: Mutex<Duration>,
    pub playlist_started: AtomicUsize,
    pub playlist_completed: AtomicUsize,
    pub media: Mutex<HashMap<String, Vec<u8>>>,
    pub media_requests: Mutex<Vec<String>>,
    /// Answer this many media requests with 503 before serving.
    pub media_failures: AtomicUsize,
    pub reject_logs: AtomicBool,
    pub log_batches: Mutex<Vec<Vec<serde_json::Value>>>,
    pub heartbeats: AtomicUsize,
    pub devices: Mutex<HashMap<String, serde_json::Value>>,
}

impl MockState {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

pub struct MockServer {
    pub base_url: String,
    pub state: Arc<MockState>,
    _task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        state.online.store(true, Ordering::SeqCst);

        let app = Router::new()
            .route("/api/playlist/:device_id", get(playlist))
            .route("/api/playback-logs", post(playback_logs))
            .route("/api/devices/:id", get(device))
            .route("/api/devices/:id/heartbeat", post(heartbeat))
            .route("/media/:name", get(media))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}/api", addr),
            state,
            _task: task,
        }
    }

    pub fn client(&self) -> ServerClient {
        ServerClient::new(&self.base_url, Duration::from_secs(5), Duration::from_secs(5)).unwrap()
    }

    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::SeqCst);
    }

    pub fn set_playlist(&self, body: impl Into<String>) {
        *self.state.playlist_body.lock().unwrap() = Some(body.into());
    }

    pub fn add_media(&self, name: &str, bytes: &[u8]) {
        self.state
            .media
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
    }

    pub fn add_device(&self, id: &str, device_code: &str, area_id: &str) {
        self.state.devices.lock().unwrap().insert(
            id.to_string(),
            serde_json::json!({
                "id": id,
                "device_code": device_code,
                "area_id": area_id,
                "registered_at": "2024-03-01T09:00:00",
            }),
        );
    }

    /// How many times `name` was requested from `/media`.
    pub fn media_hits(&self, name: &str) -> usize {
        self.state
            .media_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.as_str() == name)
            .count()
    }

    pub fn log_batches(&self) -> Vec<Vec<serde_json::Value>> {
        self.state.log_batches.lock().unwrap().clone()
    }
}

/// Playlist JSON with `(media_id, type, duration_seconds)` items served from
/// `/media/<media_id>`.
pub fn playlist_json(version: &str, items: &[(&str, &str, u32)]) -> String {
    let items: Vec<serde_json::Value> = items
        .iter()
        .map(|(id, kind, duration)| {
            serde_json::json!({
                "media_id": id,
                "campaign_id": "camp-1",
                "url": format!("/media/{}", id),
                "type": kind,
                "duration_seconds": duration,
                "filename": format!("{}.bin", id),
            })
        })
        .collect();
    serde_json::json!({
        "version": version,
        "generated_at": "2024-03-01T10:00:00.250000",
        "items": items,
    })
    .to_string()
}

/// A URL nothing listens on.
pub fn unreachable_base_url() -> String {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    format!("http://127.0.0.1:{}/api", port)
}

async fn playlist(State(state): State<Arc<MockState>>, Path(_device_id): Path<String>) -> Response {
    state.playlist_started.fetch_add(1, Ordering::SeqCst);
    let delay = *state.playlist_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let response = if !state.is_online() {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else {
        let body = state.playlist_body.lock().unwrap().clone();
        match body {
            Some(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    };
    state.playlist_completed.fetch_add(1, Ordering::SeqCst);
    response
}

async fn media(State(state): State<Arc<MockState>>, Path(name): Path<String>) -> Response {
    state.media_requests.lock().unwrap().push(name.clone());
    if !state.is_online() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let failing = state
        .media_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let bytes = state.media.lock().unwrap().get(&name).cloned();
    match bytes {
        Some(bytes) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::ETAG, format!("\"{}-{}\"", name, bytes.len())),
            ],
            Bytes::from(bytes),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn playback_logs(
    State(state): State<Arc<MockState>>,
    Json(batch): Json<Vec<serde_json::Value>>,
) -> Response {
    if !state.is_online() || state.reject_logs.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    state.log_batches.lock().unwrap().push(batch);
    StatusCode::CREATED.into_response()
}

async fn device(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    if !state.is_online() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let record = state.devices.lock().unwrap().get(&id).cloned();
    match record {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn heartbeat(State(state): State<Arc<MockState>>, Path(_id): Path<String>) -> Response {
    if !state.is_online() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    state.heartbeats.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT.into_response()
}
