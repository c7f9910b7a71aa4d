//! Playback scheduler.
//!
//! Walks the published playlist in a circle, one item on screen at a time.
//! Images advance on their own timer; videos advance when the display
//! reports the end of playback (or the watchdog fires). A newly published
//! playlist is adopted at the next advance; an emptied one stops playback
//! right away.

use crate::cache::MediaCache;
use crate::config::PlaybackSettings;
use crate::display::{DisplayCommand, DisplayEvent, DisplayHandle};
use crate::logs::PlaybackLog;
use crate::model::{Playlist, PlaylistItem};
use crate::sync::PlaylistStatus;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};

const MIN_IMAGE_DURATION: Duration = Duration::from_secs(1);
/// Shortest time a failed item stays on screen, so a broken playlist does
/// not spin.
const MIN_FAILURE_DWELL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackState {
    Loading,
    Playing { index: usize, media_id: String },
    Advancing { from: usize },
    Error { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Upper bound on how long a video may run without a completion signal.
    pub video_watchdog: Duration,
    /// How long to wait before retrying a playlist whose items all failed.
    pub unavailable_retry: Duration,
}

impl From<&PlaybackSettings> for SchedulerSettings {
    fn from(settings: &PlaybackSettings) -> Self {
        Self {
            video_watchdog: Duration::from_secs(settings.video_watchdog_secs.max(1)),
            unavailable_retry: Duration::from_secs(settings.unavailable_retry_secs.max(1)),
        }
    }
}

/// How one step of the loop ended.
enum Outcome {
    Advance,
    /// The published playlist has no items.
    Emptied,
    /// Every item failed to resolve in one full pass.
    Exhausted,
    Closed,
}

pub struct Scheduler {
    device_id: String,
    playlist_rx: watch::Receiver<PlaylistStatus>,
    /// False once the publisher is gone; no further playlists will arrive.
    feed_open: bool,
    /// Playlist published while an item was on screen.
    pending: Option<Arc<Playlist>>,
    cache: Arc<MediaCache>,
    log: Arc<PlaybackLog>,
    display: DisplayHandle,
    settings: SchedulerSettings,
    state_tx: watch::Sender<PlaybackState>,
    next_play_id: u64,
}

impl Scheduler {
    pub fn new(
        device_id: String,
        playlist_rx: watch::Receiver<PlaylistStatus>,
        cache: Arc<MediaCache>,
        log: Arc<PlaybackLog>,
        display: DisplayHandle,
        settings: SchedulerSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(PlaybackState::Loading);
        Self {
            device_id,
            playlist_rx,
            feed_open: true,
            pending: None,
            cache,
            log,
            display,
            settings,
            state_tx,
            next_play_id: 0,
        }
    }

    pub fn state(&self) -> watch::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }

    /// Play until the display closes or the playlist feed goes away while
    /// nothing is playable.
    pub async fn run(mut self) {
        if self.display.commands.send(DisplayCommand::Loading).is_err() {
            return;
        }

        let Some(mut playlist) = self.await_playlist().await else {
            return;
        };
        let mut index = 0;
        let mut skipped = 0;

        loop {
            let mut outcome = self.step(&playlist, index, &mut skipped).await;

            if matches!(outcome, Outcome::Advance) && self.has_update() && self.observe() {
                outcome = Outcome::Emptied;
            }

            match outcome {
                Outcome::Closed => {
                    tracing::info!("Display closed, stopping playback");
                    return;
                }
                Outcome::Emptied => {
                    self.enter_error("The playlist is empty");
                }
                Outcome::Exhausted => {
                    self.enter_error("No media in the playlist could be loaded");
                    tracing::info!(
                        "Retrying in {:?} or on the next playlist",
                        self.settings.unavailable_retry
                    );
                    tokio::select! {
                        _ = sleep(self.settings.unavailable_retry) => {}
                        changed = self.playlist_rx.changed(), if self.feed_open => {
                            if changed.is_err() {
                                self.feed_open = false;
                            }
                        }
                    }
                }
                Outcome::Advance => {
                    self.set_state(PlaybackState::Advancing { from: index });
                    if let Some(next) = self.pending.take() {
                        tracing::info!("Switching to playlist {}", next.version);
                        playlist = next;
                        skipped = 0;
                    }
                    index = (index + 1) % playlist.len();
                    continue;
                }
            }

            // recover from Emptied / Exhausted
            playlist = match self.await_playlist().await {
                Some(playlist) => playlist,
                None => return,
            };
            index = 0;
            skipped = 0;
        }
    }

    /// Resolve and show `playlist.items[index]`, then wait for it to finish.
    async fn step(&mut self, playlist: &Playlist, index: usize, skipped: &mut usize) -> Outcome {
        let item = &playlist.items[index];
        match self.cache.resolve(item).await {
            Ok(path) => {
                *skipped = 0;
                self.play(index, item, path).await
            }
            Err(e) => {
                tracing::warn!("Skipping {}: {}", item.media_id, e);
                *skipped += 1;
                if *skipped >= playlist.len() {
                    Outcome::Exhausted
                } else {
                    Outcome::Advance
                }
            }
        }
    }

    async fn play(&mut self, index: usize, item: &PlaylistItem, path: PathBuf) -> Outcome {
        // the play is on record before anything else can start
        if let Err(e) = self.log.record(&self.device_id, item).await {
            tracing::error!("Failed to record play of {}: {}", item.media_id, e);
        }

        self.next_play_id += 1;
        let play_id = self.next_play_id;
        let started = Instant::now();
        let declared = Duration::from_secs(item.duration_seconds as u64);
        tracing::debug!(
            "Playing {} {} (item {}, play {})",
            item.kind.as_str(),
            item.media_id,
            index,
            play_id
        );

        let (command, mut deadline) = if item.is_video() {
            (
                DisplayCommand::PlayVideo {
                    play_id,
                    media_id: item.media_id.clone(),
                    path,
                    duration_hint: (!declared.is_zero()).then_some(declared),
                },
                started + self.settings.video_watchdog,
            )
        } else {
            (
                DisplayCommand::ShowImage {
                    play_id,
                    media_id: item.media_id.clone(),
                    path,
                },
                started + declared.max(MIN_IMAGE_DURATION),
            )
        };

        if self.display.commands.send(command).is_err() {
            return Outcome::Closed;
        }
        self.set_state(PlaybackState::Playing {
            index,
            media_id: item.media_id.clone(),
        });

        let mut failed = false;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    if item.is_video() && !failed {
                        tracing::warn!(
                            "No end of playback for video {} after {:?}, advancing",
                            item.media_id,
                            self.settings.video_watchdog
                        );
                    }
                    return Outcome::Advance;
                }
                event = self.display.events.recv() => match event {
                    Some(DisplayEvent::PlaybackComplete { play_id: id }) if id == play_id && !failed => {
                        return Outcome::Advance;
                    }
                    Some(DisplayEvent::PlaybackFailed { play_id: id, reason }) if id == play_id => {
                        tracing::warn!("Display could not play {}: {}", item.media_id, reason);
                        failed = true;
                        deadline = started + declared.max(MIN_FAILURE_DWELL);
                    }
                    Some(DisplayEvent::Closed) | None => return Outcome::Closed,
                    Some(stale) => tracing::trace!("Ignoring stale display event {:?}", stale),
                },
                changed = self.playlist_rx.changed(), if self.feed_open => {
                    if changed.is_err() {
                        self.feed_open = false;
                    } else if self.observe() {
                        return Outcome::Emptied;
                    }
                }
            }
        }
    }

    /// Wait until a non-empty playlist is published.
    async fn await_playlist(&mut self) -> Option<Arc<Playlist>> {
        self.pending = None;
        loop {
            let status = self.playlist_rx.borrow_and_update().clone();
            match status {
                PlaylistStatus::Ready(playlist) if !playlist.is_empty() => return Some(playlist),
                PlaylistStatus::Ready(_) => self.enter_error("The playlist is empty"),
                PlaylistStatus::Unavailable => self.enter_error("No playlist available"),
                PlaylistStatus::Pending => {}
            }

            if !self.feed_open || self.playlist_rx.changed().await.is_err() {
                tracing::info!("Playlist feed closed, stopping playback");
                return None;
            }
        }
    }

    fn has_update(&self) -> bool {
        self.feed_open && self.playlist_rx.has_changed().unwrap_or(false)
    }

    /// Take in a publication. Returns true when it empties the playlist;
    /// otherwise a non-empty playlist is queued for the next advance.
    fn observe(&mut self) -> bool {
        let status = self.playlist_rx.borrow_and_update().clone();
        match status {
            PlaylistStatus::Ready(playlist) if playlist.is_empty() => true,
            PlaylistStatus::Ready(playlist) => {
                tracing::debug!("Playlist {} queued for the next advance", playlist.version);
                self.pending = Some(playlist);
                false
            }
            _ => false,
        }
    }

    fn enter_error(&mut self, reason: &str) {
        let already = matches!(&*self.state_tx.borrow(), PlaybackState::Error { reason: r } if r == reason);
        if already {
            return;
        }
        tracing::error!("Playback stopped: {}", reason);
        let _ = self.display.commands.send(DisplayCommand::ShowError {
            message: reason.to_string(),
        });
        self.set_state(PlaybackState::Error {
            reason: reason.to_string(),
        });
    }

    fn set_state(&self, state: PlaybackState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ServerClient;
    use crate::display::{link, DisplayPort};
    use crate::model::MediaKind;
    use crate::store::{NewMedia, Store};
    use chrono::Utc;
    use tempfile::TempDir;

    struct Rig {
        _dir: TempDir,
        store: Arc<Store>,
        playlist_tx: watch::Sender<PlaylistStatus>,
        port: DisplayPort,
        state: watch::Receiver<PlaybackState>,
    }

    fn offline_api() -> ServerClient {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        ServerClient::new(
            &format!("http://127.0.0.1:{}", port),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap()
    }

    fn item(id: &str, kind: MediaKind, duration_seconds: u32) -> PlaylistItem {
        PlaylistItem {
            media_id: id.into(),
            campaign_id: "c1".into(),
            url: format!("/media/{}", id),
            kind,
            duration_seconds,
            filename: id.into(),
        }
    }

    fn playlist(version: &str, items: Vec<PlaylistItem>) -> PlaylistStatus {
        PlaylistStatus::Ready(Arc::new(Playlist {
            version: version.into(),
            generated_at: Utc::now(),
            items,
        }))
    }

    async fn rig(initial: PlaylistStatus, cached: &[&str]) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), 1000).unwrap());
        for id in cached {
            store
                .put_media(
                    NewMedia {
                        media_id: id,
                        url: "/media/x",
                        filename: id,
                        etag: None,
                        content_type: None,
                    },
                    b"blob",
                )
                .await
                .unwrap();
        }

        let api = offline_api();
        let cache = Arc::new(MediaCache::new(store.clone(), api.clone(), 1, Duration::ZERO));
        let log = Arc::new(PlaybackLog::new(store.clone(), api));
        let (playlist_tx, playlist_rx) = watch::channel(initial);
        let (handle, port) = link();

        let scheduler = Scheduler::new(
            "dev-1".into(),
            playlist_rx,
            cache,
            log,
            handle,
            SchedulerSettings {
                video_watchdog: Duration::from_secs(30),
                unavailable_retry: Duration::from_secs(10),
            },
        );
        let state = scheduler.state();
        tokio::spawn(scheduler.run());

        Rig {
            _dir: dir,
            store,
            playlist_tx,
            port,
            state,
        }
    }

    async fn next_shown(port: &mut DisplayPort) -> (u64, String) {
        loop {
            match port.commands.recv().await.unwrap() {
                DisplayCommand::ShowImage { play_id, media_id, .. }
                | DisplayCommand::PlayVideo { play_id, media_id, .. } => return (play_id, media_id),
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_images_cycle_on_their_own_timers() {
        let mut rig = rig(
            playlist(
                "v1",
                vec![item("a", MediaKind::Image, 5), item("b", MediaKind::Image, 3)],
            ),
            &["a", "b"],
        )
        .await;

        assert_eq!(rig.port.commands.recv().await.unwrap(), DisplayCommand::Loading);
        let (_, first) = next_shown(&mut rig.port).await;
        let t0 = Instant::now();
        assert_eq!(first, "a");

        let (_, second) = next_shown(&mut rig.port).await;
        assert_eq!(second, "b");
        assert_eq!(t0.elapsed(), Duration::from_secs(5));

        let (_, third) = next_shown(&mut rig.port).await;
        assert_eq!(third, "a");
        assert_eq!(t0.elapsed(), Duration::from_secs(8));

        let logged: Vec<String> = rig
            .store
            .log_records()
            .await
            .into_iter()
            .map(|r| r.media_id)
            .collect();
        assert_eq!(logged, vec!["a", "b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_waits_for_its_own_completion() {
        let mut rig = rig(
            playlist(
                "v1",
                vec![item("v", MediaKind::Video, 0), item("a", MediaKind::Image, 5)],
            ),
            &["v", "a"],
        )
        .await;

        let (play_id, media_id) = next_shown(&mut rig.port).await;
        assert_eq!(media_id, "v");

        sleep(Duration::from_secs(20)).await;
        rig.port
            .events
            .send(DisplayEvent::PlaybackComplete { play_id: play_id + 100 })
            .unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!(rig.port.commands.try_recv().is_err());

        rig.port
            .events
            .send(DisplayEvent::PlaybackComplete { play_id })
            .unwrap();
        let (_, next) = next_shown(&mut rig.port).await;
        assert_eq!(next, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_watchdog_advances() {
        let mut rig = rig(
            playlist(
                "v1",
                vec![item("v", MediaKind::Video, 0), item("a", MediaKind::Image, 5)],
            ),
            &["v", "a"],
        )
        .await;

        next_shown(&mut rig.port).await;
        let t0 = Instant::now();
        let (_, next) = next_shown(&mut rig.port).await;
        assert_eq!(next, "a");
        assert_eq!(t0.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_playlist_applies_at_next_advance() {
        let mut rig = rig(
            playlist(
                "v1",
                vec![item("a", MediaKind::Image, 5), item("b", MediaKind::Image, 5)],
            ),
            &["a", "b", "c", "d", "e"],
        )
        .await;

        let (_, first) = next_shown(&mut rig.port).await;
        assert_eq!(first, "a");
        let t0 = Instant::now();

        rig.playlist_tx.send_replace(playlist(
            "v2",
            vec![
                item("c", MediaKind::Image, 5),
                item("d", MediaKind::Image, 5),
                item("e", MediaKind::Image, 5),
            ],
        ));

        // "a" finishes its slot, then index 1 of the new playlist
        let (_, next) = next_shown(&mut rig.port).await;
        assert_eq!(next, "d");
        assert_eq!(t0.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_playlist_shows_error_until_content_arrives() {
        let mut rig = rig(playlist("v1", vec![item("a", MediaKind::Image, 60)]), &["a", "b"]).await;

        let (_, first) = next_shown(&mut rig.port).await;
        assert_eq!(first, "a");

        rig.playlist_tx.send_replace(playlist("v2", vec![]));
        loop {
            if let DisplayCommand::ShowError { .. } = rig.port.commands.recv().await.unwrap() {
                break;
            }
        }
        assert!(matches!(*rig.state.borrow(), PlaybackState::Error { .. }));

        rig.playlist_tx
            .send_replace(playlist("v3", vec![item("b", MediaKind::Image, 5)]));
        let (_, next) = next_shown(&mut rig.port).await;
        assert_eq!(next, "b");
        assert!(matches!(*rig.state.borrow(), PlaybackState::Playing { ref media_id, .. } if media_id == "b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_playlist_is_an_error() {
        let mut rig = rig(PlaylistStatus::Unavailable, &[]).await;

        assert_eq!(rig.port.commands.recv().await.unwrap(), DisplayCommand::Loading);
        assert!(matches!(
            rig.port.commands.recv().await.unwrap(),
            DisplayCommand::ShowError { .. }
        ));
        assert!(rig.store.log_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_all_items_unresolvable_enters_error() {
        let mut rig = rig(
            playlist(
                "v1",
                vec![item("x", MediaKind::Image, 5), item("y", MediaKind::Image, 5)],
            ),
            &[],
        )
        .await;

        rig.state
            .wait_for(|s| matches!(s, PlaybackState::Error { .. }))
            .await
            .unwrap();
        assert!(rig.store.log_records().await.is_empty());
        assert!(rig.port.commands.try_recv().is_ok());
    }
}
