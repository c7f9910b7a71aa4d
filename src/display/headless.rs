//! Display backend for devices without a screen attached (and for tests).
//!
//! Logs what would be shown and reports a video as finished once its
//! announced length has elapsed.

use super::{DisplayCommand, DisplayEvent, DisplayPort};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

pub fn spawn_headless(mut port: DisplayPort, default_video_length: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        // (play_id, when the simulated video ends)
        let mut playing: Option<(u64, Instant)> = None;

        loop {
            let video_end = playing.map(|(_, end)| end);
            tokio::select! {
                command = port.commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("Headless display shutting down");
                        break;
                    };
                    match command {
                        DisplayCommand::Loading => {
                            playing = None;
                            tracing::info!("[display] loading");
                        }
                        DisplayCommand::ShowImage { media_id, path, .. } => {
                            playing = None;
                            tracing::info!("[display] image {} from {:?}", media_id, path);
                        }
                        DisplayCommand::PlayVideo { play_id, media_id, path, duration_hint } => {
                            let length = duration_hint.unwrap_or(default_video_length);
                            tracing::info!("[display] video {} from {:?} ({:?})", media_id, path, length);
                            playing = Some((play_id, Instant::now() + length));
                        }
                        DisplayCommand::ShowError { message } => {
                            playing = None;
                            tracing::warn!("[display] error screen: {}", message);
                        }
                        DisplayCommand::Connectivity { online } => {
                            tracing::info!("[display] {}", if online { "online" } else { "offline" });
                        }
                    }
                }
                _ = sleep_until(video_end.unwrap_or_else(Instant::now)), if video_end.is_some() => {
                    if let Some((play_id, _)) = playing.take() {
                        if port.events.send(DisplayEvent::PlaybackComplete { play_id }).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::link;
    use std::path::PathBuf;

    #[tokio::test(start_paused = true)]
    async fn test_video_completes_after_hint() {
        let (mut handle, port) = link();
        let _task = spawn_headless(port, Duration::from_secs(10));

        let started = Instant::now();
        handle
            .commands
            .send(DisplayCommand::PlayVideo {
                play_id: 4,
                media_id: "m2".into(),
                path: PathBuf::from("/tmp/m2"),
                duration_hint: Some(Duration::from_secs(3)),
            })
            .unwrap();
        handle
            .commands
            .send(DisplayCommand::Connectivity { online: false })
            .unwrap();

        let event = handle.events.recv().await.unwrap();
        assert_eq!(event, DisplayEvent::PlaybackComplete { play_id: 4 });
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_media_cancels_pending_video() {
        let (mut handle, port) = link();
        let _task = spawn_headless(port, Duration::from_secs(10));

        handle
            .commands
            .send(DisplayCommand::PlayVideo {
                play_id: 1,
                media_id: "m2".into(),
                path: PathBuf::from("/tmp/m2"),
                duration_hint: None,
            })
            .unwrap();
        handle
            .commands
            .send(DisplayCommand::ShowImage {
                play_id: 2,
                media_id: "m1".into(),
                path: PathBuf::from("/tmp/m1"),
            })
            .unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(60), handle.events.recv()).await;
        assert!(waited.is_err());
    }
}
