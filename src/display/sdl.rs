//! Fullscreen SDL2/GStreamer display backend.
//!
//! SDL windows are not `Send`, so the render loop owns a dedicated OS thread
//! and polls the command channel once per frame.

use super::renderer::{EventResult, Renderer, Screen, Slide};
use super::video::{PlaybackStatus, VideoPlayer};
use super::{DisplayCommand, DisplayEvent, DisplayPort};
use crate::config::DisplaySettings;
use anyhow::{anyhow, Context, Result};
use sdl2::render::TextureCreator;
use sdl2::video::WindowContext;
use std::sync::mpsc::SyncSender;
use std::thread::JoinHandle;
use tokio::sync::mpsc::error::TryRecvError;

/// Open the window on its own thread. Returns once the window is up, or with
/// the initialization error.
pub fn spawn_sdl(port: DisplayPort, settings: DisplaySettings) -> Result<JoinHandle<()>> {
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

    let handle = std::thread::Builder::new()
        .name("display".into())
        .spawn(move || {
            if let Err(e) = run(port, settings, ready_tx) {
                tracing::error!("Display loop failed: {:#}", e);
            }
        })
        .context("Failed to spawn display thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(message)) => Err(anyhow!(message)),
        Err(_) => Err(anyhow!("Display thread exited during startup")),
    }
}

struct Stage<'a> {
    screen: Screen,
    slide: Option<Slide<'a>>,
    video: Option<(u64, VideoPlayer)>,
    offline: bool,
}

impl<'a> Stage<'a> {
    fn clear(&mut self, screen: Screen) {
        self.video = None;
        self.slide = None;
        self.screen = screen;
    }
}

fn run(mut port: DisplayPort, settings: DisplaySettings, ready: SyncSender<Result<(), String>>) -> Result<()> {
    let init = VideoPlayer::init()
        .and_then(|()| Renderer::new(settings.transition, settings.transition_duration_ms));
    let mut renderer = match init {
        Ok(renderer) => {
            let _ = ready.send(Ok(()));
            renderer
        }
        Err(e) => {
            let _ = ready.send(Err(format!("{:#}", e)));
            return Err(e);
        }
    };

    let texture_creator = renderer.texture_creator();
    let mut stage = Stage {
        screen: Screen::Loading,
        slide: None,
        video: None,
        offline: false,
    };

    loop {
        if let EventResult::Quit = renderer.process_events() {
            tracing::info!("Display closed by user");
            let _ = port.events.send(DisplayEvent::Closed);
            return Ok(());
        }

        loop {
            match port.commands.try_recv() {
                Ok(command) => apply(command, &mut renderer, &texture_creator, &mut stage, &port),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::debug!("Display link closed");
                    return Ok(());
                }
            }
        }

        pump_video(&renderer, &texture_creator, &mut stage, &port);

        renderer.draw(stage.screen, stage.slide.as_mut(), stage.offline)?;
        renderer.frame_delay();
    }
}

fn apply<'a>(
    command: DisplayCommand,
    renderer: &mut Renderer,
    texture_creator: &'a TextureCreator<WindowContext>,
    stage: &mut Stage<'a>,
    port: &DisplayPort,
) {
    match command {
        DisplayCommand::Loading => stage.clear(Screen::Loading),
        DisplayCommand::ShowImage {
            play_id,
            media_id,
            path,
        } => {
            stage.clear(Screen::Media);
            match renderer.load_image(texture_creator, &path) {
                Ok(slide) => {
                    tracing::debug!("Showing image {}", media_id);
                    stage.slide = Some(slide);
                    renderer.start_transition();
                }
                Err(e) => {
                    tracing::warn!("Cannot show image {}: {:#}", media_id, e);
                    let _ = port.events.send(DisplayEvent::PlaybackFailed {
                        play_id,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }
        DisplayCommand::PlayVideo {
            play_id,
            media_id,
            path,
            ..
        } => {
            stage.clear(Screen::Media);
            let started = VideoPlayer::open(&path).and_then(|player| {
                player.play()?;
                Ok(player)
            });
            match started {
                Ok(player) => {
                    tracing::debug!("Playing video {}", media_id);
                    stage.video = Some((play_id, player));
                    renderer.start_transition();
                }
                Err(e) => {
                    tracing::warn!("Cannot play video {}: {:#}", media_id, e);
                    let _ = port.events.send(DisplayEvent::PlaybackFailed {
                        play_id,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }
        DisplayCommand::ShowError { message } => {
            tracing::debug!("Error screen: {}", message);
            stage.clear(Screen::Error);
        }
        DisplayCommand::Connectivity { online } => stage.offline = !online,
    }
}

/// Upload the newest frame and report end of stream or failure.
fn pump_video<'a>(
    renderer: &Renderer,
    texture_creator: &'a TextureCreator<WindowContext>,
    stage: &mut Stage<'a>,
    port: &DisplayPort,
) {
    let Some((play_id, player)) = stage.video.as_mut() else {
        return;
    };
    let play_id = *play_id;

    if let Some(frame) = player.take_frame() {
        let reused = match stage.slide.as_mut() {
            Some(slide) => slide
                .update_frame(&frame.pixels, frame.width, frame.height)
                .unwrap_or(false),
            None => false,
        };
        if !reused {
            match renderer.slide_from_pixels(texture_creator, &frame.pixels, frame.width, frame.height) {
                Ok(slide) => stage.slide = Some(slide),
                Err(e) => tracing::warn!("Dropped video frame: {:#}", e),
            }
        }
    }

    let event = match player.poll() {
        PlaybackStatus::Playing => return,
        PlaybackStatus::Ended => DisplayEvent::PlaybackComplete { play_id },
        PlaybackStatus::Failed(reason) => DisplayEvent::PlaybackFailed { play_id, reason },
    };
    // the last frame stays on screen until the next item arrives
    stage.video = None;
    let _ = port.events.send(event);
}
