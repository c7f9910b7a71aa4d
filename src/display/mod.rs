//! Display backends.
//!
//! The scheduler never renders directly. It sends `DisplayCommand`s to a
//! backend and receives `DisplayEvent`s (video finished, playback failed,
//! window closed) back over channels, so a backend may live on its own
//! thread.

mod headless;
#[cfg(feature = "sdl")]
mod renderer;
#[cfg(feature = "sdl")]
mod sdl;
#[cfg(feature = "sdl")]
mod video;

pub use headless::spawn_headless;
#[cfg(feature = "sdl")]
pub use sdl::spawn_sdl;

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Instructions from the scheduler to the display.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayCommand {
    /// Waiting for the first playlist.
    Loading,
    ShowImage {
        play_id: u64,
        media_id: String,
        path: PathBuf,
    },
    PlayVideo {
        play_id: u64,
        media_id: String,
        path: PathBuf,
        /// Length announced by the playlist, when it carries one.
        duration_hint: Option<Duration>,
    },
    ShowError {
        message: String,
    },
    /// Toggle the offline badge.
    Connectivity {
        online: bool,
    },
}

/// Notifications from the display back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayEvent {
    /// Native end of playback for the video started as `play_id`.
    PlaybackComplete { play_id: u64 },
    /// The media started as `play_id` could not be rendered.
    PlaybackFailed { play_id: u64, reason: String },
    /// The display went away (window closed, backend crashed).
    Closed,
}

/// Scheduler side of the display link.
pub struct DisplayHandle {
    pub commands: mpsc::UnboundedSender<DisplayCommand>,
    pub events: mpsc::UnboundedReceiver<DisplayEvent>,
}

/// Backend side of the display link.
pub struct DisplayPort {
    pub commands: mpsc::UnboundedReceiver<DisplayCommand>,
    pub events: mpsc::UnboundedSender<DisplayEvent>,
}

/// Create a connected handle/port pair.
pub fn link() -> (DisplayHandle, DisplayPort) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        DisplayHandle {
            commands: command_tx,
            events: event_rx,
        },
        DisplayPort {
            commands: command_rx,
            events: event_tx,
        },
    )
}
