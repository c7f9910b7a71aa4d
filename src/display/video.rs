//! GStreamer video playback for the `sdl` display backend.
//!
//! Decodes into RGBA frames pulled by the render loop. End of stream is
//! reported to the scheduler as the item's playback-complete signal.

use anyhow::{Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Decoded RGBA frame.
pub struct VideoFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Where a player is in its lifecycle, as observed from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Ended,
    Failed(String),
}

pub struct VideoPlayer {
    pipeline: gst::Pipeline,
    bus: gst::Bus,
    latest_frame: Arc<Mutex<Option<VideoFrame>>>,
    status: PlaybackStatus,
}

impl VideoPlayer {
    /// Initialize GStreamer. Call once per process.
    pub fn init() -> Result<()> {
        gst::init().context("Failed to initialize GStreamer")?;
        tracing::info!("GStreamer initialized: {}", gst::version_string());
        Ok(())
    }

    /// Build a paused pipeline for a local file.
    pub fn open(path: &Path) -> Result<Self> {
        let path = std::fs::canonicalize(path)
            .with_context(|| format!("Video file {:?} is not accessible", path))?;
        let uri = format!("file://{}", path.display());
        tracing::debug!("Creating video pipeline for {}", uri);

        let pipeline = gst::Pipeline::new();

        let src = gst::ElementFactory::make("uridecodebin")
            .property("uri", &uri)
            .build()
            .context("Failed to create uridecodebin")?;
        let convert = gst::ElementFactory::make("videoconvert")
            .build()
            .context("Failed to create videoconvert")?;
        let scale = gst::ElementFactory::make("videoscale")
            .build()
            .context("Failed to create videoscale")?;
        let appsink = gst_app::AppSink::builder()
            .caps(
                &gst_video::VideoCapsBuilder::new()
                    .format(gst_video::VideoFormat::Rgba)
                    .build(),
            )
            .build();

        pipeline
            .add_many([&src, &convert, &scale, appsink.upcast_ref()])
            .context("Failed to add elements to pipeline")?;
        gst::Element::link_many([&convert, &scale, appsink.upcast_ref()])
            .context("Failed to link elements")?;

        // uridecodebin exposes its pads only once the stream is typed
        let convert_weak = convert.downgrade();
        src.connect_pad_added(move |_src, src_pad| {
            let Some(convert) = convert_weak.upgrade() else {
                return;
            };
            let Some(sink_pad) = convert.static_pad("sink") else {
                return;
            };
            if sink_pad.is_linked() {
                return;
            }

            let caps = src_pad
                .current_caps()
                .unwrap_or_else(|| src_pad.query_caps(None));
            let is_video = caps
                .structure(0)
                .map(|s| s.name().starts_with("video/"))
                .unwrap_or(false);

            // audio pads are left unlinked; signage plays muted
            if is_video {
                if let Err(e) = src_pad.link(&sink_pad) {
                    tracing::error!("Failed to link decoder pad: {:?}", e);
                }
            }
        });

        let latest_frame = Arc::new(Mutex::new(None::<VideoFrame>));
        let frame_slot = latest_frame.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let info =
                        gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                    if let Ok(mut slot) = frame_slot.lock() {
                        *slot = Some(VideoFrame {
                            pixels: map.as_slice().to_vec(),
                            width: info.width(),
                            height: info.height(),
                        });
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let bus = pipeline
            .bus()
            .ok_or_else(|| anyhow::anyhow!("Pipeline has no bus"))?;

        Ok(Self {
            pipeline,
            bus,
            latest_frame,
            status: PlaybackStatus::Playing,
        })
    }

    /// Start or resume the pipeline.
    pub fn play(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set pipeline to playing")?;
        Ok(())
    }

    /// Tear the pipeline down. Errors are ignored.
    pub fn stop(&self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            tracing::warn!("Failed to stop video pipeline: {:?}", e);
        }
    }

    /// Drain pending bus messages and return the resulting status.
    pub fn poll(&mut self) -> PlaybackStatus {
        while let Some(msg) = self.bus.pop() {
            match msg.view() {
                gst::MessageView::Eos(_) => {
                    self.status = PlaybackStatus::Ended;
                }
                gst::MessageView::Error(err) => {
                    tracing::error!("GStreamer error: {} ({:?})", err.error(), err.debug());
                    self.status = PlaybackStatus::Failed(err.error().to_string());
                }
                _ => {}
            }
        }
        self.status.clone()
    }

    /// Take the most recent decoded frame, if a new one arrived.
    pub fn take_frame(&self) -> Option<VideoFrame> {
        self.latest_frame.lock().ok()?.take()
    }
}

impl Drop for VideoPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
