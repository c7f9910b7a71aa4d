//! SDL2 window and drawing for the `sdl` display backend.

use crate::config::TransitionKind;
use anyhow::{anyhow, Context, Result};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::{Color, PixelFormatEnum};
use sdl2::rect::Rect;
use sdl2::render::{BlendMode, Canvas, Texture, TextureCreator};
use sdl2::video::{Window, WindowContext};
use std::path::Path;
use std::time::{Duration, Instant};

const BACKGROUND: Color = Color::RGB(10, 10, 14);
const ERROR_BAND: Color = Color::RGB(180, 40, 40);
const OFFLINE_BADGE: Color = Color::RGB(230, 180, 40);

/// What occupies the screen besides the current slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Loading,
    Media,
    Error,
}

/// One decoded image or the latest video frame, ready to draw.
pub struct Slide<'a> {
    texture: Texture<'a>,
    width: u32,
    height: u32,
}

impl<'a> Slide<'a> {
    /// Upload a new video frame, reusing the texture when the size matches.
    pub fn update_frame(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<bool> {
        if width != self.width || height != self.height {
            return Ok(false);
        }
        self.texture
            .update(None, pixels, (width * 4) as usize)
            .context("Failed to update video texture")?;
        Ok(true)
    }
}

/// Result of processing window events.
pub enum EventResult {
    Continue,
    Quit,
}

pub struct Renderer {
    canvas: Canvas<Window>,
    event_pump: sdl2::EventPump,
    screen_width: u32,
    screen_height: u32,
    transition: TransitionKind,
    transition_duration: Duration,
    fade_started: Option<Instant>,
    started: Instant,
}

impl Renderer {
    /// Initialize SDL2 and open a borderless fullscreen window.
    pub fn new(transition: TransitionKind, transition_duration_ms: u32) -> Result<Self> {
        let sdl_context = sdl2::init().map_err(|e| anyhow!("SDL init failed: {}", e))?;
        let video_subsystem = sdl_context
            .video()
            .map_err(|e| anyhow!("SDL video init failed: {}", e))?;

        let display_mode = video_subsystem
            .desktop_display_mode(0)
            .map_err(|e| anyhow!("Failed to get display mode: {}", e))?;
        let screen_width = display_mode.w as u32;
        let screen_height = display_mode.h as u32;

        tracing::info!("Creating fullscreen window: {}x{}", screen_width, screen_height);

        let window = video_subsystem
            .window("Screendeck Player", screen_width, screen_height)
            .fullscreen_desktop()
            .build()
            .context("Failed to create window")?;

        let mut canvas = window
            .into_canvas()
            .accelerated()
            .present_vsync()
            .build()
            .context("Failed to create canvas")?;
        canvas.set_blend_mode(BlendMode::Blend);

        sdl_context.mouse().show_cursor(false);

        canvas.set_draw_color(BACKGROUND);
        canvas.clear();
        canvas.present();

        let event_pump = sdl_context
            .event_pump()
            .map_err(|e| anyhow!("Failed to get event pump: {}", e))?;

        Ok(Self {
            canvas,
            event_pump,
            screen_width,
            screen_height,
            transition,
            transition_duration: Duration::from_millis(transition_duration_ms as u64),
            fade_started: None,
            started: Instant::now(),
        })
    }

    pub fn texture_creator(&self) -> TextureCreator<WindowContext> {
        self.canvas.texture_creator()
    }

    /// Decode an image file into a slide.
    pub fn load_image<'a>(
        &self,
        texture_creator: &'a TextureCreator<WindowContext>,
        path: &Path,
    ) -> Result<Slide<'a>> {
        let img = image::open(path).with_context(|| format!("Failed to open image {:?}", path))?;
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        self.slide_from_pixels(texture_creator, rgba.as_raw(), width, height)
    }

    /// Wrap raw RGBA pixels (a video frame) into a slide.
    pub fn slide_from_pixels<'a>(
        &self,
        texture_creator: &'a TextureCreator<WindowContext>,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Slide<'a>> {
        // ABGR8888 is RGBA byte order on little-endian targets
        let mut texture = texture_creator
            .create_texture_streaming(PixelFormatEnum::ABGR8888, width, height)
            .context("Failed to create texture")?;
        texture
            .update(None, pixels, (width * 4) as usize)
            .context("Failed to upload texture")?;
        texture.set_blend_mode(BlendMode::Blend);

        Ok(Slide {
            texture,
            width,
            height,
        })
    }

    /// Fade the next slide in from black.
    pub fn start_transition(&mut self) {
        if self.transition == TransitionKind::Fade && !self.transition_duration.is_zero() {
            self.fade_started = Some(Instant::now());
        }
    }

    fn slide_alpha(&mut self) -> u8 {
        let Some(started) = self.fade_started else {
            return 255;
        };
        let progress = started.elapsed().as_secs_f32() / self.transition_duration.as_secs_f32();
        if progress >= 1.0 {
            self.fade_started = None;
            255
        } else {
            (progress * 255.0) as u8
        }
    }

    /// Largest rectangle with the image's aspect ratio that fits the screen,
    /// centred.
    fn aspect_fit(&self, img_width: u32, img_height: u32) -> Rect {
        let screen_ratio = self.screen_width as f32 / self.screen_height as f32;
        let img_ratio = img_width as f32 / img_height.max(1) as f32;

        let (fit_width, fit_height) = if img_ratio > screen_ratio {
            (self.screen_width, (self.screen_width as f32 / img_ratio) as u32)
        } else {
            ((self.screen_height as f32 * img_ratio) as u32, self.screen_height)
        };

        let x = (self.screen_width.saturating_sub(fit_width) / 2) as i32;
        let y = (self.screen_height.saturating_sub(fit_height) / 2) as i32;
        Rect::new(x, y, fit_width.max(1), fit_height.max(1))
    }

    pub fn draw(&mut self, screen: Screen, slide: Option<&mut Slide>, offline: bool) -> Result<()> {
        self.canvas.set_draw_color(BACKGROUND);
        self.canvas.clear();

        match screen {
            Screen::Media => {
                if let Some(slide) = slide {
                    let alpha = self.slide_alpha();
                    let dest = self.aspect_fit(slide.width, slide.height);
                    slide.texture.set_alpha_mod(alpha);
                    self.canvas
                        .copy(&slide.texture, None, dest)
                        .map_err(|e| anyhow!("Failed to draw slide: {}", e))?;
                }
            }
            Screen::Loading => self.draw_loading()?,
            Screen::Error => self.draw_error()?,
        }

        if offline {
            self.draw_offline_badge()?;
        }

        self.canvas.present();
        Ok(())
    }

    /// A slowly pulsing square in the middle of the screen.
    fn draw_loading(&mut self) -> Result<()> {
        let phase = (self.started.elapsed().as_secs_f32() * 2.0).sin() * 0.5 + 0.5;
        let size = (self.screen_height / 12).max(8);
        let rect = Rect::from_center(
            ((self.screen_width / 2) as i32, (self.screen_height / 2) as i32),
            size,
            size,
        );
        self.canvas
            .set_draw_color(Color::RGBA(200, 200, 210, (60.0 + phase * 195.0) as u8));
        self.canvas
            .fill_rect(rect)
            .map_err(|e| anyhow!("Failed to draw loading indicator: {}", e))
    }

    /// A red band across the screen, visible from across a room.
    fn draw_error(&mut self) -> Result<()> {
        let band_height = (self.screen_height / 6).max(8);
        let rect = Rect::new(
            0,
            ((self.screen_height - band_height) / 2) as i32,
            self.screen_width,
            band_height,
        );
        self.canvas.set_draw_color(ERROR_BAND);
        self.canvas
            .fill_rect(rect)
            .map_err(|e| anyhow!("Failed to draw error screen: {}", e))
    }

    fn draw_offline_badge(&mut self) -> Result<()> {
        let width = (self.screen_width / 16).max(16);
        let height = (self.screen_height / 40).max(6);
        let margin = (self.screen_height / 40).max(4);
        let rect = Rect::new(
            (self.screen_width - width - margin) as i32,
            margin as i32,
            width,
            height,
        );
        self.canvas.set_draw_color(OFFLINE_BADGE);
        self.canvas
            .fill_rect(rect)
            .map_err(|e| anyhow!("Failed to draw offline badge: {}", e))
    }

    /// Process SDL events. Escape or Q quits.
    pub fn process_events(&mut self) -> EventResult {
        for event in self.event_pump.poll_iter() {
            match event {
                Event::Quit { .. }
                | Event::KeyDown {
                    keycode: Some(Keycode::Escape),
                    ..
                }
                | Event::KeyDown {
                    keycode: Some(Keycode::Q),
                    ..
                } => return EventResult::Quit,
                _ => {}
            }
        }
        EventResult::Continue
    }

    /// Sleep for a short duration to limit frame rate.
    pub fn frame_delay(&self) {
        std::thread::sleep(Duration::from_millis(16));
    }
}
