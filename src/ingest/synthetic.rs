//! Synthetic frame source (`stub://`).
//!
//! Renders a moving gradient and encodes it as a real JPEG, so a browser
//! pointed at `/stream` shows motion without any camera attached.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::{BufferPool, Frame, FrameSource, SourceStats};

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Source name, e.g. "stub://camera".
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
    /// Number of frame buffers that may be in flight at once.
    pub buffer_count: usize,
    /// Fail every capture after this many frames. `None` never fails.
    pub frame_limit: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://camera".to_string(),
            width: 320,
            height: 240,
            jpeg_quality: 80,
            buffer_count: 2,
            frame_limit: None,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    pool: BufferPool,
    pixels: Vec<u8>,
    frame_count: u64,
    phase: u8,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!(
                "synthetic source needs non-zero dimensions, got {}x{}",
                config.width,
                config.height
            ));
        }
        let pixel_len = config.width as usize * config.height as usize * 3;
        Ok(Self {
            pool: BufferPool::new(config.buffer_count),
            pixels: vec![0u8; pixel_len],
            frame_count: 0,
            phase: rand::random::<u8>(),
            config,
        })
    }

    fn render(&mut self) {
        let width = self.config.width as usize;
        let shift = self.phase as usize;
        for (i, pixel) in self.pixels.chunks_exact_mut(3).enumerate() {
            let x = i % width;
            let y = i / width;
            pixel[0] = ((x + shift) % 256) as u8;
            pixel[1] = ((y + shift / 2) % 256) as u8;
            pixel[2] = (((x + y) / 2 + shift) % 256) as u8;
        }
        self.phase = self.phase.wrapping_add(4);
    }

    fn encode_into(&self, buffer: &mut Vec<u8>) -> Result<()> {
        let mut encoder = JpegEncoder::new_with_quality(&mut *buffer, self.config.jpeg_quality);
        encoder
            .encode(
                &self.pixels,
                self.config.width,
                self.config.height,
                ExtendedColorType::Rgb8,
            )
            .context("encode synthetic jpeg")
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: connected to {} ({}x{})",
            self.config.name,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn acquire(&mut self) -> Result<Frame> {
        if let Some(limit) = self.config.frame_limit {
            if self.frame_count >= limit {
                return Err(anyhow!(
                    "{} stopped producing frames after {}",
                    self.config.name,
                    limit
                ));
            }
        }

        let mut buffer = self.pool.checkout()?;
        self.render();
        if let Err(err) = self.encode_into(&mut buffer) {
            self.pool.checkin(buffer);
            return Err(err);
        }
        self.frame_count += 1;
        Ok(Frame::new(buffer, self.frame_count))
    }

    fn release(&mut self, frame: Frame) {
        self.pool.checkin(frame.into_buffer());
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            frames_released: self.pool.checked_in(),
            in_flight: self.pool.in_flight(),
            source: self.config.name.clone(),
        }
    }
}
