//! Frame ownership layer.
//!
//! This module enforces the frame release discipline at the type level.
//!
//! - `Frame`: Encoded JPEG bytes borrowed from a source. Not `Clone`.
//! - `FrameSource`: Anything that hands out frames and takes them back.
//! - `FrameLease`: Guard that returns the frame to its source on every exit path.
//! - `BufferPool`: Bounded set of frame buffers a source draws from.
//!
//! `FrameSource::release` consumes the `Frame`, so a frame cannot be released
//! twice. `FrameLease` releases on drop, so a frame cannot be leaked by an
//! early return or a failed socket write.

use anyhow::{anyhow, Result};
use std::mem::ManuallyDrop;
use std::time::{Duration, Instant};

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

// ----------------------------------------------------------------------------
// Frame: one encoded image on loan from a source
// ----------------------------------------------------------------------------

/// One encoded image unit on loan from a `FrameSource`.
///
/// There is no `Clone` impl. The only way to give the buffer back is
/// `FrameSource::release`, which takes the frame by value.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    sequence: u64,
    captured_at: Instant,
}

impl Frame {
    /// Wrap an encoded buffer. Called by sources when a capture completes.
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Source-local capture counter, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Whether the buffer is framed by JPEG SOI/EOI markers.
    pub fn looks_like_jpeg(&self) -> bool {
        is_jpeg(&self.data)
    }

    /// Give up the underlying buffer. Used by sources inside `release`.
    pub fn into_buffer(self) -> Vec<u8> {
        self.data
    }
}

pub fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..2] == JPEG_SOI && bytes[bytes.len() - 2..] == JPEG_EOI
}

// ----------------------------------------------------------------------------
// FrameSource: the camera side of the contract
// ----------------------------------------------------------------------------

/// A producer of frames with explicit buffer return.
///
/// Implementations hand out at most a bounded number of frames at once
/// (see `BufferPool`); a frame that is never released starves the source.
pub trait FrameSource {
    /// Prepare the source. Sources that need no setup keep the default.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Capture the next frame. May fail transiently.
    fn acquire(&mut self) -> Result<Frame>;

    /// Return a frame's buffer to the source.
    fn release(&mut self, frame: Frame);

    /// Check if the source is healthy.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Get frame statistics.
    fn stats(&self) -> SourceStats;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn acquire(&mut self) -> Result<Frame> {
        (**self).acquire()
    }

    fn release(&mut self, frame: Frame) {
        (**self).release(frame)
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub frames_released: u64,
    pub in_flight: usize,
    pub source: String,
}

// ----------------------------------------------------------------------------
// FrameLease: release-on-drop guard
// ----------------------------------------------------------------------------

/// A frame checked out of a source, returned when the lease ends.
pub struct FrameLease<'a, S: FrameSource + ?Sized> {
    source: &'a mut S,
    frame: ManuallyDrop<Frame>,
}

impl<'a, S: FrameSource + ?Sized> FrameLease<'a, S> {
    /// Fetch one frame from `source`. Nothing is held if the fetch fails.
    pub fn acquire(source: &'a mut S) -> Result<Self> {
        let frame = source.acquire()?;
        Ok(Self {
            source,
            frame: ManuallyDrop::new(frame),
        })
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn bytes(&self) -> &[u8] {
        self.frame.bytes()
    }

    /// Return the frame now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl<S: FrameSource + ?Sized> Drop for FrameLease<'_, S> {
    fn drop(&mut self) {
        // SAFETY: `drop` runs once and `frame` is not touched afterwards.
        let frame = unsafe { ManuallyDrop::take(&mut self.frame) };
        self.source.release(frame);
    }
}

// ----------------------------------------------------------------------------
// BufferPool: bounded frame buffers
// ----------------------------------------------------------------------------

/// Fixed-size set of reusable frame buffers.
///
/// Mirrors a camera driver's frame-buffer count: once `capacity` buffers are
/// checked out, further checkouts fail until one is checked back in.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    free: Vec<Vec<u8>>,
    in_flight: usize,
    checked_out: u64,
    checked_in: u64,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            free: Vec::new(),
            in_flight: 0,
            checked_out: 0,
            checked_in: 0,
        }
    }

    /// Take an empty buffer, reusing a returned one when available.
    pub fn checkout(&mut self) -> Result<Vec<u8>> {
        if self.in_flight >= self.capacity {
            return Err(anyhow!(
                "all {} frame buffers are in flight",
                self.capacity
            ));
        }
        self.in_flight += 1;
        self.checked_out += 1;
        let mut buffer = self.free.pop().unwrap_or_default();
        buffer.clear();
        Ok(buffer)
    }

    /// Return a buffer obtained from `checkout`.
    pub fn checkin(&mut self, mut buffer: Vec<u8>) {
        if self.in_flight == 0 {
            log::warn!("frame buffer returned with none in flight; dropping it");
            return;
        }
        self.in_flight -= 1;
        self.checked_in += 1;
        buffer.clear();
        if self.free.len() < self.capacity {
            self.free.push(buffer);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn checked_out(&self) -> u64 {
        self.checked_out
    }

    pub fn checked_in(&self) -> u64 {
        self.checked_in
    }
}
