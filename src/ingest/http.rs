//! Upstream HTTP camera source.
//!
//! This module provides `HttpSource`, which relays frames from another camera
//! that already serves MJPEG (multipart) or single JPEG snapshots over HTTP.
//!
//! The HTTP source is responsible for:
//! - Connecting to the upstream stream
//! - Cutting JPEG frames out of the multipart body by SOI/EOI markers
//! - Reconnecting lazily on the next fetch after a failure

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use url::Url;

use crate::frame::{BufferPool, Frame, FrameSource, SourceStats, JPEG_EOI, JPEG_SOI};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 8192;

/// Configuration for an upstream HTTP source.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Stream URL, e.g. "http://192.168.4.1:81/stream".
    pub url: String,
    pub buffer_count: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:81/stream".to_string(),
            buffer_count: 2,
        }
    }
}

pub struct HttpSource {
    config: HttpConfig,
    pool: BufferPool,
    stream: Option<HttpStream>,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
    last_error: Option<String>,
}

enum HttpStream {
    Mjpeg(MjpegReader),
    SingleJpeg,
}

impl HttpSource {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse upstream camera url")?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported upstream scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        Ok(Self {
            pool: BufferPool::new(config.buffer_count),
            stream: None,
            connected_at: None,
            last_frame_at: None,
            frame_count: 0,
            last_error: None,
            config,
        })
    }

    fn read_frame(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        if self.stream.is_none() {
            self.connect()?;
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("upstream {} not connected", self.config.url))?;
        match stream {
            HttpStream::Mjpeg(reader) => reader.read_next_jpeg(buffer),
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.config.url, buffer),
        }
    }
}

impl FrameSource for HttpSource {
    fn connect(&mut self) -> Result<()> {
        let response = ureq::get(&self.config.url)
            .call()
            .with_context(|| format!("connect to upstream camera {}", self.config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegReader::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        self.connected_at = Some(Instant::now());
        log::info!("HttpSource: connected to {}", self.config.url);
        Ok(())
    }

    fn acquire(&mut self) -> Result<Frame> {
        let mut buffer = self.pool.checkout()?;
        if let Err(err) = self.read_frame(&mut buffer) {
            self.pool.checkin(buffer);
            // Next fetch starts over with a fresh upstream request.
            self.stream = None;
            self.last_error = Some(err.to_string());
            return Err(err);
        }
        self.last_error = None;
        self.last_frame_at = Some(Instant::now());
        self.frame_count += 1;
        Ok(Frame::new(buffer, self.frame_count))
    }

    fn release(&mut self, frame: Frame) {
        self.pool.checkin(frame.into_buffer());
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= Duration::from_secs(5)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            frames_released: self.pool.checked_in(),
            in_flight: self.pool.in_flight(),
            source: self.config.url.clone(),
        }
    }
}

struct MjpegReader {
    reader: Box<dyn Read + Send + Sync>,
    pending: Vec<u8>,
}

impl MjpegReader {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            pending: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.pending) {
                out.extend_from_slice(&self.pending[start..end]);
                self.pending.drain(..end);
                return Ok(());
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("upstream mjpeg stream ended"));
            }
            self.pending.extend_from_slice(&chunk[..read]);

            if self.pending.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.pending.len());
                let drain_len = self.pending.len() - keep;
                self.pending.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(url: &str, out: &mut Vec<u8>) -> Result<()> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(out)
        .context("read jpeg snapshot")?;
    if out.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(())
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == JPEG_SOI)?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == JPEG_EOI)?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn finds_jpeg_inside_multipart_noise() {
        let mut data = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        data.extend_from_slice(&[0xFF, 0xD8, 0x10, 0x20, 0xFF, 0xD9]);
        data.extend_from_slice(b"\r\n--frame");
        let (start, end) = find_jpeg_bounds(&data).expect("bounds");
        assert_eq!(&data[start..end], &[0xFF, 0xD8, 0x10, 0x20, 0xFF, 0xD9]);
    }

    #[test]
    fn incomplete_jpeg_has_no_bounds() {
        assert!(find_jpeg_bounds(&[0xFF, 0xD8, 0x00, 0x01]).is_none());
        assert!(find_jpeg_bounds(b"--frame\r\n").is_none());
    }

    #[test]
    fn reader_splits_consecutive_parts() -> Result<()> {
        let mut body = Vec::new();
        for payload in [0x01u8, 0x02] {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&[0xFF, 0xD8, payload, 0xFF, 0xD9]);
            body.extend_from_slice(b"\r\n");
        }
        let mut reader = MjpegReader::new(Box::new(Cursor::new(body)));

        let mut out = Vec::new();
        reader.read_next_jpeg(&mut out)?;
        assert_eq!(out, vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9]);
        out.clear();
        reader.read_next_jpeg(&mut out)?;
        assert_eq!(out, vec![0xFF, 0xD8, 0x02, 0xFF, 0xD9]);
        out.clear();
        assert!(reader.read_next_jpeg(&mut out).is_err());
        Ok(())
    }

    #[test]
    fn rejects_non_http_scheme() {
        let config = HttpConfig {
            url: "udp://127.0.0.1:5000".to_string(),
            buffer_count: 1,
        };
        assert!(HttpSource::new(config).is_err());
    }
}
