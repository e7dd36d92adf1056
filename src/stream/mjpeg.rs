//! Multipart JPEG (MJPEG) streaming.
//!
//! A stream response is one HTTP header announcing
//! `multipart/x-mixed-replace; boundary=frame`, followed by one part per frame:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! \r\n
//! <jpeg bytes>\r\n
//! ```
//!
//! The session pulls a frame, writes its part, hands the frame back, waits the
//! pacing interval, and repeats until the peer goes away, a write fails, or
//! the source fails to produce a frame.

use anyhow::{Context, Result};
use std::io::{ErrorKind, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::frame::{FrameLease, FrameSource};

/// Multipart boundary token.
pub const BOUNDARY: &str = "frame";

/// Response header sent once per stream, before any part.
pub const STREAM_HEADER: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\n\r\n";

/// Per-part preamble: boundary line, part header, blank line.
pub const PART_HEADER: &str = "--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Delimiter written after each frame's bytes.
pub const PART_TRAILER: &str = "\r\n";

/// Default delay between frames, roughly 10 frames per second.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Socket side of a stream session.
pub trait StreamSink: Write {
    /// Whether the peer still holds the connection open.
    fn peer_connected(&self) -> bool;
}

impl StreamSink for TcpStream {
    fn peer_connected(&self) -> bool {
        tcp_peer_connected(self)
    }
}

/// Probe a socket for an orderly shutdown from the peer without consuming data.
pub fn tcp_peer_connected(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let alive = match stream.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(err) if err.kind() == ErrorKind::WouldBlock => true,
        Err(err) if err.kind() == ErrorKind::Interrupted => true,
        Err(_) => false,
    };
    stream.set_nonblocking(false).is_ok() && alive
}

/// Fixed inter-frame delay, measured from the end of one send to the start of
/// the next fetch. Fetch and send time come on top, so the delivered rate is
/// below `1 / interval`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePacing {
    pub interval: Duration,
}

impl FramePacing {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn wait(&self) {
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
    }
}

impl Default for FramePacing {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_INTERVAL)
    }
}

/// Why a stream session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    PeerDisconnected,
    WriteFailed,
    FetchFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub end: SessionEnd,
}

/// Per-connection serving state.
///
/// `Accepted → StreamingHeaderSent → Framing* → Closed`; `run` drives the
/// whole lifecycle and returns once the session is closed.
pub struct MjpegSession<'a, K: StreamSink> {
    sink: &'a mut K,
    pacing: FramePacing,
    frames_sent: u64,
    bytes_sent: u64,
}

impl<'a, K: StreamSink> MjpegSession<'a, K> {
    pub fn new(sink: &'a mut K, pacing: FramePacing) -> Self {
        Self {
            sink,
            pacing,
            frames_sent: 0,
            bytes_sent: 0,
        }
    }

    /// Serve frames from `source` until the session ends.
    pub fn run<S: FrameSource + ?Sized>(mut self, source: &mut S) -> SessionSummary {
        if let Err(err) = write_stream_header(&mut *self.sink) {
            log::info!("stream header write failed: {:#}", err);
            return self.finish(SessionEnd::WriteFailed);
        }

        let end = loop {
            if !self.sink.peer_connected() {
                break SessionEnd::PeerDisconnected;
            }

            let lease = match FrameLease::acquire(source) {
                Ok(lease) => lease,
                Err(err) => {
                    log::warn!("camera capture failed: {:#}", err);
                    break SessionEnd::FetchFailed;
                }
            };

            let written = write_part(&mut *self.sink, lease.bytes());
            let frame_len = lease.bytes().len() as u64;
            lease.release();

            if let Err(err) = written {
                log::info!("stream write failed after {} frames: {:#}", self.frames_sent, err);
                break SessionEnd::WriteFailed;
            }
            self.frames_sent += 1;
            self.bytes_sent += frame_len;

            self.pacing.wait();
        };

        self.finish(end)
    }

    fn finish(self, end: SessionEnd) -> SessionSummary {
        SessionSummary {
            frames_sent: self.frames_sent,
            bytes_sent: self.bytes_sent,
            end,
        }
    }
}

pub fn write_stream_header<W: Write + ?Sized>(out: &mut W) -> Result<()> {
    out.write_all(STREAM_HEADER.as_bytes())
        .context("write stream header")?;
    out.flush().context("flush stream header")?;
    Ok(())
}

/// Write one complete part for `jpeg`.
pub fn write_part<W: Write + ?Sized>(out: &mut W, jpeg: &[u8]) -> Result<()> {
    out.write_all(PART_HEADER.as_bytes())
        .context("write part header")?;
    out.write_all(jpeg).context("write frame bytes")?;
    out.write_all(PART_TRAILER.as_bytes())
        .context("write part trailer")?;
    out.flush().context("flush frame")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BufferPool, Frame, SourceStats};
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::io;

    /// Sink that records bytes and can simulate a peer hang-up or a write error.
    struct RecordingSink {
        written: Vec<u8>,
        peer_gone: bool,
        fail_after_bytes: Option<usize>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                written: Vec::new(),
                peer_gone: false,
                fail_after_bytes: None,
            }
        }
    }

    impl Write for RecordingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(limit) = self.fail_after_bytes {
                if self.written.len() + buf.len() > limit {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer reset"));
                }
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl StreamSink for RecordingSink {
        fn peer_connected(&self) -> bool {
            !self.peer_gone
        }
    }

    /// Source that plays back scripted results.
    struct ScriptedSource {
        script: VecDeque<Result<Vec<u8>>>,
        pool: BufferPool,
        sequence: u64,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<u8>>>) -> Self {
            Self {
                script: script.into(),
                pool: BufferPool::new(1),
                sequence: 0,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn acquire(&mut self) -> Result<Frame> {
            let next = self
                .script
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")))?;
            let mut buffer = self.pool.checkout()?;
            buffer.extend_from_slice(&next);
            self.sequence += 1;
            Ok(Frame::new(buffer, self.sequence))
        }

        fn release(&mut self, frame: Frame) {
            self.pool.checkin(frame.into_buffer());
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.pool.checked_out(),
                frames_released: self.pool.checked_in(),
                in_flight: self.pool.in_flight(),
                source: "scripted".to_string(),
            }
        }
    }

    fn jpeg(tag: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, tag, tag, 0xFF, 0xD9]
    }

    fn expected_part(bytes: &[u8]) -> Vec<u8> {
        let mut part = PART_HEADER.as_bytes().to_vec();
        part.extend_from_slice(bytes);
        part.extend_from_slice(PART_TRAILER.as_bytes());
        part
    }

    fn no_pacing() -> FramePacing {
        FramePacing::new(Duration::ZERO)
    }

    #[test]
    fn header_then_parts_then_fetch_failure() {
        let mut sink = RecordingSink::new();
        let mut source = ScriptedSource::new(vec![
            Ok(jpeg(1)),
            Ok(jpeg(2)),
            Err(anyhow!("capture failed")),
        ]);

        let summary = MjpegSession::new(&mut sink, no_pacing()).run(&mut source);

        assert_eq!(summary.end, SessionEnd::FetchFailed);
        assert_eq!(summary.frames_sent, 2);
        assert_eq!(summary.bytes_sent, 12);

        let mut expected = STREAM_HEADER.as_bytes().to_vec();
        expected.extend(expected_part(&jpeg(1)));
        expected.extend(expected_part(&jpeg(2)));
        assert_eq!(sink.written, expected);

        let stats = source.stats();
        assert_eq!(stats.frames_captured, 2);
        assert_eq!(stats.frames_released, 2);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn immediate_fetch_failure_sends_header_only() {
        let mut sink = RecordingSink::new();
        let mut source = ScriptedSource::new(vec![Err(anyhow!("no sensor"))]);

        let summary = MjpegSession::new(&mut sink, no_pacing()).run(&mut source);

        assert_eq!(summary.end, SessionEnd::FetchFailed);
        assert_eq!(summary.frames_sent, 0);
        assert_eq!(sink.written, STREAM_HEADER.as_bytes());
    }

    #[test]
    fn failed_write_still_releases_frame() {
        let mut sink = RecordingSink::new();
        sink.fail_after_bytes = Some(STREAM_HEADER.len() + PART_HEADER.len() + 2);
        let mut source = ScriptedSource::new(vec![Ok(jpeg(7)), Ok(jpeg(8))]);

        let summary = MjpegSession::new(&mut sink, no_pacing()).run(&mut source);

        assert_eq!(summary.end, SessionEnd::WriteFailed);
        assert_eq!(summary.frames_sent, 0);
        let stats = source.stats();
        assert_eq!(stats.frames_captured, 1);
        assert_eq!(stats.frames_released, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn header_write_failure_fetches_nothing() {
        let mut sink = RecordingSink::new();
        sink.fail_after_bytes = Some(0);
        let mut source = ScriptedSource::new(vec![Ok(jpeg(1))]);

        let summary = MjpegSession::new(&mut sink, no_pacing()).run(&mut source);

        assert_eq!(summary.end, SessionEnd::WriteFailed);
        assert_eq!(source.stats().frames_captured, 0);
    }

    #[test]
    fn disconnected_peer_stops_before_fetching() {
        let mut sink = RecordingSink::new();
        sink.peer_gone = true;
        let mut source = ScriptedSource::new(vec![Ok(jpeg(1))]);

        let summary = MjpegSession::new(&mut sink, no_pacing()).run(&mut source);

        assert_eq!(summary.end, SessionEnd::PeerDisconnected);
        assert_eq!(source.stats().frames_captured, 0);
        assert_eq!(sink.written, STREAM_HEADER.as_bytes());
    }

    #[test]
    fn stream_header_announces_multipart_boundary() {
        assert!(STREAM_HEADER.contains(&format!(
            "Content-Type: multipart/x-mixed-replace; boundary={}",
            BOUNDARY
        )));
        assert!(PART_HEADER.starts_with(&format!("--{}\r\n", BOUNDARY)));
    }

    #[test]
    fn pacing_waits_at_least_interval() {
        let pacing = FramePacing::new(Duration::from_millis(20));
        let start = std::time::Instant::now();
        pacing.wait();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
