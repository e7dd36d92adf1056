//! MJPEG stream server.
//!
//! Routes:
//! - `GET /`: landing page with an `<img>` pointing at `/stream`
//! - `GET /stream`: endless `multipart/x-mixed-replace` JPEG stream
//!
//! The server never runs on its own thread. `tick` accepts at most one
//! pending connection and serves it to completion on the caller's thread, so
//! while a viewer is watching `/stream` nothing else on that thread runs.

pub mod http;
pub mod mjpeg;

use anyhow::{Context, Result};
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};

use crate::frame::FrameSource;
use http::{read_request, write_response, write_text_response, LANDING_PAGE};
use mjpeg::{FramePacing, MjpegSession, SessionSummary, StreamSink};

pub use mjpeg::SessionEnd;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub pacing: FramePacing,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            pacing: FramePacing::default(),
        }
    }
}

/// Which handler a request was routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Root,
    Stream,
    NotFound,
    MethodNotAllowed,
    BadRequest,
}

#[derive(Clone, Debug)]
pub struct ConnectionReport {
    pub peer: Option<SocketAddr>,
    pub route: Route,
    /// Present for `/stream` requests.
    pub session: Option<SessionSummary>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: u64,
    pub streams_served: u64,
    pub frames_sent: u64,
}

pub struct StreamServer<S: FrameSource> {
    listener: TcpListener,
    addr: SocketAddr,
    pacing: FramePacing,
    source: S,
    stats: ServerStats,
}

impl<S: FrameSource> StreamServer<S> {
    /// Bind the listener and start accepting. Bind failures are returned.
    pub fn setup(cfg: ServerConfig, source: S) -> Result<Self> {
        let listener = TcpListener::bind(cfg.addr.as_str())
            .with_context(|| format!("bind http listener on {}", cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("http server started on {}", addr);
        Ok(Self {
            listener,
            addr,
            pacing: cfg.pacing,
            source,
            stats: ServerStats::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Accept and fully serve one pending connection, if any.
    ///
    /// Returns `None` immediately when no client is waiting. Accept errors
    /// are logged and treated as "nothing pending".
    pub fn tick(&mut self) -> Option<ConnectionReport> {
        match self.listener.accept() {
            Ok((stream, peer)) => Some(self.handle_connection(stream, Some(peer))),
            Err(err) if err.kind() == ErrorKind::WouldBlock => None,
            Err(err) => {
                log::warn!("http accept failed: {}", err);
                None
            }
        }
    }

    /// Route and serve one accepted connection, then close it.
    pub fn handle_connection(
        &mut self,
        mut stream: TcpStream,
        peer: Option<SocketAddr>,
    ) -> ConnectionReport {
        self.stats.connections += 1;
        if let Err(err) = stream.set_nonblocking(false) {
            log::warn!("http connection setup failed: {}", err);
        }

        let route = match read_request(&mut stream) {
            Ok(request) if request.method != "GET" => Route::MethodNotAllowed,
            Ok(request) => match request.path.as_str() {
                "/" => Route::Root,
                "/stream" => Route::Stream,
                _ => Route::NotFound,
            },
            Err(err) => {
                log::warn!("http request rejected: {:#}", err);
                Route::BadRequest
            }
        };

        let mut session = None;
        let result = match route {
            Route::Root => handle_root(&mut stream),
            Route::Stream => {
                log::info!("stream client connected: {}", describe_peer(peer));
                let summary = handle_stream(&mut stream, &mut self.source, self.pacing);
                self.stats.streams_served += 1;
                self.stats.frames_sent += summary.frames_sent;
                log::info!(
                    "stream client {} done: {:?} after {} frames ({} bytes)",
                    describe_peer(peer),
                    summary.end,
                    summary.frames_sent,
                    summary.bytes_sent
                );
                session = Some(summary);
                Ok(())
            }
            Route::NotFound => write_text_response(&mut stream, 404, "Not found"),
            Route::MethodNotAllowed => {
                write_text_response(&mut stream, 405, "Method not allowed")
            }
            Route::BadRequest => write_text_response(&mut stream, 400, "Bad request"),
        };
        if let Err(err) = result {
            log::debug!("http response to {} failed: {:#}", describe_peer(peer), err);
        }
        let _ = stream.shutdown(Shutdown::Both);

        ConnectionReport {
            peer,
            route,
            session,
        }
    }
}

/// `GET /`: the fixed landing page.
pub fn handle_root<W: Write>(out: &mut W) -> Result<()> {
    write_response(out, 200, "text/html", LANDING_PAGE.as_bytes())
}

/// `GET /stream`: serve frames until the session ends.
pub fn handle_stream<K: StreamSink, S: FrameSource + ?Sized>(
    sink: &mut K,
    source: &mut S,
    pacing: FramePacing,
) -> SessionSummary {
    MjpegSession::new(sink, pacing).run(source)
}

fn describe_peer(peer: Option<SocketAddr>) -> String {
    peer.map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{SyntheticConfig, SyntheticSource};

    fn loopback_server() -> Result<StreamServer<SyntheticSource>> {
        let source = SyntheticSource::new(SyntheticConfig {
            width: 16,
            height: 16,
            ..SyntheticConfig::default()
        })?;
        StreamServer::setup(
            ServerConfig {
                addr: "127.0.0.1:0".to_string(),
                pacing: FramePacing::new(std::time::Duration::ZERO),
            },
            source,
        )
    }

    #[test]
    fn tick_without_clients_returns_immediately() -> Result<()> {
        let mut server = loopback_server()?;
        assert!(server.tick().is_none());
        assert_eq!(server.stats().connections, 0);
        Ok(())
    }

    #[test]
    fn bind_conflict_is_reported() -> Result<()> {
        let server = loopback_server()?;
        let source = SyntheticSource::new(SyntheticConfig::default())?;
        let cfg = ServerConfig {
            addr: server.local_addr().to_string(),
            ..ServerConfig::default()
        };
        assert!(StreamServer::setup(cfg, source).is_err());
        Ok(())
    }

    #[test]
    fn root_handler_writes_landing_page() -> Result<()> {
        let mut out = Vec::new();
        handle_root(&mut out)?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("Content-Type: text/html"));
        assert!(text.contains("<img src='/stream'"));
        Ok(())
    }
}
