//! Control-channel client.
//!
//! One outbound WebSocket connection to a coordination endpoint at
//! `ws://<host>:<port><path>`. The channel never blocks the caller waiting on
//! the network: `connect` starts the handshake, and `poll` finishes it,
//! reads whatever frames have arrived, and dispatches them to the observers
//! bound at construction.
//!
//! Phases: `Disconnected → Connecting → Connected → (Disconnected | Closing)`,
//! and `Closing → Disconnected`. Transport errors never escape `poll`; they
//! show up as a `Closed` event. There is no reconnection unless a
//! `ReconnectPolicy::Fixed` is configured; under that policy a handshake or
//! closing handshake left pending for longer than the interval is dropped and
//! a new attempt follows.

pub mod event;

use anyhow::{anyhow, bail, Context, Result};
use std::io::ErrorKind;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use tungstenite::handshake::client::ClientHandshake;
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::{Message, WebSocket};

use crate::config::ControlSettings;

pub use event::{
    InboundMessage, LifecycleEvent, LifecycleObserver, LoggingObserver, MessageKind,
    MessageObserver,
};

/// Upper bound on frames handled by a single `poll`, so a chatty peer cannot
/// keep the scheduler inside the control channel.
const MAX_FRAMES_PER_POLL: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelPhase {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// What `poll` does when the channel is `Disconnected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Stay disconnected until `connect` is called again.
    #[default]
    Never,
    /// Start a new attempt once `interval` has passed since the previous one.
    /// Attempts still `Connecting` or `Closing` after `interval` are dropped.
    Fixed { interval: Duration },
}

/// Work done by one `poll` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub events: usize,
    pub messages: usize,
}

impl PollSummary {
    pub fn is_idle(&self) -> bool {
        self.events == 0 && self.messages == 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub connect_attempts: u64,
    pub events_dispatched: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
}

enum Transport {
    Idle,
    Handshaking(MidHandshake<ClientHandshake<TcpStream>>),
    Open(WebSocket<TcpStream>),
}

pub struct ControlChannel {
    settings: ControlSettings,
    url: String,
    messages: Box<dyn MessageObserver + Send>,
    lifecycle: Box<dyn LifecycleObserver + Send>,
    transport: Transport,
    phase: ChannelPhase,
    phase_since: Instant,
    opened_pending: bool,
    opened_emitted: bool,
    last_attempt: Option<Instant>,
    stats: ChannelStats,
}

impl ControlChannel {
    /// Bind the observers. No connection is attempted yet.
    pub fn new(
        settings: ControlSettings,
        messages: impl MessageObserver + Send + 'static,
        lifecycle: impl LifecycleObserver + Send + 'static,
    ) -> Result<Self> {
        if settings.host.trim().is_empty() {
            bail!("control channel host must not be empty");
        }
        if !settings.path.starts_with('/') {
            bail!(
                "control channel path must start with '/', got '{}'",
                settings.path
            );
        }
        Ok(Self {
            url: settings.url(),
            settings,
            messages: Box::new(messages),
            lifecycle: Box::new(lifecycle),
            transport: Transport::Idle,
            phase: ChannelPhase::Disconnected,
            phase_since: Instant::now(),
            opened_pending: false,
            opened_emitted: false,
            last_attempt: None,
            stats: ChannelStats::default(),
        })
    }

    /// Bind the observers and issue the first connect attempt.
    ///
    /// A failed attempt is logged and leaves the channel `Disconnected`; the
    /// only outward sign is that `Opened` never fires.
    pub fn setup(
        settings: ControlSettings,
        messages: impl MessageObserver + Send + 'static,
        lifecycle: impl LifecycleObserver + Send + 'static,
    ) -> Result<Self> {
        let mut channel = Self::new(settings, messages, lifecycle)?;
        channel.connect()?;
        Ok(channel)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ChannelPhase::Connected
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Start a connection attempt.
    ///
    /// Errors only when an attempt or connection is already outstanding.
    /// Network failures are logged and leave the channel `Disconnected`.
    pub fn connect(&mut self) -> Result<()> {
        if self.phase != ChannelPhase::Disconnected {
            bail!(
                "control channel already {:?}; one connection at a time",
                self.phase
            );
        }
        self.last_attempt = Some(Instant::now());
        self.stats.connect_attempts += 1;
        if let Err(err) = self.start_handshake() {
            log::warn!("control channel connect to {} failed: {:#}", self.url, err);
            self.transport = Transport::Idle;
            self.set_phase(ChannelPhase::Disconnected);
        }
        Ok(())
    }

    fn start_handshake(&mut self) -> Result<()> {
        let stream = TcpStream::connect((self.settings.host.as_str(), self.settings.port))
            .with_context(|| format!("tcp connect {}:{}", self.settings.host, self.settings.port))?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        match tungstenite::client(self.url.as_str(), stream) {
            Ok((socket, _response)) => self.mark_open(socket),
            Err(HandshakeError::Interrupted(mid)) => {
                self.transport = Transport::Handshaking(mid);
                self.set_phase(ChannelPhase::Connecting);
            }
            Err(HandshakeError::Failure(err)) => {
                return Err(err).context("websocket handshake");
            }
        }
        log::debug!("control channel connecting to {}", self.url);
        Ok(())
    }

    fn mark_open(&mut self, socket: WebSocket<TcpStream>) {
        self.transport = Transport::Open(socket);
        self.set_phase(ChannelPhase::Connected);
        self.opened_pending = true;
    }

    fn set_phase(&mut self, phase: ChannelPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.phase_since = Instant::now();
        }
    }

    /// Make progress on the connection without blocking.
    ///
    /// Finishes a pending handshake, handles the frames already received, and
    /// flushes queued replies. Observers run inside this call, in arrival order.
    pub fn poll(&mut self) -> PollSummary {
        let mut summary = PollSummary::default();

        self.abandon_stalled(&mut summary);
        if self.phase == ChannelPhase::Disconnected {
            self.maybe_reconnect();
        }

        match std::mem::replace(&mut self.transport, Transport::Idle) {
            Transport::Handshaking(mid) => match mid.handshake() {
                Ok((socket, _response)) => self.mark_open(socket),
                Err(HandshakeError::Interrupted(mid)) => {
                    self.transport = Transport::Handshaking(mid);
                }
                Err(HandshakeError::Failure(err)) => {
                    log::warn!("control channel handshake with {} failed: {}", self.url, err);
                    self.set_phase(ChannelPhase::Disconnected);
                }
            },
            other => self.transport = other,
        }

        if self.opened_pending {
            self.opened_pending = false;
            self.opened_emitted = true;
            self.dispatch_event(LifecycleEvent::Opened, &mut summary);
        }

        let mut socket = match std::mem::replace(&mut self.transport, Transport::Idle) {
            Transport::Open(socket) => socket,
            other => {
                self.transport = other;
                return summary;
            }
        };
        if self.drain(&mut socket, &mut summary) {
            self.transport = Transport::Open(socket);
        } else {
            self.finish_closed(&mut summary);
        }
        summary
    }

    /// Under a fixed reconnect policy, drop an attempt or closing handshake
    /// that has been pending longer than the reconnect interval.
    fn abandon_stalled(&mut self, summary: &mut PollSummary) {
        let ReconnectPolicy::Fixed { interval } = self.settings.reconnect else {
            return;
        };
        if !matches!(self.phase, ChannelPhase::Connecting | ChannelPhase::Closing)
            || self.phase_since.elapsed() < interval
        {
            return;
        }
        log::warn!(
            "control channel {:?} with {} stalled for {:?}; dropping it",
            self.phase,
            self.url,
            self.phase_since.elapsed()
        );
        self.transport = Transport::Idle;
        self.opened_pending = false;
        self.finish_closed(summary);
    }

    /// Go `Disconnected`, reporting `Closed` only if `Opened` was reported.
    fn finish_closed(&mut self, summary: &mut PollSummary) {
        self.set_phase(ChannelPhase::Disconnected);
        if self.opened_emitted {
            self.opened_emitted = false;
            self.dispatch_event(LifecycleEvent::Closed, summary);
        }
    }

    /// Handle frames until the socket would block. Returns `false` once the
    /// connection is gone.
    fn drain(&mut self, socket: &mut WebSocket<TcpStream>, summary: &mut PollSummary) -> bool {
        for _ in 0..MAX_FRAMES_PER_POLL {
            match socket.read() {
                Ok(Message::Text(text)) => {
                    self.dispatch_message(InboundMessage::text(text), summary)
                }
                Ok(Message::Binary(bytes)) => {
                    self.dispatch_message(InboundMessage::binary(&bytes), summary)
                }
                Ok(Message::Ping(_)) => self.dispatch_event(LifecycleEvent::PingReceived, summary),
                Ok(Message::Pong(_)) => self.dispatch_event(LifecycleEvent::PongReceived, summary),
                Ok(Message::Close(frame)) => {
                    match frame {
                        Some(frame) => log::info!(
                            "control channel close from peer: {} {}",
                            u16::from(frame.code),
                            frame.reason
                        ),
                        None => log::info!("control channel close from peer"),
                    }
                    self.set_phase(ChannelPhase::Closing);
                }
                Ok(Message::Frame(_)) => {}
                Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => {
                    return flush_pending(socket);
                }
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => return false,
                Err(err) => {
                    log::warn!("control channel transport error: {}", err);
                    return false;
                }
            }
        }
        flush_pending(socket)
    }

    fn dispatch_event(&mut self, event: LifecycleEvent, summary: &mut PollSummary) {
        summary.events += 1;
        self.stats.events_dispatched += 1;
        self.lifecycle.on_event(event);
    }

    fn dispatch_message(&mut self, message: InboundMessage, summary: &mut PollSummary) {
        summary.messages += 1;
        self.stats.messages_received += 1;
        self.messages.on_message(&message);
    }

    fn maybe_reconnect(&mut self) {
        let ReconnectPolicy::Fixed { interval } = self.settings.reconnect else {
            return;
        };
        let due = self
            .last_attempt
            .map_or(false, |last| last.elapsed() >= interval);
        if due {
            log::info!("control channel reconnecting to {}", self.url);
            if let Err(err) = self.connect() {
                log::warn!("control channel reconnect skipped: {:#}", err);
            }
        }
    }

    /// Queue a text message. Only valid while `Connected`.
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(Message::Text(text.to_string()))
    }

    /// Queue a ping; the peer's pong arrives as `PongReceived`.
    pub fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send(Message::Ping(payload.to_vec()))
    }

    fn send(&mut self, message: Message) -> Result<()> {
        let socket = self.open_socket()?;
        match socket.send(message) {
            Ok(()) => {}
            // Queued in the write buffer; the next poll flushes it.
            Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return Err(err).context("send control message"),
        }
        self.stats.messages_sent += 1;
        Ok(())
    }

    /// Start the closing handshake. `Closed` fires from a later `poll`.
    pub fn close(&mut self) -> Result<()> {
        let socket = self.open_socket()?;
        match socket.close(None) {
            Ok(()) => {}
            Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return Err(err).context("close control channel"),
        }
        self.set_phase(ChannelPhase::Closing);
        Ok(())
    }

    fn open_socket(&mut self) -> Result<&mut WebSocket<TcpStream>> {
        if self.phase != ChannelPhase::Connected {
            return Err(anyhow!(
                "control channel is not connected ({:?})",
                self.phase
            ));
        }
        match &mut self.transport {
            Transport::Open(socket) => Ok(socket),
            _ => Err(anyhow!("control channel is not connected")),
        }
    }
}

fn flush_pending(socket: &mut WebSocket<TcpStream>) -> bool {
    match socket.flush() {
        Ok(()) => true,
        Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => true,
        Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
            false
        }
        Err(err) => {
            log::warn!("control channel flush failed: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    fn settings_for(port: u16) -> ControlSettings {
        ControlSettings {
            host: "127.0.0.1".to_string(),
            port,
            path: "/ws".to_string(),
            ..ControlSettings::default()
        }
    }

    fn recording_channel(
        settings: ControlSettings,
    ) -> Result<(ControlChannel, Arc<Mutex<Vec<LifecycleEvent>>>)> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let channel = ControlChannel::new(
            settings,
            |_: &InboundMessage| {},
            move |event: LifecycleEvent| sink.lock().unwrap().push(event),
        )?;
        Ok((channel, events))
    }

    fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe");
        listener.local_addr().expect("probe addr").port()
    }

    #[test]
    fn rejects_path_without_leading_slash() {
        let settings = ControlSettings {
            path: "ws".to_string(),
            ..ControlSettings::default()
        };
        assert!(ControlChannel::new(settings, LoggingObserver, LoggingObserver).is_err());
    }

    #[test]
    fn refused_connect_stays_disconnected_without_events() -> Result<()> {
        let (mut channel, events) = recording_channel(settings_for(unused_port()))?;
        channel.connect()?;
        assert_eq!(channel.phase(), ChannelPhase::Disconnected);
        assert!(channel.poll().is_idle());
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(channel.stats().connect_attempts, 1);
        Ok(())
    }

    #[test]
    fn never_policy_does_not_retry() -> Result<()> {
        let (mut channel, _events) = recording_channel(settings_for(unused_port()))?;
        channel.connect()?;
        channel.poll();
        channel.poll();
        assert_eq!(channel.stats().connect_attempts, 1);
        Ok(())
    }

    #[test]
    fn fixed_policy_retries_after_interval() -> Result<()> {
        let settings = ControlSettings {
            reconnect: ReconnectPolicy::Fixed {
                interval: Duration::from_millis(10),
            },
            ..settings_for(unused_port())
        };
        let (mut channel, _events) = recording_channel(settings)?;
        channel.connect()?;
        std::thread::sleep(Duration::from_millis(20));
        channel.poll();
        assert_eq!(channel.stats().connect_attempts, 2);
        Ok(())
    }

    #[test]
    fn fixed_policy_waits_for_first_explicit_connect() -> Result<()> {
        let settings = ControlSettings {
            reconnect: ReconnectPolicy::Fixed {
                interval: Duration::from_millis(1),
            },
            ..settings_for(unused_port())
        };
        let (mut channel, _events) = recording_channel(settings)?;
        std::thread::sleep(Duration::from_millis(5));
        channel.poll();
        assert_eq!(channel.stats().connect_attempts, 0);
        Ok(())
    }

    #[test]
    fn fixed_policy_retries_unanswered_handshake() -> Result<()> {
        // Accepts TCP through the backlog but never answers the upgrade.
        let silent = TcpListener::bind("127.0.0.1:0")?;
        let settings = ControlSettings {
            reconnect: ReconnectPolicy::Fixed {
                interval: Duration::from_millis(20),
            },
            ..settings_for(silent.local_addr()?.port())
        };
        let (mut channel, events) = recording_channel(settings)?;
        channel.connect()?;
        assert_eq!(channel.phase(), ChannelPhase::Connecting);

        let deadline = Instant::now() + Duration::from_secs(2);
        while channel.stats().connect_attempts < 3 {
            assert!(Instant::now() < deadline, "stalled handshake never retried");
            channel.poll();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(events.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn never_policy_keeps_unanswered_handshake() -> Result<()> {
        let silent = TcpListener::bind("127.0.0.1:0")?;
        let (mut channel, _events) = recording_channel(settings_for(silent.local_addr()?.port()))?;
        channel.connect()?;
        for _ in 0..10 {
            channel.poll();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(channel.phase(), ChannelPhase::Connecting);
        assert_eq!(channel.stats().connect_attempts, 1);
        assert!(channel.connect().is_err());
        Ok(())
    }

    #[test]
    fn send_requires_connection() -> Result<()> {
        let (mut channel, _events) = recording_channel(settings_for(unused_port()))?;
        assert!(channel.send_text("hello").is_err());
        assert!(channel.close().is_err());
        Ok(())
    }
}
