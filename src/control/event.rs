//! Lifecycle events, inbound messages, and the observer capabilities that
//! receive them.

use std::fmt;

/// Transition or keepalive notice from the control-channel transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Opened,
    Closed,
    PingReceived,
    PongReceived,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleEvent::Opened => "opened",
            LifecycleEvent::Closed => "closed",
            LifecycleEvent::PingReceived => "ping",
            LifecycleEvent::PongReceived => "pong",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    /// Binary frame; `data` holds its lossy UTF-8 rendering.
    Binary,
}

/// A message received from the remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    kind: MessageKind,
    data: String,
}

impl InboundMessage {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            data: data.into(),
        }
    }

    pub fn binary(bytes: &[u8]) -> Self {
        Self {
            kind: MessageKind::Binary,
            data: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }
}

/// Receives lifecycle events. Called synchronously from `ControlChannel::poll`;
/// a slow observer stalls the whole scheduler.
pub trait LifecycleObserver {
    fn on_event(&mut self, event: LifecycleEvent);
}

/// Receives inbound messages. Same calling rules as `LifecycleObserver`.
pub trait MessageObserver {
    fn on_message(&mut self, message: &InboundMessage);
}

impl<F: FnMut(LifecycleEvent)> LifecycleObserver for F {
    fn on_event(&mut self, event: LifecycleEvent) {
        self(event)
    }
}

impl<F: FnMut(&InboundMessage)> MessageObserver for F {
    fn on_message(&mut self, message: &InboundMessage) {
        self(message)
    }
}

/// Default application observer: logs everything it receives.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingObserver;

impl LifecycleObserver for LoggingObserver {
    fn on_event(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Opened => log::info!("control channel connection opened"),
            LifecycleEvent::Closed => log::info!("control channel connection closed"),
            LifecycleEvent::PingReceived => log::debug!("control channel got a ping"),
            LifecycleEvent::PongReceived => log::debug!("control channel got a pong"),
        }
    }
}

impl MessageObserver for LoggingObserver {
    fn on_message(&mut self, message: &InboundMessage) {
        log::info!("control channel received message: {}", message.data());
    }
}
