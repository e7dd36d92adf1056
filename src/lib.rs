//! camstream
//!
//! Camera node services: an MJPEG-over-HTTP stream server and an outbound
//! WebSocket control channel, driven together by one cooperative scheduler.
//!
//! # Module Structure
//!
//! - `frame`: frames, the `FrameSource` contract, leases, buffer pool
//! - `ingest`: frame sources (synthetic, JPEG directory, upstream HTTP)
//! - `stream`: HTTP listener, routing, MJPEG sessions
//! - `control`: WebSocket control-channel client and its observers
//! - `scheduler`: the single loop that interleaves both subsystems
//! - `config`: device configuration from file and environment

pub mod config;
pub mod control;
pub mod frame;
pub mod ingest;
pub mod scheduler;
pub mod stream;

pub use config::{ControlSettings, DeviceConfig, NetworkCredentials, StreamSettings};
pub use control::{
    ChannelPhase, ControlChannel, InboundMessage, LifecycleEvent, LifecycleObserver,
    LoggingObserver, MessageObserver, ReconnectPolicy,
};
pub use frame::{BufferPool, Frame, FrameLease, FrameSource, SourceStats};
pub use ingest::{open_source, DynFrameSource};
pub use scheduler::{Scheduler, SchedulerHandle, TickReport};
pub use stream::{ServerConfig, SessionEnd, StreamServer};
