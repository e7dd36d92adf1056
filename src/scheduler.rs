//! Cooperative scheduler.
//!
//! One execution context drives both subsystems: each `tick` lets the stream
//! server accept and fully serve at most one connection, then polls the
//! control channel. An active `/stream` session therefore holds off control
//! traffic until it ends.

use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::control::{ControlChannel, PollSummary};
use crate::frame::FrameSource;
use crate::stream::{ConnectionReport, StreamServer};

/// Sleep between ticks that found nothing to do.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(10);

/// What one `tick` did.
#[derive(Clone, Debug, Default)]
pub struct TickReport {
    pub connection: Option<ConnectionReport>,
    pub control: PollSummary,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.connection.is_none() && self.control.is_idle()
    }
}

pub struct Scheduler<S: FrameSource> {
    server: StreamServer<S>,
    channel: Option<ControlChannel>,
    idle: Duration,
    ticks: u64,
}

impl<S: FrameSource> Scheduler<S> {
    /// Take ownership of the server and, optionally, the control channel.
    pub fn new(server: StreamServer<S>, channel: Option<ControlChannel>) -> Self {
        Self {
            server,
            channel,
            idle: DEFAULT_IDLE_INTERVAL,
            ticks: 0,
        }
    }

    pub fn with_idle_interval(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    pub fn server(&self) -> &StreamServer<S> {
        &self.server
    }

    pub fn channel(&self) -> Option<&ControlChannel> {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> Option<&mut ControlChannel> {
        self.channel.as_mut()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run one iteration: serve a pending HTTP client, then poll the channel.
    pub fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        let connection = self.server.tick();
        let control = self
            .channel
            .as_mut()
            .map(ControlChannel::poll)
            .unwrap_or_default();
        TickReport {
            connection,
            control,
        }
    }

    /// Tick until `shutdown` is set. The flag is checked between ticks, so a
    /// stream in progress finishes first.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        log::info!(
            "scheduler running (http {}, control {})",
            self.server.local_addr(),
            self.channel
                .as_ref()
                .map(|channel| channel.url().to_string())
                .unwrap_or_else(|| "disabled".to_string())
        );
        while !shutdown.load(Ordering::SeqCst) {
            if self.tick().is_idle() {
                std::thread::sleep(self.idle);
            }
        }
        log::info!("scheduler stopped after {} ticks", self.ticks);
        Ok(())
    }
}

impl<S: FrameSource + Send + 'static> Scheduler<S> {
    /// Move the scheduler onto its own thread. The loop stays single threaded;
    /// the handle only adds a shutdown flag.
    pub fn spawn(mut self) -> Result<SchedulerHandle> {
        let addr = self.server.local_addr();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("camstream-scheduler".to_string())
            .spawn(move || {
                if let Err(err) = self.run(&shutdown_thread) {
                    log::error!("scheduler stopped: {}", err);
                }
            })?;
        Ok(SchedulerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

#[derive(Debug)]
pub struct SchedulerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("scheduler thread panicked"))?;
        }
        Ok(())
    }
}
