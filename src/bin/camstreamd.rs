//! camstreamd - camera node daemon
//!
//! This daemon:
//! 1. Loads the device configuration (file + environment)
//! 2. Opens the configured frame source
//! 3. Serves `/` and `/stream` over HTTP
//! 4. Connects the WebSocket control channel
//! 5. Runs both on one cooperative loop until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camstream::stream::mjpeg::FramePacing;
use camstream::{
    open_source, ControlChannel, DeviceConfig, FrameSource, LoggingObserver, Scheduler,
    ServerConfig, StreamServer,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve an MJPEG camera stream and a WebSocket control channel")]
struct Args {
    /// Configuration file (.toml or .json).
    #[arg(long, env = "CAMSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address; overrides the configuration file.
    #[arg(long)]
    http_addr: Option<String>,

    /// Do not open the control channel.
    #[arg(long)]
    no_control: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = DeviceConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    if args.no_control {
        config.control.enabled = false;
    }

    if config.network.ssid.is_empty() {
        log::info!("no network ssid configured; using the host network as-is");
    } else {
        log::info!("network ssid: {}", config.network.ssid);
    }

    let source = open_source(&config.stream)
        .with_context(|| format!("open frame source {}", config.stream.source))?;
    log::info!("frame source ready: {}", source.stats().source);

    let server = StreamServer::setup(
        ServerConfig {
            addr: config.http_addr.clone(),
            pacing: FramePacing::new(config.stream.frame_interval),
        },
        source,
    )?;

    let channel = if config.control.enabled {
        log::info!("control channel target: {}", config.control.url());
        Some(ControlChannel::setup(
            config.control.clone(),
            LoggingObserver,
            LoggingObserver,
        )?)
    } else {
        log::info!("control channel disabled");
        None
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_signal.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let mut scheduler = Scheduler::new(server, channel);
    scheduler.run(&shutdown)?;
    log::info!("camstreamd stopped");
    Ok(())
}
