//! Frame sources.
//!
//! This module provides the sources the stream server can pull frames from:
//! - Synthetic gradient frames (`stub://...`)
//! - A local directory of JPEG snapshots
//! - An upstream HTTP camera (feature: ingest-http)
//!
//! Camera sensor bring-up is outside this crate; a device build plugs its
//! driver in by implementing `FrameSource`. Every source here draws its
//! buffers from a `BufferPool` and expects them back through `release`.

pub mod file;
#[cfg(feature = "ingest-http")]
pub mod http;
pub mod synthetic;

use anyhow::Result;

use crate::config::StreamSettings;
use crate::frame::FrameSource;

pub use file::{FileConfig, FileSource};
#[cfg(feature = "ingest-http")]
pub use http::{HttpConfig, HttpSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Boxed source as owned by the stream server.
pub type DynFrameSource = Box<dyn FrameSource + Send>;

/// Build the source named by `settings.source` and connect it.
///
/// `stub://` selects the synthetic source, `http(s)://` the upstream relay,
/// and anything else is treated as a local directory.
pub fn open_source(settings: &StreamSettings) -> Result<DynFrameSource> {
    let mut source: DynFrameSource = if settings.source.starts_with("stub://") {
        Box::new(SyntheticSource::new(SyntheticConfig {
            name: settings.source.clone(),
            width: settings.width,
            height: settings.height,
            jpeg_quality: settings.jpeg_quality,
            buffer_count: settings.buffer_count,
            frame_limit: None,
        })?)
    } else if settings.source.starts_with("http://") || settings.source.starts_with("https://") {
        open_http(settings)?
    } else {
        Box::new(FileSource::new(FileConfig {
            path: settings.source.clone(),
            buffer_count: settings.buffer_count,
        })?)
    };
    source.connect()?;
    Ok(source)
}

#[cfg(feature = "ingest-http")]
fn open_http(settings: &StreamSettings) -> Result<DynFrameSource> {
    Ok(Box::new(HttpSource::new(HttpConfig {
        url: settings.source.clone(),
        buffer_count: settings.buffer_count,
    })?))
}

#[cfg(not(feature = "ingest-http"))]
fn open_http(settings: &StreamSettings) -> Result<DynFrameSource> {
    anyhow::bail!(
        "source {} requires the ingest-http feature",
        settings.source
    )
}
