//! Local snapshot directory source.
//!
//! This module provides `FileSource`, which replays the JPEG files found in a
//! local directory, in file-name order, looping forever. It stands in for a
//! camera on bench setups and in tests.
//!
//! The file source MUST NOT:
//! - Fetch remote URLs
//! - Hand out data that is not JPEG-framed

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::frame::{is_jpeg, BufferPool, Frame, FrameSource, SourceStats};

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local directory path (e.g., "/var/lib/camstream/frames").
    pub path: String,
    pub buffer_count: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            buffer_count: 2,
        }
    }
}

pub struct FileSource {
    config: FileConfig,
    pool: BufferPool,
    files: Vec<PathBuf>,
    cursor: usize,
    frame_count: u64,
    last_error: Option<String>,
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file source only supports local paths (no URL schemes), got '{}'",
                config.path
            ));
        }
        Ok(Self {
            pool: BufferPool::new(config.buffer_count),
            files: Vec::new(),
            cursor: 0,
            frame_count: 0,
            last_error: None,
            config,
        })
    }

    fn next_path(&mut self) -> Result<PathBuf> {
        if self.files.is_empty() {
            return Err(anyhow!(
                "file source {} not connected; call connect() first",
                self.config.path
            ));
        }
        let path = self.files[self.cursor % self.files.len()].clone();
        self.cursor = (self.cursor + 1) % self.files.len();
        Ok(path)
    }

    fn read_into(path: &Path, buffer: &mut Vec<u8>) -> Result<()> {
        let mut file =
            std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
        file.read_to_end(buffer)
            .with_context(|| format!("read {}", path.display()))?;
        if !is_jpeg(buffer) {
            return Err(anyhow!("{} is not a JPEG image", path.display()));
        }
        Ok(())
    }
}

impl FrameSource for FileSource {
    fn connect(&mut self) -> Result<()> {
        let dir = Path::new(&self.config.path);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("list frame directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && has_jpeg_extension(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("no .jpg/.jpeg files in {}", dir.display()));
        }
        files.sort();
        log::info!(
            "FileSource: connected to {} ({} images)",
            self.config.path,
            files.len()
        );
        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    fn acquire(&mut self) -> Result<Frame> {
        let path = self.next_path()?;
        let mut buffer = self.pool.checkout()?;
        if let Err(err) = Self::read_into(&path, &mut buffer) {
            self.pool.checkin(buffer);
            self.last_error = Some(err.to_string());
            return Err(err);
        }
        self.last_error = None;
        self.frame_count += 1;
        Ok(Frame::new(buffer, self.frame_count))
    }

    fn release(&mut self, frame: Frame) {
        self.pool.checkin(frame.into_buffer());
    }

    fn is_healthy(&self) -> bool {
        !self.files.is_empty() && self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            frames_released: self.pool.checked_in(),
            in_flight: self.pool.in_flight(),
            source: self.config.path.clone(),
        }
    }
}

fn has_jpeg_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    !path.contains("://")
}
