use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::control::ReconnectPolicy;

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_SOURCE: &str = "stub://camera";
const DEFAULT_FRAME_INTERVAL_MS: u64 = 100;
const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_BUFFER_COUNT: usize = 2;
const DEFAULT_WS_HOST: &str = "127.0.0.1";
const DEFAULT_WS_PORT: u16 = 8765;
const DEFAULT_WS_PATH: &str = "/";

#[derive(Debug, Deserialize, Default)]
struct DeviceConfigFile {
    network: Option<NetworkConfigFile>,
    http: Option<HttpConfigFile>,
    stream: Option<StreamConfigFile>,
    control: Option<ControlConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct NetworkConfigFile {
    ssid: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    source: Option<String>,
    frame_interval_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    jpeg_quality: Option<u8>,
    buffer_count: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ControlConfigFile {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    reconnect_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub network: NetworkCredentials,
    pub http_addr: String,
    pub stream: StreamSettings,
    pub control: ControlSettings,
}

/// Wireless credentials. Network association happens outside this crate;
/// the values are carried through untouched.
#[derive(Clone, Default)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: Zeroizing<String>,
}

impl fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// `stub://<name>`, a local directory of JPEGs, or an upstream http(s) URL.
    pub source: String,
    /// Delay between the end of one frame send and the next fetch.
    pub frame_interval: Duration,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    pub buffer_count: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            frame_interval: Duration::from_millis(DEFAULT_FRAME_INTERVAL_MS),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            buffer_count: DEFAULT_BUFFER_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: DEFAULT_WS_HOST.to_string(),
            port: DEFAULT_WS_PORT,
            path: DEFAULT_WS_PATH.to_string(),
            reconnect: ReconnectPolicy::Never,
        }
    }
}

impl ControlSettings {
    /// Connection target, `ws://<host>:<port><path>`.
    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

impl DeviceConfig {
    /// Load from the file named by `CAMSTREAM_CONFIG` (if set), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMSTREAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (or defaults), then apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DeviceConfigFile) -> Self {
        let network = file.network.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let control = file.control.unwrap_or_default();
        let defaults = StreamSettings::default();

        Self {
            network: NetworkCredentials {
                ssid: network.ssid.unwrap_or_default(),
                password: Zeroizing::new(network.password.unwrap_or_default()),
            },
            http_addr: file
                .http
                .and_then(|http| http.addr)
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            stream: StreamSettings {
                source: stream.source.unwrap_or(defaults.source),
                frame_interval: stream
                    .frame_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.frame_interval),
                width: stream.width.unwrap_or(defaults.width),
                height: stream.height.unwrap_or(defaults.height),
                jpeg_quality: stream.jpeg_quality.unwrap_or(defaults.jpeg_quality),
                buffer_count: stream.buffer_count.unwrap_or(defaults.buffer_count),
            },
            control: ControlSettings {
                enabled: control.enabled.unwrap_or(true),
                host: control.host.unwrap_or_else(|| DEFAULT_WS_HOST.to_string()),
                port: control.port.unwrap_or(DEFAULT_WS_PORT),
                path: control.path.unwrap_or_else(|| DEFAULT_WS_PATH.to_string()),
                reconnect: reconnect_policy(control.reconnect_interval_ms),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(ssid) = non_empty_env("CAMSTREAM_WIFI_SSID") {
            self.network.ssid = ssid;
        }
        if let Some(password) = non_empty_env("CAMSTREAM_WIFI_PASSWORD") {
            self.network.password = Zeroizing::new(password);
        }
        if let Some(addr) = non_empty_env("CAMSTREAM_HTTP_ADDR") {
            self.http_addr = addr;
        }
        if let Some(source) = non_empty_env("CAMSTREAM_SOURCE") {
            self.stream.source = source;
        }
        if let Some(interval) = non_empty_env("CAMSTREAM_FRAME_INTERVAL_MS") {
            let millis: u64 = interval.parse().map_err(|_| {
                anyhow!("CAMSTREAM_FRAME_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.stream.frame_interval = Duration::from_millis(millis);
        }
        if let Some(host) = non_empty_env("CAMSTREAM_WS_HOST") {
            self.control.host = host;
        }
        if let Some(port) = non_empty_env("CAMSTREAM_WS_PORT") {
            self.control.port = port
                .parse()
                .map_err(|_| anyhow!("CAMSTREAM_WS_PORT must be a port number"))?;
        }
        if let Some(path) = non_empty_env("CAMSTREAM_WS_PATH") {
            self.control.path = path;
        }
        if let Some(interval) = non_empty_env("CAMSTREAM_WS_RECONNECT_MS") {
            let millis: u64 = interval.parse().map_err(|_| {
                anyhow!("CAMSTREAM_WS_RECONNECT_MS must be an integer number of milliseconds")
            })?;
            self.control.reconnect = reconnect_policy(Some(millis));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.http_addr.trim().is_empty() {
            return Err(anyhow!("http addr must not be empty"));
        }
        if self.stream.source.trim().is_empty() {
            return Err(anyhow!("stream source must not be empty"));
        }
        if self.stream.width == 0 || self.stream.height == 0 {
            return Err(anyhow!("stream width and height must be greater than zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }
        if self.stream.buffer_count == 0 {
            return Err(anyhow!("buffer_count must be at least 1"));
        }
        if self.control.enabled {
            if self.control.host.trim().is_empty() {
                return Err(anyhow!("control host must not be empty"));
            }
            if self.control.port == 0 {
                return Err(anyhow!("control port must be greater than zero"));
            }
            if !self.control.path.starts_with('/') {
                return Err(anyhow!(
                    "control path must start with '/', got '{}'",
                    self.control.path
                ));
            }
        }
        Ok(())
    }
}

fn reconnect_policy(interval_ms: Option<u64>) -> ReconnectPolicy {
    match interval_ms {
        Some(ms) if ms > 0 => ReconnectPolicy::Fixed {
            interval: Duration::from_millis(ms),
        },
        _ => ReconnectPolicy::Never,
    }
}

fn read_config_file(path: &Path) -> Result<DeviceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
