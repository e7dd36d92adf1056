use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use camstream::config::DeviceConfig;
use camstream::control::ReconnectPolicy;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMSTREAM_CONFIG",
        "CAMSTREAM_WIFI_SSID",
        "CAMSTREAM_WIFI_PASSWORD",
        "CAMSTREAM_HTTP_ADDR",
        "CAMSTREAM_SOURCE",
        "CAMSTREAM_FRAME_INTERVAL_MS",
        "CAMSTREAM_WS_HOST",
        "CAMSTREAM_WS_PORT",
        "CAMSTREAM_WS_PATH",
        "CAMSTREAM_WS_RECONNECT_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = DeviceConfig::load().expect("load defaults");
    assert_eq!(cfg.http_addr, "0.0.0.0:8080");
    assert_eq!(cfg.stream.source, "stub://camera");
    assert_eq!(cfg.stream.frame_interval, Duration::from_millis(100));
    assert_eq!(cfg.control.url(), "ws://127.0.0.1:8765/");
    assert_eq!(cfg.control.reconnect, ReconnectPolicy::Never);
    assert!(cfg.control.enabled);
    assert!(cfg.network.ssid.is_empty());
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "network": { "ssid": "yard-net", "password": "file-secret" },
            "http": { "addr": "127.0.0.1:8081" },
            "stream": {
                "source": "stub://yard",
                "frame_interval_ms": 250,
                "width": 640,
                "height": 480,
                "jpeg_quality": 70,
                "buffer_count": 3
            },
            "control": {
                "host": "coordinator.local",
                "port": 9001,
                "path": "/ws/device",
                "reconnect_interval_ms": 5000
            }
        }"#,
    );

    std::env::set_var("CAMSTREAM_CONFIG", file.path());
    std::env::set_var("CAMSTREAM_WIFI_PASSWORD", "env-secret");
    std::env::set_var("CAMSTREAM_WS_PORT", "9100");

    let cfg = DeviceConfig::load().expect("load config");

    assert_eq!(cfg.network.ssid, "yard-net");
    assert_eq!(cfg.network.password.as_str(), "env-secret");
    assert_eq!(cfg.http_addr, "127.0.0.1:8081");
    assert_eq!(cfg.stream.source, "stub://yard");
    assert_eq!(cfg.stream.frame_interval, Duration::from_millis(250));
    assert_eq!((cfg.stream.width, cfg.stream.height), (640, 480));
    assert_eq!(cfg.stream.jpeg_quality, 70);
    assert_eq!(cfg.stream.buffer_count, 3);
    assert_eq!(cfg.control.url(), "ws://coordinator.local:9100/ws/device");
    assert_eq!(
        cfg.control.reconnect,
        ReconnectPolicy::Fixed {
            interval: Duration::from_millis(5000)
        }
    );

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
[http]
addr = "127.0.0.1:9090"

[control]
enabled = false
path = "/ctl"
"#,
    );

    let cfg = DeviceConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.http_addr, "127.0.0.1:9090");
    assert!(!cfg.control.enabled);
    assert_eq!(cfg.control.path, "/ctl");
    assert_eq!(cfg.stream.source, "stub://camera");
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMSTREAM_WS_PORT", "not-a-port");
    assert!(DeviceConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMSTREAM_WS_PATH", "device");
    assert!(DeviceConfig::load().is_err());
    clear_env();
}

#[test]
fn rejects_malformed_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".json", "{ \"http\": ");
    assert!(DeviceConfig::load_from(Some(file.path())).is_err());
    assert!(DeviceConfig::load_from(Some(std::path::Path::new("/nonexistent/camstream.json"))).is_err());
}
