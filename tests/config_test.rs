//! Integration tests for configuration loading

use presence_monitor::infra::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[reader]
address = "10.20.30.40"
port = 4001
connect_timeout_ms = 750
read_timeout_ms = 1500
poll_command = "INV"

[monitor]
missing_timeout_secs = 12.5
simulation = true
autostart = true
poll_interval_ms = 250
retry_delay_ms = 5000

[server]
bind_address = "127.0.0.1"
port = 9000
publish_interval_ms = 1000

[store]
path = "/var/lib/presence/names.db"

[metrics]
interval_secs = 15
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.reader_address(), "10.20.30.40");
    assert_eq!(config.reader_port(), 4001);
    assert_eq!(config.poll_command(), "INV");
    assert_eq!(config.missing_timeout_secs(), 12.5);
    assert!(config.simulation());
    assert!(config.autostart());
    assert_eq!(config.bind_address(), "127.0.0.1");
    assert_eq!(config.server_port(), 9000);
    assert_eq!(config.publish_interval(), Duration::from_secs(1));
    assert_eq!(config.store_path(), "/var/lib/presence/names.db");
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.config_file(), temp_file.path().display().to_string());

    let settings = config.monitor_settings();
    assert_eq!(settings.reader_address, "10.20.30.40");
    assert_eq!(settings.missing_timeout, Duration::from_millis(12_500));
    assert!(settings.simulation_mode);

    let timings = config.monitor_timings();
    assert_eq!(timings.connect_timeout, Duration::from_millis(750));
    assert_eq!(timings.read_timeout, Duration::from_millis(1500));
    assert_eq!(timings.poll_interval, Duration::from_millis(250));
    assert_eq!(timings.retry_delay, Duration::from_secs(5));
    // Unset keys keep their defaults
    assert_eq!(timings.simulation_interval, Duration::from_millis(500));
    assert_eq!(timings.error_backoff, Duration::from_secs(1));
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/path/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.reader_address(), "192.168.29.201");
    assert_eq!(config.reader_port(), 2189);
    assert_eq!(config.server_port(), 8000);
}

#[test]
fn test_malformed_file_falls_back_to_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[reader\naddress = ").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());

    let config = Config::load_from_path(temp_file.path());
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.missing_timeout_secs(), 8.0);
}

#[test]
fn test_negative_timeout_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[monitor]\nmissing_timeout_secs = -1.0\n").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("missing_timeout_secs"));
}

#[test]
fn test_cli_overrides() {
    let config = Config::default().with_simulation(true).with_autostart(true);
    assert!(config.simulation());
    assert!(config.autostart());
    assert!(config.monitor_settings().simulation_mode);
}
