//! Configuration loading from TOML files
//!
//! The binary picks the file from `--config`, then the `CONFIG_FILE`
//! environment variable, then `config/dev.toml`. A missing or invalid file
//! falls back to built-in defaults.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    #[serde(default = "default_reader_address")]
    pub address: String,
    #[serde(default = "default_reader_port")]
    pub port: u16,
    #[serde(default = "default_io_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Literal sent once per cycle, CRLF appended on the wire
    #[serde(default = "default_poll_command")]
    pub poll_command: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            address: default_reader_address(),
            port: default_reader_port(),
            connect_timeout_ms: default_io_timeout_ms(),
            read_timeout_ms: default_io_timeout_ms(),
            poll_command: default_poll_command(),
        }
    }
}

fn default_reader_address() -> String {
    "192.168.29.201".to_string()
}

fn default_reader_port() -> u16 {
    2189
}

fn default_io_timeout_ms() -> u64 {
    2000
}

fn default_poll_command() -> String {
    "READ".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Tags unseen for longer than this are reported as missing
    #[serde(default = "default_missing_timeout_secs")]
    pub missing_timeout_secs: f64,
    #[serde(default)]
    pub simulation: bool,
    /// Start polling at boot instead of waiting for POST /start
    #[serde(default)]
    pub autostart: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_simulation_interval_ms")]
    pub simulation_interval_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            missing_timeout_secs: default_missing_timeout_secs(),
            simulation: false,
            autostart: false,
            poll_interval_ms: default_poll_interval_ms(),
            simulation_interval_ms: default_simulation_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

fn default_missing_timeout_secs() -> f64 {
    8.0
}

fn default_poll_interval_ms() -> u64 {
    400
}

fn default_simulation_interval_ms() -> u64 {
    500
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_error_backoff_ms() -> u64 {
    1000
}

fn default_stop_grace_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Cadence of snapshot pushes to each stream subscriber
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_server_port(),
            publish_interval_ms: default_publish_interval_ms(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8000
}

fn default_publish_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding tag display names
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

fn default_store_path() -> String {
    "rfid.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Periodic summary log interval (0 to disable)
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Runtime-mutable monitor settings.
///
/// Replaced as a whole on reconfiguration; a running loop keeps the copy it was
/// started with.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub reader_address: String,
    pub reader_port: u16,
    pub missing_timeout: Duration,
    pub simulation_mode: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Config::default().monitor_settings()
    }
}

/// Fixed cadences and timeouts of the polling loop
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorTimings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    pub simulation_interval: Duration,
    pub retry_delay: Duration,
    pub error_backoff: Duration,
    pub stop_grace: Duration,
}

impl Default for MonitorTimings {
    fn default() -> Self {
        Config::default().monitor_timings()
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    reader_address: String,
    reader_port: u16,
    connect_timeout_ms: u64,
    read_timeout_ms: u64,
    poll_command: String,
    missing_timeout_secs: f64,
    simulation: bool,
    autostart: bool,
    poll_interval_ms: u64,
    simulation_interval_ms: u64,
    retry_delay_ms: u64,
    error_backoff_ms: u64,
    stop_grace_ms: u64,
    bind_address: String,
    server_port: u16,
    publish_interval_ms: u64,
    store_path: String,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let TomlConfig { reader, monitor, server, store, metrics } = toml_config;
        Self {
            reader_address: reader.address,
            reader_port: reader.port,
            connect_timeout_ms: reader.connect_timeout_ms,
            read_timeout_ms: reader.read_timeout_ms,
            poll_command: reader.poll_command,
            missing_timeout_secs: monitor.missing_timeout_secs,
            simulation: monitor.simulation,
            autostart: monitor.autostart,
            poll_interval_ms: monitor.poll_interval_ms,
            simulation_interval_ms: monitor.simulation_interval_ms,
            retry_delay_ms: monitor.retry_delay_ms,
            error_backoff_ms: monitor.error_backoff_ms,
            stop_grace_ms: monitor.stop_grace_ms,
            bind_address: server.bind_address,
            server_port: server.port,
            publish_interval_ms: server.publish_interval_ms,
            store_path: store.path,
            metrics_interval_secs: metrics.interval_secs,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if Duration::try_from_secs_f64(toml_config.monitor.missing_timeout_secs).is_err() {
            anyhow::bail!(
                "Invalid monitor.missing_timeout_secs {} in {}",
                toml_config.monitor.missing_timeout_secs,
                path.display()
            );
        }

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Initial runtime settings for the tracker
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            reader_address: self.reader_address.clone(),
            reader_port: self.reader_port,
            missing_timeout: Duration::from_secs_f64(self.missing_timeout_secs),
            simulation_mode: self.simulation,
        }
    }

    pub fn monitor_timings(&self) -> MonitorTimings {
        MonitorTimings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            simulation_interval: Duration::from_millis(self.simulation_interval_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }

    pub fn reader_address(&self) -> &str {
        &self.reader_address
    }

    pub fn reader_port(&self) -> u16 {
        self.reader_port
    }

    pub fn poll_command(&self) -> &str {
        &self.poll_command
    }

    pub fn missing_timeout_secs(&self) -> f64 {
        self.missing_timeout_secs
    }

    pub fn simulation(&self) -> bool {
        self.simulation
    }

    pub fn autostart(&self) -> bool {
        self.autostart
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn publish_interval_ms(&self) -> u64 {
        self.publish_interval_ms
    }

    /// Snapshot push cadence; never zero
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms.max(1))
    }

    pub fn store_path(&self) -> &str {
        &self.store_path
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Force simulation mode (CLI override)
    pub fn with_simulation(mut self, simulation: bool) -> Self {
        self.simulation = simulation;
        self
    }

    /// Force autostart (CLI override)
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.reader_address(), "192.168.29.201");
        assert_eq!(config.reader_port(), 2189);
        assert_eq!(config.poll_command(), "READ");
        assert_eq!(config.missing_timeout_secs(), 8.0);
        assert!(!config.simulation());
        assert!(!config.autostart());
        assert_eq!(config.server_port(), 8000);
        assert_eq!(config.publish_interval_ms(), 500);
        assert_eq!(config.store_path(), "rfid.db");
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_default_timings() {
        let timings = MonitorTimings::default();
        assert_eq!(timings.connect_timeout, Duration::from_secs(2));
        assert_eq!(timings.read_timeout, Duration::from_secs(2));
        assert_eq!(timings.poll_interval, Duration::from_millis(400));
        assert_eq!(timings.simulation_interval, Duration::from_millis(500));
        assert_eq!(timings.retry_delay, Duration::from_secs(2));
        assert_eq!(timings.error_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_monitor_settings_from_config() {
        let settings = Config::default().with_simulation(true).monitor_settings();
        assert_eq!(settings.reader_address, "192.168.29.201");
        assert_eq!(settings.missing_timeout, Duration::from_secs(8));
        assert!(settings.simulation_mode);
    }

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[reader]
address = "10.0.0.5"

[monitor]
simulation = true
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.reader_address(), "10.0.0.5");
        assert_eq!(config.reader_port(), 2189);
        assert!(config.simulation());
        assert_eq!(config.missing_timeout_secs(), 8.0);
    }
}
