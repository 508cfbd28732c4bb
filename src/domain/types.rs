//! Shared types for the presence monitor

use serde::{Deserialize, Serialize, Serializer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Newtype wrapper for RFID tag identifiers as reported by the reader
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(pub String);

impl TagId {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TagId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TagId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Connection state of the reader session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }

    /// Gauge value for Prometheus (0=disconnected, 1=connecting, 2=connected, 3=failed)
    pub fn code(&self) -> u64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Failed => 3,
        }
    }
}

/// Severity of an operator-visible log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

/// Operator-visible log entry carried in every snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Local wall-clock time, `HH:MM:SS`
    pub time: String,
    pub msg: String,
    #[serde(rename = "type")]
    pub severity: Severity,
}

/// A tag as presented to consumers, derived at snapshot time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagSighting {
    pub id: TagId,
    pub name: String,
    #[serde(serialize_with = "serialize_epoch_secs")]
    pub last_seen: SystemTime,
    #[serde(rename = "age_seconds", serialize_with = "serialize_age")]
    pub age: Duration,
}

/// Presence view handed to the control surface and stream subscribers
#[derive(Debug, Clone, Serialize)]
pub struct PresenceSnapshot {
    pub connection_state: ConnectionState,
    pub monitoring: bool,
    pub ip: String,
    pub active_count: usize,
    pub missing_count: usize,
    pub active_tags: Vec<TagSighting>,
    pub missing_tags: Vec<TagSighting>,
    pub logs: Vec<LogEntry>,
}

/// Seconds since the Unix epoch, fractional
#[inline]
pub fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Age in seconds rounded to one decimal place
#[inline]
pub fn age_secs_rounded(age: Duration) -> f64 {
    (age.as_secs_f64() * 10.0).round() / 10.0
}

fn serialize_epoch_secs<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(epoch_secs(*t))
}

fn serialize_age<S: Serializer>(age: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(age_secs_rounded(*age))
}
