//! Operator commands against a single tracker
//!
//! Thin layer between the HTTP surface and the tracker: validates
//! reconfiguration requests, fills in omitted fields from the current
//! settings and delegates renames to the name store.

use crate::domain::types::TagId;
use crate::infra::config::MonitorSettings;
use crate::io::name_store::NameStore;
use crate::services::tracker::PresenceTracker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq)]
pub enum ControlError {
    #[error("timeout must be a finite, non-negative number of seconds (got {0})")]
    InvalidTimeout(f64),
    #[error("reader address must not be empty")]
    EmptyAddress,
}

/// Body of a reconfiguration request; omitted `ip`/`port` keep current values
#[derive(Debug, Clone, Deserialize)]
pub struct ReconfigureRequest {
    pub timeout: f64,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub simulation: bool,
}

/// Settings actually applied, echoed back to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedConfig {
    pub timeout: f64,
    pub ip: String,
    pub port: u16,
    pub simulation: bool,
}

impl From<&MonitorSettings> for AppliedConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            timeout: settings.missing_timeout.as_secs_f64(),
            ip: settings.reader_address.clone(),
            port: settings.reader_port,
            simulation: settings.simulation_mode,
        }
    }
}

impl ReconfigureRequest {
    /// Merge onto the current settings
    pub fn resolve(&self, current: &MonitorSettings) -> Result<MonitorSettings, ControlError> {
        let missing_timeout = Duration::try_from_secs_f64(self.timeout)
            .map_err(|_| ControlError::InvalidTimeout(self.timeout))?;

        let reader_address = match &self.ip {
            Some(ip) if ip.trim().is_empty() => return Err(ControlError::EmptyAddress),
            Some(ip) => ip.trim().to_string(),
            None => current.reader_address.clone(),
        };

        Ok(MonitorSettings {
            reader_address,
            reader_port: self.port.unwrap_or(current.reader_port),
            missing_timeout,
            simulation_mode: self.simulation,
        })
    }
}

#[derive(Clone)]
pub struct ControlSurface {
    tracker: Arc<PresenceTracker>,
    names: Arc<dyn NameStore>,
}

impl ControlSurface {
    pub fn new(tracker: Arc<PresenceTracker>, names: Arc<dyn NameStore>) -> Self {
        Self { tracker, names }
    }

    pub fn tracker(&self) -> &Arc<PresenceTracker> {
        &self.tracker
    }

    /// Start monitoring, optionally against a different reader address
    pub async fn start(&self, address: Option<String>) {
        let address = address.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
        self.tracker.start(address).await;
    }

    pub async fn stop(&self) {
        self.tracker.stop().await;
    }

    /// Validate, then stop and restart the loop with the merged settings
    pub async fn reconfigure(
        &self,
        request: &ReconfigureRequest,
    ) -> Result<AppliedConfig, ControlError> {
        let settings = request.resolve(&self.tracker.settings())?;
        let applied = AppliedConfig::from(&settings);
        self.tracker.reconfigure(settings).await;
        Ok(applied)
    }

    /// Store a display name for a tag; false when the store write failed
    pub fn rename(&self, tag_id: &TagId, name: &str) -> bool {
        let renamed = self.names.set_name(tag_id, name);
        if renamed {
            info!(tag_id = %tag_id, "control_rename");
        }
        renamed
    }
}
