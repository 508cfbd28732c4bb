//! Presence tracking for a single reader zone
//!
//! The PresenceTracker owns the reader connection state, the map of every tag
//! ever seen with its last sighting, the latest cycle and a bounded operator
//! log. A single background loop (see `driver`) is the only writer; snapshot
//! readers copy state out under the same lock and do name lookups outside it.
//!
//! Tags are never evicted by age. "Missing" is derived at snapshot time by
//! comparing the age of the last sighting against the configured timeout;
//! the seen map is only cleared by `stop()`.

mod driver;

use crate::domain::types::{
    ConnectionState, LogEntry, PresenceSnapshot, Severity, TagId, TagSighting,
};
use crate::infra::config::{MonitorSettings, MonitorTimings};
use crate::infra::metrics::Metrics;
use crate::io::name_store::NameStore;
use crate::io::reader::LinkFactory;
use driver::Driver;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Operator log capacity; oldest entries are evicted first
pub const LOG_CAPACITY: usize = 50;

/// Mutable state behind the tracker lock
#[derive(Debug, Default)]
struct TrackerState {
    connection_state: ConnectionState,
    seen: FxHashMap<TagId, SystemTime>,
    latest_cycle: Vec<TagId>,
    log: VecDeque<LogEntry>,
    /// Bumped on every stop; writes tagged with an older generation are dropped
    generation: u64,
}

impl TrackerState {
    fn apply_cycle(&mut self, tag_ids: &[TagId], now: SystemTime) {
        for tag_id in tag_ids {
            self.seen.insert(tag_id.clone(), now);
        }
        self.latest_cycle = tag_ids.to_vec();
    }
}

/// Handle to the running background loop
struct Worker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct PresenceTracker {
    state: Mutex<TrackerState>,
    settings: Mutex<MonitorSettings>,
    timings: MonitorTimings,
    names: Arc<dyn NameStore>,
    links: Arc<dyn LinkFactory>,
    metrics: Arc<Metrics>,
    running: AtomicBool,
    /// Serializes start/stop/reconfigure; held across the bounded stop wait
    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl PresenceTracker {
    pub fn new(
        settings: MonitorSettings,
        timings: MonitorTimings,
        names: Arc<dyn NameStore>,
        links: Arc<dyn LinkFactory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            settings: Mutex::new(settings),
            timings,
            names,
            links,
            metrics,
            running: AtomicBool::new(false),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawn the polling loop. No-op while a loop is already running.
    ///
    /// An address override is written to the settings and used by the new loop.
    pub async fn start(self: &Arc<Self>, address: Option<String>) {
        let mut worker = self.worker.lock().await;
        self.start_locked(&mut worker, address);
    }

    /// Stop the polling loop and discard presence knowledge. Safe when idle.
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        self.stop_locked(&mut worker).await;
    }

    /// Apply new settings by stopping and restarting the loop
    pub async fn reconfigure(self: &Arc<Self>, settings: MonitorSettings) {
        let mut worker = self.worker.lock().await;
        self.stop_locked(&mut worker).await;
        info!(
            reader_address = %settings.reader_address,
            reader_port = settings.reader_port,
            missing_timeout_s = settings.missing_timeout.as_secs_f64(),
            simulation = settings.simulation_mode,
            "monitor_reconfigured"
        );
        *self.settings.lock() = settings;
        self.start_locked(&mut worker, None);
    }

    fn start_locked(self: &Arc<Self>, worker: &mut Option<Worker>, address: Option<String>) {
        if worker.is_some() {
            debug!("monitor_already_running");
            return;
        }

        let settings = {
            let mut settings = self.settings.lock();
            if let Some(address) = address {
                settings.reader_address = address;
            }
            settings.clone()
        };

        let link = self.links.create(&settings, &self.timings);
        let initial_state = if link.is_simulated() {
            ConnectionState::Connected
        } else {
            ConnectionState::Connecting
        };
        let generation = {
            let mut state = self.state.lock();
            state.connection_state = initial_state;
            state.generation
        };

        self.running.store(true, Ordering::SeqCst);
        self.log(format!("Starting monitor on {}...", settings.reader_address), Severity::Info);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = Driver::new(
            Arc::clone(self),
            generation,
            link,
            self.timings.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(driver.run());
        *worker = Some(Worker { shutdown_tx, handle });
    }

    async fn stop_locked(&self, worker: &mut Option<Worker>) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(Worker { shutdown_tx, mut handle }) = worker.take() {
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(self.timings.stop_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "monitor_loop_join_failed"),
                Err(_) => {
                    warn!(
                        grace_ms = self.timings.stop_grace.as_millis() as u64,
                        "monitor_loop_stop_timeout"
                    );
                    handle.abort();
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.generation += 1;
            state.connection_state = ConnectionState::Disconnected;
            state.seen.clear();
            state.latest_cycle.clear();
        }
        self.log("Monitor stopped", Severity::Warn);
    }

    /// Record one cycle: refresh every sighted tag and replace the latest cycle
    pub fn ingest(&self, tag_ids: &[TagId], now: SystemTime) {
        self.state.lock().apply_cycle(tag_ids, now);
    }

    /// Ingest on behalf of a loop; refused once that loop has been stopped
    fn ingest_for(&self, generation: u64, tag_ids: &[TagId], now: SystemTime) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.apply_cycle(tag_ids, now);
        true
    }

    fn set_connection_state_for(&self, generation: u64, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        if state.connection_state != next {
            debug!(from = state.connection_state.as_str(), to = next.as_str(), "connection_state");
            state.connection_state = next;
        }
        true
    }

    /// Copy out the presence view at `now`
    ///
    /// Active tags (age <= timeout) come most recently seen first; missing tags
    /// come longest missing first.
    pub fn snapshot(&self, now: SystemTime) -> PresenceSnapshot {
        let (ip, missing_timeout) = {
            let settings = self.settings.lock();
            (settings.reader_address.clone(), settings.missing_timeout)
        };

        let (connection_state, seen, logs) = {
            let state = self.state.lock();
            let seen: Vec<(TagId, SystemTime)> =
                state.seen.iter().map(|(id, last_seen)| (id.clone(), *last_seen)).collect();
            (state.connection_state, seen, state.log.iter().cloned().collect::<Vec<_>>())
        };

        let mut active_tags = Vec::new();
        let mut missing_tags = Vec::new();
        for (id, last_seen) in seen {
            let age = now.duration_since(last_seen).unwrap_or_default();
            let sighting = TagSighting { name: self.names.get_name(&id), id, last_seen, age };
            if age > missing_timeout {
                missing_tags.push(sighting);
            } else {
                active_tags.push(sighting);
            }
        }

        active_tags.sort_by(|a, b| a.age.cmp(&b.age).then_with(|| a.id.cmp(&b.id)));
        missing_tags.sort_by(|a, b| b.age.cmp(&a.age).then_with(|| a.id.cmp(&b.id)));

        self.metrics.record_snapshot();

        PresenceSnapshot {
            connection_state,
            monitoring: self.running.load(Ordering::SeqCst),
            ip,
            active_count: active_tags.len(),
            missing_count: missing_tags.len(),
            active_tags,
            missing_tags,
            logs,
        }
    }

    /// Append an operator log entry, evicting the oldest beyond capacity
    pub fn log(&self, message: impl Into<String>, severity: Severity) {
        let msg = message.into();
        match severity {
            Severity::Info | Severity::Success => {
                info!(severity = severity.as_str(), msg = %msg, "monitor_log")
            }
            Severity::Warn => warn!(msg = %msg, "monitor_log"),
            Severity::Error => error!(msg = %msg, "monitor_log"),
        }

        let entry =
            LogEntry { time: chrono::Local::now().format("%H:%M:%S").to_string(), msg, severity };

        let mut state = self.state.lock();
        state.log.push_back(entry);
        while state.log.len() > LOG_CAPACITY {
            state.log.pop_front();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection_state
    }

    pub fn settings(&self) -> MonitorSettings {
        self.settings.lock().clone()
    }

    /// Tags reported by the most recent cycle
    pub fn latest_cycle(&self) -> Vec<TagId> {
        self.state.lock().latest_cycle.clone()
    }

    pub fn last_seen(&self, tag_id: &TagId) -> Option<SystemTime> {
        self.state.lock().seen.get(tag_id).copied()
    }

    pub fn seen_count(&self) -> usize {
        self.state.lock().seen.len()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
