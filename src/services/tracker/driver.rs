//! Background polling loop
//!
//! One driver per started loop. Each outer iteration is a session:
//! connect, then poll and ingest until the session fails or shutdown is
//! signalled. Connection errors back off for the retry delay; anything else,
//! panics included, backs off for the shorter error delay. The loop only
//! exits on shutdown.
//!
//! ```text
//! connecting --ok--> connected --io error--> failed --retry delay--> connecting
//!     |                                        ^
//!     +-----------------connect error----------+
//! ```
//! Simulated links skip straight to `connected` and never fail.

use super::PresenceTracker;
use crate::domain::types::{ConnectionState, Severity, TagId};
use crate::infra::config::MonitorTimings;
use crate::io::reader::{ReaderError, ReaderLink};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Why a session ended
enum SessionEnd {
    Shutdown,
    /// Connect failed or the session dropped mid-poll
    Failed(ReaderError),
}

pub(super) struct Driver {
    tracker: Arc<PresenceTracker>,
    generation: u64,
    link: Box<dyn ReaderLink>,
    timings: MonitorTimings,
    shutdown: watch::Receiver<bool>,
    simulation_announced: bool,
}

impl Driver {
    pub(super) fn new(
        tracker: Arc<PresenceTracker>,
        generation: u64,
        link: Box<dyn ReaderLink>,
        timings: MonitorTimings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { tracker, generation, link, timings, shutdown, simulation_announced: false }
    }

    pub(super) async fn run(mut self) {
        info!(
            target_addr = %self.link.describe(),
            simulated = self.link.is_simulated(),
            generation = self.generation,
            "monitor_loop_started"
        );

        while !self.is_shutdown() {
            let outcome = AssertUnwindSafe(self.run_session()).catch_unwind().await;

            let backoff = match outcome {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Failed(err)) if err.is_connection_error() => {
                    self.tracker.log(format!("Connection failed: {err}"), Severity::Error);
                    self.timings.retry_delay
                }
                Ok(SessionEnd::Failed(err)) => {
                    self.tracker.metrics().record_loop_error();
                    self.tracker.log(format!("Monitor Loop Error: {err}"), Severity::Error);
                    self.timings.error_backoff
                }
                Err(panic) => {
                    self.tracker.metrics().record_loop_error();
                    let reason = panic_message(panic.as_ref());
                    self.tracker.log(format!("Monitor Loop Error: {reason}"), Severity::Error);
                    self.timings.error_backoff
                }
            };

            if !self.set_state(ConnectionState::Failed) || self.sleep_or_shutdown(backoff).await {
                break;
            }
        }

        info!(generation = self.generation, "monitor_loop_exited");
    }

    async fn run_session(&mut self) -> SessionEnd {
        let cadence = if self.link.is_simulated() {
            if !self.set_state(ConnectionState::Connected) {
                return SessionEnd::Shutdown;
            }
            if !self.simulation_announced {
                self.simulation_announced = true;
                self.tracker.log("Simulation started - generating tags", Severity::Success);
            }
            self.timings.simulation_interval
        } else {
            if let Some(end) = self.connect().await {
                return end;
            }
            self.timings.poll_interval
        };

        loop {
            if self.is_shutdown() {
                return SessionEnd::Shutdown;
            }

            let started = Instant::now();
            let polled = tokio::select! {
                result = self.link.poll_once() => result,
                _ = self.shutdown.changed() => return SessionEnd::Shutdown,
            };

            let tags = match polled {
                Ok(tags) => {
                    self.tracker
                        .metrics()
                        .record_poll_latency(started.elapsed().as_millis() as u64);
                    tags
                }
                Err(ReaderError::PollTimeout { timeout, received }) => {
                    self.tracker.metrics().record_poll_timeout();
                    debug!(
                        timeout_ms = timeout.as_millis() as u64,
                        received_bytes = received,
                        "reader_poll_timeout"
                    );
                    Vec::new()
                }
                Err(err) => {
                    if err.is_connection_error() {
                        self.tracker.metrics().record_session_drop();
                    }
                    return SessionEnd::Failed(err);
                }
            };

            if !self.ingest(&tags) {
                return SessionEnd::Shutdown;
            }

            if self.sleep_or_shutdown(cadence).await {
                return SessionEnd::Shutdown;
            }
        }
    }

    /// Open the reader session; `None` means connected
    async fn connect(&mut self) -> Option<SessionEnd> {
        let target = self.link.describe();
        if !self.set_state(ConnectionState::Connecting) {
            return Some(SessionEnd::Shutdown);
        }
        self.tracker.log(format!("Connecting to {target}..."), Severity::Info);
        self.tracker.metrics().record_connect_attempt();

        let connected = tokio::select! {
            result = self.link.connect() => result,
            _ = self.shutdown.changed() => return Some(SessionEnd::Shutdown),
        };

        if let Err(err) = connected {
            if err.is_connection_error() {
                self.tracker.metrics().record_connect_failure();
            }
            return Some(SessionEnd::Failed(err));
        }

        if !self.set_state(ConnectionState::Connected) {
            return Some(SessionEnd::Shutdown);
        }
        self.tracker.log(format!("Connected successfully to {target}"), Severity::Success);
        None
    }

    fn ingest(&self, tags: &[TagId]) -> bool {
        let accepted = self.tracker.ingest_for(self.generation, tags, SystemTime::now());
        if accepted {
            self.tracker.metrics().record_cycle(tags.len());
            trace!(tags = tags.len(), "cycle_ingested");
        }
        accepted
    }

    /// False once this loop has been superseded by a stop
    fn set_state(&self, state: ConnectionState) -> bool {
        self.tracker.set_connection_state_for(self.generation, state)
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay`; true if shutdown was signalled meanwhile
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.is_shutdown(),
            _ = self.shutdown.changed() => true,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in polling loop".to_string()
    }
}
