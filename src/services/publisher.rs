//! Fixed-cadence snapshot push to streaming subscribers
//!
//! One `serve` call per subscriber. The cadence is independent of the reader
//! cycle; a subscriber that goes away is noticed when its channel closes.

use crate::domain::types::PresenceSnapshot;
use crate::infra::metrics::Metrics;
use crate::services::tracker::PresenceTracker;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

#[derive(Clone)]
pub struct PresencePublisher {
    tracker: Arc<PresenceTracker>,
    interval: Duration,
}

/// Keeps the subscriber gauge right even if `serve` is cancelled
struct SubscriberGuard(Arc<Metrics>);

impl SubscriberGuard {
    fn new(metrics: Arc<Metrics>) -> Self {
        metrics.subscriber_connected();
        Self(metrics)
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.0.subscriber_disconnected();
    }
}

impl PresencePublisher {
    pub fn new(tracker: Arc<PresenceTracker>, interval: Duration) -> Self {
        Self { tracker, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Push a snapshot every interval until the receiving side is dropped
    pub async fn serve(&self, tx: mpsc::Sender<PresenceSnapshot>) {
        let _guard = SubscriberGuard::new(Arc::clone(self.tracker.metrics()));
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut pushed = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tx.closed() => break,
            }

            let snapshot = self.tracker.snapshot(SystemTime::now());
            if tx.send(snapshot).await.is_err() {
                break;
            }
            pushed += 1;
        }

        debug!(pushed, "subscriber_gone");
    }
}
