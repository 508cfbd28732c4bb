//! Prometheus text exposition
//!
//! Formats monitor metrics plus presence gauges for `GET /metrics`. Every
//! series carries a `reader` label with the configured reader address.

use crate::domain::types::PresenceSnapshot;
use crate::infra::metrics::{Metrics, MetricsTotals, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with reader label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    reader: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{reader=\"{reader}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    reader: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{reader=\"{reader}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{reader=\"{reader}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{reader=\"{reader}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{reader=\"{reader}\"}} {count}");
}

/// Format metrics and the current presence view in Prometheus text format
///
/// Reads the cumulative counters only, so scraping does not disturb the
/// periodic summary log.
pub fn format_prometheus_metrics(metrics: &Metrics, snapshot: &PresenceSnapshot) -> String {
    let summary = metrics.totals();
    let reader = escape_label(&snapshot.ip);
    let mut output = String::with_capacity(4096);

    write_presence_metrics(&mut output, &reader, snapshot);
    write_cycle_metrics(&mut output, &reader, &summary);
    write_connection_metrics(&mut output, &reader, &summary);
    write_poll_latency_metrics(&mut output, &reader, &summary);

    output
}

fn write_presence_metrics(output: &mut String, reader: &str, snapshot: &PresenceSnapshot) {
    write_metric(
        output,
        "presence_active_tags",
        "Tags seen within the missing timeout",
        MetricType::Gauge,
        reader,
        snapshot.active_count as u64,
    );
    write_metric(
        output,
        "presence_missing_tags",
        "Tags not seen within the missing timeout",
        MetricType::Gauge,
        reader,
        snapshot.missing_count as u64,
    );
    write_metric(
        output,
        "presence_connection_state",
        "Reader connection state (0=disconnected 1=connecting 2=connected 3=failed)",
        MetricType::Gauge,
        reader,
        snapshot.connection_state.code(),
    );
    write_metric(
        output,
        "presence_monitoring",
        "1 while the polling loop is running",
        MetricType::Gauge,
        reader,
        u64::from(snapshot.monitoring),
    );
}

fn write_cycle_metrics(output: &mut String, reader: &str, summary: &MetricsTotals) {
    write_metric(
        output,
        "presence_cycles_total",
        "Poll cycles ingested",
        MetricType::Counter,
        reader,
        summary.cycles_total,
    );
    write_metric(
        output,
        "presence_empty_cycles_total",
        "Poll cycles that reported no tags",
        MetricType::Counter,
        reader,
        summary.empty_cycles_total,
    );
    write_metric(
        output,
        "presence_tags_read_total",
        "Tag sightings across all cycles",
        MetricType::Counter,
        reader,
        summary.tags_read_total,
    );
    write_metric(
        output,
        "presence_poll_timeouts_total",
        "Polls whose response did not complete in time",
        MetricType::Counter,
        reader,
        summary.poll_timeouts_total,
    );
    write_metric(
        output,
        "presence_snapshots_total",
        "Snapshots served",
        MetricType::Counter,
        reader,
        summary.snapshots_total,
    );
    write_metric(
        output,
        "presence_subscribers",
        "Connected streaming subscribers",
        MetricType::Gauge,
        reader,
        summary.subscribers,
    );
}

fn write_connection_metrics(output: &mut String, reader: &str, summary: &MetricsTotals) {
    write_metric(
        output,
        "presence_connect_attempts_total",
        "Reader connection attempts",
        MetricType::Counter,
        reader,
        summary.connect_attempts_total,
    );
    write_metric(
        output,
        "presence_connect_failures_total",
        "Reader connection attempts that failed",
        MetricType::Counter,
        reader,
        summary.connect_failures_total,
    );
    write_metric(
        output,
        "presence_session_drops_total",
        "Established reader sessions that were lost",
        MetricType::Counter,
        reader,
        summary.session_drops_total,
    );
    write_metric(
        output,
        "presence_loop_errors_total",
        "Unexpected polling loop errors",
        MetricType::Counter,
        reader,
        summary.loop_errors_total,
    );
}

fn write_poll_latency_metrics(output: &mut String, reader: &str, summary: &MetricsTotals) {
    write_histogram(
        output,
        "presence_poll_latency_ms",
        "Reader poll round-trip in milliseconds",
        reader,
        &summary.poll_lat_buckets,
        summary.poll_lat_sum_ms,
    );
    write_metric(
        output,
        "presence_poll_latency_p50_ms",
        "50th percentile poll round-trip",
        MetricType::Gauge,
        reader,
        summary.poll_lat_p50_ms,
    );
    write_metric(
        output,
        "presence_poll_latency_p99_ms",
        "99th percentile poll round-trip",
        MetricType::Gauge,
        reader,
        summary.poll_lat_p99_ms,
    );
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ConnectionState;

    fn snapshot() -> PresenceSnapshot {
        PresenceSnapshot {
            connection_state: ConnectionState::Connected,
            monitoring: true,
            ip: "192.168.29.201".to_string(),
            active_count: 5,
            missing_count: 2,
            active_tags: Vec::new(),
            missing_tags: Vec::new(),
            logs: Vec::new(),
        }
    }

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_cycle(3);
        metrics.record_cycle(0);
        metrics.record_poll_latency(12);
        metrics.record_connect_attempt();

        let output = format_prometheus_metrics(&metrics, &snapshot());

        assert!(output.contains("presence_active_tags{reader=\"192.168.29.201\"} 5"));
        assert!(output.contains("presence_missing_tags{reader=\"192.168.29.201\"} 2"));
        assert!(output.contains("presence_connection_state{reader=\"192.168.29.201\"} 2"));
        assert!(output.contains("presence_monitoring{reader=\"192.168.29.201\"} 1"));
        assert!(output.contains("presence_cycles_total{reader=\"192.168.29.201\"} 2"));
        assert!(output.contains("presence_empty_cycles_total{reader=\"192.168.29.201\"} 1"));
        assert!(output.contains("presence_connect_attempts_total{reader=\"192.168.29.201\"} 1"));
        assert!(output
            .contains("presence_poll_latency_ms_bucket{reader=\"192.168.29.201\",le=\"25\"} 1"));
        assert!(output.contains("presence_poll_latency_ms_count{reader=\"192.168.29.201\"} 1"));
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let mut buckets = [0u64; METRICS_NUM_BUCKETS];
        buckets[0] = 2;
        buckets[3] = 1;
        buckets[METRICS_NUM_BUCKETS - 1] = 1;
        let mut output = String::new();

        write_histogram(&mut output, "h", "help", "r", &buckets, 40);

        assert!(output.contains("h_bucket{reader=\"r\",le=\"5\"} 2"));
        assert!(output.contains("h_bucket{reader=\"r\",le=\"50\"} 3"));
        assert!(output.contains("h_bucket{reader=\"r\",le=\"5000\"} 3"));
        assert!(output.contains("h_bucket{reader=\"r\",le=\"+Inf\"} 4"));
        assert!(output.contains("h_sum{reader=\"r\"} 40"));
    }

    #[test]
    fn test_scrape_keeps_histogram_monotonic() {
        let metrics = Metrics::new();
        metrics.record_poll_latency(12);
        metrics.record_poll_latency(30);

        let first = format_prometheus_metrics(&metrics, &snapshot());
        assert!(first.contains("presence_poll_latency_ms_count{reader=\"192.168.29.201\"} 2"));
        assert!(first.contains("presence_poll_latency_ms_sum{reader=\"192.168.29.201\"} 42"));

        // The periodic reporter resets its own window, not the exposition
        let periodic = metrics.report();
        assert_eq!(periodic.poll_lat_buckets.iter().sum::<u64>(), 2);

        metrics.record_poll_latency(8);
        let second = format_prometheus_metrics(&metrics, &snapshot());
        assert!(second.contains("presence_poll_latency_ms_count{reader=\"192.168.29.201\"} 3"));
        assert!(second
            .contains("presence_poll_latency_ms_bucket{reader=\"192.168.29.201\",le=\"25\"} 2"));
        assert!(second.contains("presence_poll_latency_ms_sum{reader=\"192.168.29.201\"} 50"));
    }

    #[test]
    fn test_label_escaping() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }
}
