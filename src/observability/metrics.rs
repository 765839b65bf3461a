//! Metrics registry for the relay
//!
//! - Counters are monotonic and reset only on process start
//! - Per-stream series are created on first use
//! - Thread-safe; hot paths touch only atomics once a series exists

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::hub::{BroadcastReport, StreamId};

/// Prometheus default histogram buckets, in seconds
pub const PROCESSING_TIME_BUCKETS: [f64; 11] =
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Cumulative histogram over `PROCESSING_TIME_BUCKETS`
#[derive(Debug, Default)]
struct Histogram {
    buckets: [AtomicU64; PROCESSING_TIME_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn observe(&self, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        for (bound, bucket) in PROCESSING_TIME_BUCKETS.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: PROCESSING_TIME_BUCKETS
                .iter()
                .zip(&self.buckets)
                .map(|(bound, count)| (*bound, count.load(Ordering::Relaxed)))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_seconds: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

#[derive(Debug, Default)]
struct StreamSeries {
    received: AtomicU64,
    sent: AtomicU64,
    broadcast: AtomicU64,
    evicted: AtomicU64,
    transform_failures: AtomicU64,
    processing_time: Histogram,
}

/// Relay-wide counters plus per-stream series
#[derive(Debug, Default)]
pub struct RelayMetrics {
    streams_created: AtomicU64,
    streams: RwLock<HashMap<String, Arc<StreamSeries>>>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(&self, stream_id: &StreamId) -> Arc<StreamSeries> {
        if let Some(series) = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id.as_str())
        {
            return Arc::clone(series);
        }

        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(streams.entry(stream_id.to_string()).or_default())
    }

    pub fn increment_streams_created(&self) {
        self.streams_created.fetch_add(1, Ordering::Relaxed);
    }

    /// A send request reached an existing stream
    pub fn increment_received(&self, stream_id: &StreamId) {
        self.series(stream_id).received.fetch_add(1, Ordering::Relaxed);
    }

    /// The durable log acknowledged a payload after `elapsed`
    pub fn record_sent(&self, stream_id: &StreamId, elapsed: Duration) {
        let series = self.series(stream_id);
        series.sent.fetch_add(1, Ordering::Relaxed);
        series.processing_time.observe(elapsed);
    }

    /// A send gave up after `elapsed` without an acknowledgment
    pub fn record_send_failed(&self, stream_id: &StreamId, elapsed: Duration) {
        self.series(stream_id).processing_time.observe(elapsed);
    }

    pub fn record_broadcast(&self, stream_id: &StreamId, report: &BroadcastReport) {
        let series = self.series(stream_id);
        series
            .broadcast
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        series
            .evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
    }

    pub fn increment_transform_failures(&self, stream_id: &StreamId) {
        self.series(stream_id)
            .transform_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn streams_created(&self) -> u64 {
        self.streams_created.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every series
    pub fn snapshot(&self) -> MetricsSnapshot {
        let streams = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, series)| {
                (
                    id.clone(),
                    StreamMetricsSnapshot {
                        messages_received: series.received.load(Ordering::Relaxed),
                        messages_sent: series.sent.load(Ordering::Relaxed),
                        messages_broadcast: series.broadcast.load(Ordering::Relaxed),
                        subscribers_evicted: series.evicted.load(Ordering::Relaxed),
                        transform_failures: series.transform_failures.load(Ordering::Relaxed),
                        processing_time: series.processing_time.snapshot(),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            streams_created: self.streams_created(),
            streams,
        }
    }

    /// Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        let _ = writeln!(out, "# HELP streams_created_total Total number of streams created");
        let _ = writeln!(out, "# TYPE streams_created_total counter");
        let _ = writeln!(out, "streams_created_total {}", snapshot.streams_created);

        let counters: [(&str, &str, fn(&StreamMetricsSnapshot) -> u64); 5] = [
            (
                "messages_received_total",
                "Total number of messages received",
                |s| s.messages_received,
            ),
            (
                "messages_sent_total",
                "Total number of messages accepted by the durable log",
                |s| s.messages_sent,
            ),
            (
                "messages_broadcast_total",
                "Total number of frames queued to subscribers",
                |s| s.messages_broadcast,
            ),
            (
                "subscribers_evicted_total",
                "Total number of subscribers evicted for backpressure",
                |s| s.subscribers_evicted,
            ),
            (
                "transform_failures_total",
                "Total number of records skipped by the consumer transform",
                |s| s.transform_failures,
            ),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            for (stream_id, series) in &snapshot.streams {
                let _ = writeln!(
                    out,
                    "{name}{{stream_id=\"{}\"}} {}",
                    escape_label(stream_id),
                    value(series)
                );
            }
        }

        let name = "message_processing_time_seconds";
        let _ = writeln!(out, "# HELP {name} Time taken to accept a message");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (stream_id, series) in &snapshot.streams {
            let label = escape_label(stream_id);
            let histogram = &series.processing_time;
            for (bound, count) in &histogram.buckets {
                let _ = writeln!(
                    out,
                    "{name}_bucket{{stream_id=\"{label}\",le=\"{bound}\"}} {count}"
                );
            }
            let _ = writeln!(
                out,
                "{name}_bucket{{stream_id=\"{label}\",le=\"+Inf\"}} {}",
                histogram.count
            );
            let _ = writeln!(
                out,
                "{name}_sum{{stream_id=\"{label}\"}} {}",
                histogram.sum_seconds
            );
            let _ = writeln!(
                out,
                "{name}_count{{stream_id=\"{label}\"}} {}",
                histogram.count
            );
        }

        out
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub streams_created: u64,
    pub streams: BTreeMap<String, StreamMetricsSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMetricsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_broadcast: u64,
    pub subscribers_evicted: u64,
    pub transform_failures: u64,
    pub processing_time: HistogramSnapshot,
}

/// Cumulative bucket counts keyed by upper bound
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<(f64, u64)>,
    pub count: u64,
    pub sum_seconds: f64,
}
