//! Sink statistics.
//!
//! Every sink owns a `SinkCounters` block updated from its worker and from
//! `receive`. Reporting takes snapshots and turns two consecutive ones into a
//! `StatsReport`, printed as one JSON line per interval.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters of one sink.
#[derive(Debug, Default)]
pub struct SinkCounters {
    forwarded_packets: AtomicU64,
    forwarded_bytes: AtomicU64,
    dropped_packets: AtomicU64,
    messages: AtomicU64,
    restarts: AtomicU64,
    missing_fields: AtomicU64,
}

impl SinkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one packet handed on, with its captured length.
    pub fn record_forwarded(&self, bytes: usize) {
        self.forwarded_packets.fetch_add(1, Ordering::Relaxed);
        self.forwarded_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count `packets` handed on together, carrying `bytes` captured bytes in total.
    pub fn record_forwarded_batch(&self, packets: usize, bytes: usize) {
        self.forwarded_packets.fetch_add(packets as u64, Ordering::Relaxed);
        self.forwarded_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one message transmitted (batch exporter only).
    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one reader process restart (pipe exporter only).
    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count template fields that did not resolve and were zero-filled.
    pub fn record_missing_fields(&self, count: usize) {
        if count > 0 {
            self.missing_fields.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            forwarded_packets: self.forwarded_packets.load(Ordering::Relaxed),
            forwarded_bytes: self.forwarded_bytes.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            missing_fields: self.missing_fields.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `SinkCounters`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub forwarded_packets: u64,
    pub forwarded_bytes: u64,
    pub dropped_packets: u64,
    pub messages: u64,
    pub restarts: u64,
    pub missing_fields: u64,
}

impl StatsSnapshot {
    /// Counter increase since `earlier`.
    pub fn delta_since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            forwarded_packets: self.forwarded_packets.saturating_sub(earlier.forwarded_packets),
            forwarded_bytes: self.forwarded_bytes.saturating_sub(earlier.forwarded_bytes),
            dropped_packets: self.dropped_packets.saturating_sub(earlier.dropped_packets),
            messages: self.messages.saturating_sub(earlier.messages),
            restarts: self.restarts.saturating_sub(earlier.restarts),
            missing_fields: self.missing_fields.saturating_sub(earlier.missing_fields),
        }
    }
}

/// One reporting interval of a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    /// Unix epoch seconds when the interval ended.
    pub timestamp: u64,
    pub sink: String,
    pub interval_ms: u64,
    /// Counter increases within the interval.
    pub interval: StatsSnapshot,
    /// Counter values at the end of the interval.
    pub total: StatsSnapshot,
    pub packets_per_sec: f64,
    pub bytes_per_sec: f64,
}

impl StatsReport {
    pub fn new(
        sink: &str,
        timestamp: u64,
        interval_ms: u64,
        previous: &StatsSnapshot,
        current: &StatsSnapshot,
    ) -> Self {
        let interval = current.delta_since(previous);
        let (packets_per_sec, bytes_per_sec) = if interval_ms == 0 {
            (0.0, 0.0)
        } else {
            let secs = interval_ms as f64 / 1000.0;
            (
                interval.forwarded_packets as f64 / secs,
                interval.forwarded_bytes as f64 / secs,
            )
        };
        Self {
            timestamp,
            sink: sink.to_string(),
            interval_ms,
            interval,
            total: *current,
            packets_per_sec,
            bytes_per_sec,
        }
    }

    /// Serialize to a JSON line (no trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================
    // SinkCounters Tests
    // =========================================

    #[test]
    fn test_counters_start_at_zero() {
        assert_eq!(SinkCounters::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_counters_record() {
        let counters = SinkCounters::new();
        counters.record_forwarded(60);
        counters.record_forwarded(1500);
        counters.record_dropped();
        counters.record_message();
        counters.record_restart();
        counters.record_missing_fields(0);
        counters.record_missing_fields(3);

        let snap = counters.snapshot();
        assert_eq!(snap.forwarded_packets, 2);
        assert_eq!(snap.forwarded_bytes, 1560);
        assert_eq!(snap.dropped_packets, 1);
        assert_eq!(snap.messages, 1);
        assert_eq!(snap.restarts, 1);
        assert_eq!(snap.missing_fields, 3);
    }

    #[test]
    fn test_counters_record_batch() {
        let counters = SinkCounters::new();
        counters.record_forwarded(60);
        counters.record_forwarded_batch(3, 200);

        let snap = counters.snapshot();
        assert_eq!(snap.forwarded_packets, 4);
        assert_eq!(snap.forwarded_bytes, 260);
    }

    // =========================================
    // StatsReport Tests
    // =========================================

    #[test]
    fn test_report_deltas_and_rates() {
        let previous = StatsSnapshot {
            forwarded_packets: 100,
            forwarded_bytes: 10_000,
            ..Default::default()
        };
        let current = StatsSnapshot {
            forwarded_packets: 300,
            forwarded_bytes: 50_000,
            dropped_packets: 4,
            ..Default::default()
        };

        let report = StatsReport::new("pipe", 1_704_067_200, 2_000, &previous, &current);
        assert_eq!(report.interval.forwarded_packets, 200);
        assert_eq!(report.interval.dropped_packets, 4);
        assert_eq!(report.total, current);
        assert_eq!(report.packets_per_sec, 100.0);
        assert_eq!(report.bytes_per_sec, 20_000.0);
    }

    #[test]
    fn test_report_zero_interval_has_zero_rates() {
        let snap = StatsSnapshot {
            forwarded_packets: 5,
            ..Default::default()
        };
        let report = StatsReport::new("ipfix", 0, 0, &StatsSnapshot::default(), &snap);
        assert_eq!(report.packets_per_sec, 0.0);
    }

    #[test]
    fn test_report_to_json() {
        let report = StatsReport::new(
            "ipfix",
            1_704_067_200,
            1_000,
            &StatsSnapshot::default(),
            &StatsSnapshot::default(),
        );
        let json = report.to_json().expect("serialize");
        assert!(json.contains("\"sink\":\"ipfix\""));
        assert!(json.contains("\"timestamp\":1704067200"));
        assert!(!json.contains('\n'));

        let parsed = StatsReport::from_json(&json).expect("parse");
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_delta_saturates_after_reset() {
        let earlier = StatsSnapshot {
            messages: 10,
            ..Default::default()
        };
        assert_eq!(StatsSnapshot::default().delta_since(&earlier).messages, 0);
    }
}
