//! Engine counters for monitoring throughput and hygiene.

use serde::Serialize;

/// Running totals kept by the engine.
///
/// The engine is single-writer, so these are plain counters; readers take a
/// [`snapshot`](EngineMetrics::snapshot) for a consistent view.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Frames accepted by the decoder.
    packets: u64,
    /// Total bytes across accepted frames.
    bytes: u64,
    /// Buffers the decoder rejected outright.
    parse_errors: u64,
    /// Accepted frames carrying a field-level malformation.
    malformed_frames: u64,
    /// Anomaly reports emitted.
    anomalies: u64,
    /// Flows dropped by TTL reaping.
    flows_reaped: u64,
    /// TCP state entries dropped by eviction.
    tcp_states_evicted: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_packet(&mut self, len: u32) {
        self.packets += 1;
        self.bytes += len as u64;
    }

    #[inline]
    pub(crate) fn record_parse_error(&mut self) {
        self.parse_errors += 1;
    }

    #[inline]
    pub(crate) fn record_malformed(&mut self) {
        self.malformed_frames += 1;
    }

    #[inline]
    pub(crate) fn record_anomalies(&mut self, count: usize) {
        self.anomalies += count as u64;
    }

    #[inline]
    pub(crate) fn record_flows_reaped(&mut self, count: usize) {
        self.flows_reaped += count as u64;
    }

    #[inline]
    pub(crate) fn record_tcp_evicted(&mut self, count: usize) {
        self.tcp_states_evicted += count as u64;
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            packets: self.packets,
            bytes: self.bytes,
            parse_errors: self.parse_errors,
            malformed_frames: self.malformed_frames,
            anomalies: self.anomalies,
            flows_reaped: self.flows_reaped,
            tcp_states_evicted: self.tcp_states_evicted,
        }
    }
}

/// A point-in-time snapshot of engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineMetricsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub parse_errors: u64,
    pub malformed_frames: u64,
    pub anomalies: u64,
    pub flows_reaped: u64,
    pub tcp_states_evicted: u64,
}

impl EngineMetricsSnapshot {
    /// Fraction of accepted frames carrying a malformation.
    ///
    /// Returns `None` before any frame was accepted.
    pub fn malformed_rate(&self) -> Option<f64> {
        if self.packets == 0 {
            None
        } else {
            Some(self.malformed_frames as f64 / self.packets as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let mut metrics = EngineMetrics::new();

        metrics.record_packet(100);
        metrics.record_packet(50);
        metrics.record_parse_error();
        metrics.record_malformed();
        metrics.record_anomalies(3);
        metrics.record_flows_reaped(2);
        metrics.record_tcp_evicted(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets, 2);
        assert_eq!(snapshot.bytes, 150);
        assert_eq!(snapshot.parse_errors, 1);
        assert_eq!(snapshot.malformed_frames, 1);
        assert_eq!(snapshot.anomalies, 3);
        assert_eq!(snapshot.flows_reaped, 2);
        assert_eq!(snapshot.tcp_states_evicted, 1);
    }

    #[test]
    fn test_malformed_rate() {
        let mut metrics = EngineMetrics::new();
        assert_eq!(metrics.snapshot().malformed_rate(), None);

        metrics.record_packet(10);
        metrics.record_packet(10);
        metrics.record_packet(10);
        metrics.record_packet(10);
        metrics.record_malformed();

        assert_eq!(metrics.snapshot().malformed_rate(), Some(0.25));
    }
}
