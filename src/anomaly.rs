//! Rolling-window anomaly detection.
//!
//! The detector keeps a fixed-capacity ring of recent packet samples and
//! checks every frame for malformations, TCP protocol violations, rate
//! excursions, and an unexpected share of unrecognized protocols over the
//! detection window.

use crate::addr::EndpointAddr;
use crate::decode::{DecodedFrame, TransportLayer};
use crate::events::AnomalyHooks;
use crate::protocol::ProtocolType;
use crate::tcp::{SocketPair, TcpTracker};

use serde::Serialize;
use tracing::warn;

use std::collections::{BTreeMap, VecDeque};

/// Samples required before rate and mix checks engage.
const MIN_SAMPLES: usize = 100;

/// Anomaly severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Anomaly category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnomalyKind {
    MalformedPacket,
    ProtocolViolation,
    RateLimitExceeded,
    UnexpectedProtocol,
}

impl AnomalyKind {
    pub const fn name(self) -> &'static str {
        match self {
            AnomalyKind::MalformedPacket => "malformed_packet",
            AnomalyKind::ProtocolViolation => "protocol_violation",
            AnomalyKind::RateLimitExceeded => "rate_limit_exceeded",
            AnomalyKind::UnexpectedProtocol => "unexpected_protocol",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed value carried in a report's `extra` map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Float(f64),
    Int(u64),
    Text(String),
}

/// One detected anomaly. Immutable once emitted.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub kind: AnomalyKind,
    pub protocol: ProtocolType,
    pub source: String,
    pub destination: String,
    pub description: String,
    pub severity: Severity,
    pub confidence: f32,
    pub timestamp: u64,
    pub extra: BTreeMap<String, ExtraValue>,
}

#[derive(Debug, Clone, Copy)]
struct PacketSample {
    timestamp: u64,
    protocol: ProtocolType,
    length: u32,
    /// Carried for future per-endpoint window checks.
    #[allow(dead_code)]
    source: Option<EndpointAddr>,
    #[allow(dead_code)]
    dest: Option<EndpointAddr>,
}

/// Fixed-capacity ring of recent packet samples; the oldest entry is
/// overwritten on push.
#[derive(Debug)]
struct RollingBuffer {
    samples: VecDeque<PacketSample>,
    capacity: usize,
}

impl RollingBuffer {
    fn new(capacity: usize) -> Self {
        RollingBuffer {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: PacketSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    /// Count, oldest timestamp and unknown-protocol count of the samples
    /// within the window ending at `now`.
    ///
    /// Walks newest-to-oldest and stops at the first sample outside the
    /// window; arrival order is assumed near-monotone, which capture
    /// sources provide.
    fn window_stats(&self, now: u64, window_us: u64) -> WindowStats {
        let cutoff = now.saturating_sub(window_us);
        let mut stats = WindowStats {
            count: 0,
            bytes: 0,
            unknown: 0,
            oldest: now,
        };
        for sample in self.samples.iter().rev() {
            if sample.timestamp < cutoff {
                break;
            }
            stats.count += 1;
            stats.bytes += sample.length as u64;
            stats.oldest = sample.timestamp;
            if sample.protocol == ProtocolType::Unknown {
                stats.unknown += 1;
            }
        }
        stats
    }
}

struct WindowStats {
    count: usize,
    bytes: u64,
    unknown: usize,
    oldest: u64,
}

/// Per-engine anomaly detector.
#[derive(Debug)]
pub struct AnomalyDetector {
    buffer: RollingBuffer,
    window_us: u64,
    packet_rate_threshold: f64,
    unknown_ratio_threshold: f64,
    tcp: TcpTracker,
    hooks: AnomalyHooks,
}

impl AnomalyDetector {
    pub(crate) fn new(
        buffer_capacity: usize,
        window_us: u64,
        packet_rate_threshold: f64,
        unknown_ratio_threshold: f64,
        tcp: TcpTracker,
        hooks: AnomalyHooks,
    ) -> Self {
        AnomalyDetector {
            buffer: RollingBuffer::new(buffer_capacity),
            window_us,
            packet_rate_threshold,
            unknown_ratio_threshold,
            tcp,
            hooks,
        }
    }

    /// Checks one decoded frame; returns every anomaly it triggered.
    pub fn observe(&mut self, frame: &DecodedFrame) -> Vec<AnomalyReport> {
        let mut reports = Vec::new();

        self.buffer.push(PacketSample {
            timestamp: frame.timestamp,
            protocol: frame.protocol,
            length: frame.total_len,
            source: frame.source,
            dest: frame.dest,
        });

        if let Some(malformation) = frame.malformation {
            reports.push(AnomalyReport {
                kind: AnomalyKind::MalformedPacket,
                protocol: frame.protocol,
                source: render_endpoint(frame.source),
                destination: render_endpoint(frame.dest),
                description: malformation.to_string(),
                severity: Severity::Medium,
                confidence: 0.9,
                timestamp: frame.timestamp,
                extra: BTreeMap::new(),
            });
        }

        if let Some(violation) = self.track_tcp(frame) {
            reports.push(AnomalyReport {
                kind: AnomalyKind::ProtocolViolation,
                protocol: frame.protocol,
                source: render_endpoint(frame.source),
                destination: render_endpoint(frame.dest),
                description: violation,
                severity: Severity::Medium,
                confidence: 0.7,
                timestamp: frame.timestamp,
                extra: BTreeMap::new(),
            });
        }

        if self.buffer.len() >= MIN_SAMPLES {
            let stats = self.buffer.window_stats(frame.timestamp, self.window_us);
            if stats.count > 0 {
                let span_us = frame.timestamp.saturating_sub(stats.oldest).max(1);
                let packet_rate = stats.count as f64 * 1_000_000.0 / span_us as f64;
                if packet_rate > self.packet_rate_threshold {
                    let byte_rate = stats.bytes as f64 * 1_000_000.0 / span_us as f64;
                    let mut extra = BTreeMap::new();
                    extra.insert("packet_rate".to_string(), ExtraValue::Float(packet_rate));
                    extra.insert("byte_rate".to_string(), ExtraValue::Float(byte_rate));
                    reports.push(AnomalyReport {
                        kind: AnomalyKind::RateLimitExceeded,
                        protocol: ProtocolType::Unknown,
                        source: "network".to_string(),
                        destination: "network".to_string(),
                        description: format!("High packet rate detected: {packet_rate:.1} pps"),
                        severity: Severity::High,
                        confidence: 0.8,
                        timestamp: frame.timestamp,
                        extra,
                    });
                }

                let ratio = stats.unknown as f64 / stats.count as f64;
                if ratio > self.unknown_ratio_threshold {
                    let mut extra = BTreeMap::new();
                    extra.insert("protocol_ratio".to_string(), ExtraValue::Float(ratio));
                    reports.push(AnomalyReport {
                        kind: AnomalyKind::UnexpectedProtocol,
                        protocol: ProtocolType::Unknown,
                        source: "network".to_string(),
                        destination: "network".to_string(),
                        description: format!(
                            "Unexpected protocol frequency: {:.1}%",
                            ratio * 100.0
                        ),
                        severity: Severity::Medium,
                        confidence: 0.6,
                        timestamp: frame.timestamp,
                        extra,
                    });
                }
            }
        }

        for report in &reports {
            warn!(
                kind = report.kind.name(),
                severity = ?report.severity,
                description = %report.description,
                "anomaly detected"
            );
            self.hooks.trigger(report);
        }
        reports
    }

    fn track_tcp(&mut self, frame: &DecodedFrame) -> Option<String> {
        let Some(TransportLayer::Tcp {
            src_port,
            dst_port,
            sequence,
            acknowledgment,
            flags,
        }) = frame.transport
        else {
            return None;
        };
        let (source, dest) = match (frame.source, frame.dest) {
            (Some(source), Some(dest)) => (source, dest),
            _ => return None,
        };

        self.tcp.observe(
            SocketPair::new(source, src_port, dest, dst_port),
            sequence,
            acknowledgment,
            flags,
            frame.timestamp,
        )
    }

    /// Drops stale TCP state; returns how many entries went.
    pub fn evict_tcp(&mut self, now: u64) -> usize {
        self.tcp.evict(now)
    }

    /// Read access to the TCP tracker (state inspection, tests).
    pub fn tcp_tracker(&self) -> &TcpTracker {
        &self.tcp
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }
}

fn render_endpoint(addr: Option<EndpointAddr>) -> String {
    match addr {
        Some(addr) => addr.to_string(),
        None => "unknown".to_string(),
    }
}
