#![doc = include_str!("../README.md")]

pub mod addr;
pub mod anomaly;
pub mod decode;
pub mod deploy;
pub mod events;
pub mod flow;
pub mod metrics;
pub mod protocol;
pub mod tcp;
pub mod topology;

use crate::addr::{MemoryOuiDb, OuiDb};
use crate::anomaly::{AnomalyDetector, AnomalyReport};
use crate::decode::decode;
use crate::events::AnomalyHooks;
use crate::flow::{ClassificationRule, FlowClassifier, FlowStats, FlowSummary};
use crate::metrics::{EngineMetrics, EngineMetricsSnapshot};
use crate::protocol::{ProtocolType, ServiceHint};
use crate::tcp::TcpTracker;
use crate::topology::{TopologyGraph, TopologySnapshot};

use ipnet::Ipv4Net;
use serde::Serialize;
use tracing::trace;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

// Re-export the working set for convenience
pub use crate::addr::{EndpointAddr, MacAddr};
pub use crate::anomaly::{AnomalyKind, Severity};
pub use crate::decode::DecodedFrame;
pub use crate::deploy::{ShardedEngine, SharedEngine};
pub use crate::flow::{FlowId, flow_id};
pub use crate::tcp::TcpState;

/// Traffic direction relative to the configured local networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Inbound,
    Outbound,
    Lateral,
    Unknown,
}

/// Rendered per-packet summary of the decoded frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameSummary {
    pub timestamp: u64,
    pub length: u32,
    pub protocol: ProtocolType,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub service: Option<ServiceHint>,
    /// Present only when local networks were configured; never a silent
    /// `Unknown` placeholder.
    pub direction: Option<Direction>,
}

/// Everything the engine derived from one accepted frame.
#[derive(Debug, Clone, Serialize)]
pub struct PacketReport {
    pub frame: FrameSummary,
    pub classification: Option<String>,
    pub anomalies: Vec<AnomalyReport>,
}

/// Result of analyzing one buffer.
///
/// Every call produces a report; a single bad packet never aborts the
/// pipeline.
#[derive(Debug, Clone, Serialize)]
pub enum Report {
    /// The frame decoded (possibly partially) and was analyzed.
    Packet(PacketReport),
    /// The buffer was too short for the smallest recognizable frame.
    ParseError { length: usize },
}

impl Report {
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Report::ParseError { .. })
    }

    pub fn packet(&self) -> Option<&PacketReport> {
        match self {
            Report::Packet(report) => Some(report),
            Report::ParseError { .. } => None,
        }
    }
}

/// Engine-wide runtime summary.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSummary {
    /// Seconds between the first and last accepted packet timestamps.
    pub runtime_seconds: f64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub packets_per_second: f64,
    pub bytes_per_second: f64,
    /// Distinct protocol tags observed across topology nodes.
    pub protocols_detected: usize,
    pub topology: TopologySnapshot,
    pub traffic: FlowStats,
    pub metrics: EngineMetricsSnapshot,
}

/// Setup-time configuration error. The engine refuses to construct rather
/// than run with a degenerate threshold.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Flow TTL must be non-zero
    InvalidFlowTtl,
    /// Detection window must be non-zero
    InvalidDetectionWindow,
    /// Packet-rate threshold must be finite and positive
    InvalidPacketRateThreshold(f64),
    /// Byte-rate threshold must be finite and positive
    InvalidByteRateThreshold(f64),
    /// Unknown-protocol ratio must lie in (0, 1]
    InvalidUnknownRatio(f64),
    /// Rolling buffer capacity must be greater than 0
    InvalidBufferCapacity,
    /// Flow table capacity must be greater than 0
    InvalidMaxFlows,
    /// TIME-WAIT factor must be at least 1
    InvalidTimewaitFactor(u32),
    /// Sharded deployments need at least one shard
    InvalidShardCount,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidFlowTtl => {
                write!(f, "Invalid flow TTL: must be non-zero.")
            }
            ConfigError::InvalidDetectionWindow => {
                write!(f, "Invalid detection window: must be non-zero.")
            }
            ConfigError::InvalidPacketRateThreshold(value) => {
                write!(
                    f,
                    "Invalid packet rate threshold {value}: must be finite and positive."
                )
            }
            ConfigError::InvalidByteRateThreshold(value) => {
                write!(
                    f,
                    "Invalid byte rate threshold {value}: must be finite and positive."
                )
            }
            ConfigError::InvalidUnknownRatio(value) => {
                write!(
                    f,
                    "Invalid unknown-protocol ratio {value}: must lie in (0, 1]."
                )
            }
            ConfigError::InvalidBufferCapacity => {
                write!(f, "Invalid rolling buffer capacity: must be greater than 0.")
            }
            ConfigError::InvalidMaxFlows => {
                write!(f, "Invalid flow table capacity: must be greater than 0.")
            }
            ConfigError::InvalidTimewaitFactor(value) => {
                write!(f, "Invalid TIME-WAIT factor {value}: must be at least 1.")
            }
            ConfigError::InvalidShardCount => {
                write!(f, "Invalid shard count: must be at least 1.")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Tunable engine configuration. See [`EngineBuilder`] for the knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub flow_ttl: Duration,
    pub detection_window: Duration,
    pub packet_rate_threshold: f64,
    /// Accepted and stored; not yet enforced by any check.
    pub byte_rate_threshold: f64,
    pub unknown_protocol_ratio: f64,
    pub rolling_buffer_capacity: usize,
    pub tcp_timewait_factor: u32,
    pub max_flows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            flow_ttl: Duration::from_secs(300),
            detection_window: Duration::from_secs(60),
            packet_rate_threshold: 1000.0,
            byte_rate_threshold: 10_000_000.0,
            unknown_protocol_ratio: 0.10,
            rolling_buffer_capacity: 10_000,
            tcp_timewait_factor: 2,
            max_flows: 100_000,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.flow_ttl.is_zero() {
            return Err(ConfigError::InvalidFlowTtl);
        }
        if self.detection_window.is_zero() {
            return Err(ConfigError::InvalidDetectionWindow);
        }
        if !self.packet_rate_threshold.is_finite() || self.packet_rate_threshold <= 0.0 {
            return Err(ConfigError::InvalidPacketRateThreshold(
                self.packet_rate_threshold,
            ));
        }
        if !self.byte_rate_threshold.is_finite() || self.byte_rate_threshold <= 0.0 {
            return Err(ConfigError::InvalidByteRateThreshold(self.byte_rate_threshold));
        }
        if !self.unknown_protocol_ratio.is_finite()
            || self.unknown_protocol_ratio <= 0.0
            || self.unknown_protocol_ratio > 1.0
        {
            return Err(ConfigError::InvalidUnknownRatio(self.unknown_protocol_ratio));
        }
        if self.rolling_buffer_capacity == 0 {
            return Err(ConfigError::InvalidBufferCapacity);
        }
        if self.max_flows == 0 {
            return Err(ConfigError::InvalidMaxFlows);
        }
        if self.tcp_timewait_factor == 0 {
            return Err(ConfigError::InvalidTimewaitFactor(self.tcp_timewait_factor));
        }
        Ok(())
    }
}

/// Builder for configuring and constructing an [`AnalysisEngine`].
///
/// # Examples
///
/// ```rust
/// use packet_engine::AnalysisEngine;
/// use packet_engine::addr::MemoryOuiDb;
/// use std::time::Duration;
///
/// let mut oui = MemoryOuiDb::new();
/// oui.insert([0x00, 0x11, 0x22], "Cisco Systems");
///
/// let engine = AnalysisEngine::builder()
///     .with_flow_ttl(Duration::from_secs(120))
///     .with_packet_rate_threshold(5000.0)
///     .with_oui_db(oui)
///     .build()
///     .expect("Failed to build engine");
/// # let _ = engine;
/// ```
#[derive(Clone)]
pub struct EngineBuilder {
    config: EngineConfig,
    oui: Arc<dyn OuiDb + Send + Sync>,
    local_networks: Vec<Ipv4Net>,
    rules: Option<Vec<ClassificationRule>>,
    hooks: AnomalyHooks,
}

// Custom Debug implementation to avoid printing closures
impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("local_networks", &self.local_networks)
            .field("hooks", &format!("{} hooks", self.hooks.len()))
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        EngineBuilder {
            config: EngineConfig::default(),
            oui: Arc::new(MemoryOuiDb::new()),
            local_networks: Vec::new(),
            rules: None,
            hooks: AnomalyHooks::new(),
        }
    }
}

impl EngineBuilder {
    /// Sets how long an idle flow (or TCP state entry) survives between
    /// [`AnalysisEngine::tick`] calls.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_flow_ttl(mut self, ttl: Duration) -> Self {
        self.config.flow_ttl = ttl;
        self
    }

    /// Sets the rolling window over which rate and protocol-mix checks run.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_detection_window(mut self, window: Duration) -> Self {
        self.config.detection_window = window;
        self
    }

    /// Sets the packets-per-second level above which a rate anomaly fires.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_packet_rate_threshold(mut self, pps: f64) -> Self {
        self.config.packet_rate_threshold = pps;
        self
    }

    /// Sets the bytes-per-second threshold. Stored for forward
    /// compatibility; no current check consumes it.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_byte_rate_threshold(mut self, bps: f64) -> Self {
        self.config.byte_rate_threshold = bps;
        self
    }

    /// Sets the tolerated fraction of unrecognized-protocol packets in the
    /// detection window.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_unknown_protocol_ratio(mut self, ratio: f64) -> Self {
        self.config.unknown_protocol_ratio = ratio;
        self
    }

    /// Sets the rolling packet-buffer capacity.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_rolling_buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.rolling_buffer_capacity = capacity;
        self
    }

    /// Sets the TIME-WAIT grace multiplier applied on top of the flow TTL.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_tcp_timewait_factor(mut self, factor: u32) -> Self {
        self.config.tcp_timewait_factor = factor;
        self
    }

    /// Sets the flow-table capacity; the least recently used flow is
    /// evicted when it fills.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_max_flows(mut self, max_flows: usize) -> Self {
        self.config.max_flows = max_flows;
        self
    }

    /// Installs the vendor database consulted once per node creation.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_oui_db(mut self, oui: impl OuiDb + Send + Sync + 'static) -> Self {
        self.oui = Arc::new(oui);
        self
    }

    /// Declares the local networks used to infer packet direction. Without
    /// this, reports omit the direction field entirely.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_local_networks(mut self, networks: Vec<Ipv4Net>) -> Self {
        self.local_networks = networks;
        self
    }

    /// Replaces the default classification rule table.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_classification_rules(mut self, rules: Vec<ClassificationRule>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Registers a callback invoked for every emitted anomaly report.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn on_anomaly<F>(mut self, hook: F) -> Self
    where
        F: Fn(&AnomalyReport) + Send + Sync + 'static,
    {
        self.hooks.register(hook);
        self
    }

    /// Builds the engine, validating the configuration.
    pub fn build(self) -> Result<AnalysisEngine, ConfigError> {
        self.config.validate()?;

        let flow_ttl_us = self.config.flow_ttl.as_micros() as u64;
        let window_us = self.config.detection_window.as_micros() as u64;
        let max_flows =
            NonZeroUsize::new(self.config.max_flows).ok_or(ConfigError::InvalidMaxFlows)?;

        let mut classifier = FlowClassifier::new(max_flows, flow_ttl_us);
        if let Some(rules) = self.rules {
            classifier.set_rules(rules);
        }

        let detector = AnomalyDetector::new(
            self.config.rolling_buffer_capacity,
            window_us,
            self.config.packet_rate_threshold,
            self.config.unknown_protocol_ratio,
            TcpTracker::new(flow_ttl_us, self.config.tcp_timewait_factor),
            self.hooks,
        );

        Ok(AnalysisEngine {
            topology: TopologyGraph::new(self.oui),
            classifier,
            detector,
            metrics: EngineMetrics::new(),
            local_networks: self.local_networks,
            config: self.config,
            first_seen: None,
            last_seen: 0,
        })
    }
}

/// Streaming packet analysis engine.
///
/// One engine is one single-writer pipeline: feed it `(bytes, timestamp)`
/// through [`analyze`], drive maintenance through [`tick`], and read
/// topology, flow and runtime views at any point. For multi-producer
/// deployments see [`ShardedEngine`] and [`SharedEngine`].
///
/// [`analyze`]: AnalysisEngine::analyze
/// [`tick`]: AnalysisEngine::tick
///
/// # Examples
///
/// ```rust
/// use packet_engine::{AnalysisEngine, Report};
///
/// let mut engine = AnalysisEngine::builder().build().unwrap();
///
/// let frame = hex::decode(concat!(
///     "001122334455006677889900",     // Ethernet addresses
///     "0800",                         // IPv4
///     "45000028000040004006f38a",     // IPv4 header
///     "c0a80001c0a80002",             // 192.168.0.1 -> 192.168.0.2
///     "0050005000000000000000005002000000000000", // TCP SYN
/// )).unwrap();
///
/// match engine.analyze(&frame, 1_000_000) {
///     Report::Packet(report) => {
///         println!("{:?} {:?}", report.frame.protocol, report.classification);
///     }
///     Report::ParseError { length } => {
///         eprintln!("unparseable {length}-byte buffer");
///     }
/// }
/// ```
#[derive(Debug)]
pub struct AnalysisEngine {
    topology: TopologyGraph,
    classifier: FlowClassifier,
    detector: AnomalyDetector,
    metrics: EngineMetrics,
    local_networks: Vec<Ipv4Net>,
    config: EngineConfig,
    /// Timestamp of the first accepted packet.
    first_seen: Option<u64>,
    last_seen: u64,
}

impl Default for AnalysisEngine {
    fn default() -> Self {
        EngineBuilder::default()
            .build()
            .expect("default engine configuration is valid")
    }
}

impl AnalysisEngine {
    /// Creates a new builder for configuring an [`AnalysisEngine`].
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Analyzes one captured frame.
    ///
    /// Decodes the buffer, updates topology, flow and anomaly state in
    /// strict arrival order, and returns the combined per-packet report.
    /// Synchronous and infallible: undecodable buffers yield
    /// [`Report::ParseError`], never a panic or an aborted pipeline.
    pub fn analyze(&mut self, bytes: &[u8], timestamp: u64) -> Report {
        let Some(frame) = decode(bytes, timestamp) else {
            self.metrics.record_parse_error();
            trace!(length = bytes.len(), "frame below minimum decodable size");
            return Report::ParseError {
                length: bytes.len(),
            };
        };

        self.metrics.record_packet(frame.total_len);
        if frame.malformation.is_some() {
            self.metrics.record_malformed();
        }
        self.first_seen.get_or_insert(timestamp);
        self.last_seen = self.last_seen.max(timestamp);

        self.topology.observe(&frame);
        let classification = self.classifier.classify(&frame);
        let anomalies = self.detector.observe(&frame);
        self.metrics.record_anomalies(anomalies.len());

        Report::Packet(PacketReport {
            frame: self.render_frame(&frame),
            classification,
            anomalies,
        })
    }

    /// Performs periodic maintenance: reaps idle flows and evicts stale
    /// TCP state. Call at least once per flow TTL to keep memory bounded.
    pub fn tick(&mut self, now: u64) {
        let reaped = self.classifier.reap(now);
        self.metrics.record_flows_reaped(reaped);
        let evicted = self.detector.evict_tcp(now);
        self.metrics.record_tcp_evicted(evicted);
    }

    /// Drops topology nodes idle longer than `max_idle`. Opt-in retention
    /// policy; the graph is otherwise unbounded by design.
    pub fn prune_nodes(&mut self, now: u64, max_idle: Duration) -> usize {
        self.topology.prune_nodes(now, max_idle.as_micros() as u64)
    }

    /// Consistent point-in-time copy of the topology graph.
    pub fn topology_snapshot(&self) -> TopologySnapshot {
        self.topology.snapshot()
    }

    /// Aggregate flow statistics, including the classification histogram.
    pub fn flow_statistics(&self) -> FlowStats {
        self.classifier.statistics()
    }

    /// The `k` largest flows by byte count.
    pub fn top_flows(&self, k: usize) -> Vec<FlowSummary> {
        self.classifier.top_flows(k)
    }

    /// Runtime totals plus topology and flow views.
    pub fn summary(&self) -> RuntimeSummary {
        let metrics = self.metrics.snapshot();
        let runtime_us = match self.first_seen {
            Some(first) => self.last_seen.saturating_sub(first),
            None => 0,
        };
        let runtime_seconds = runtime_us as f64 / 1_000_000.0;
        let (packets_per_second, bytes_per_second) = if runtime_seconds > 0.0 {
            (
                metrics.packets as f64 / runtime_seconds,
                metrics.bytes as f64 / runtime_seconds,
            )
        } else {
            (0.0, 0.0)
        };

        RuntimeSummary {
            runtime_seconds,
            total_packets: metrics.packets,
            total_bytes: metrics.bytes,
            packets_per_second,
            bytes_per_second,
            protocols_detected: self.topology.protocols_seen().len(),
            topology: self.topology.snapshot(),
            traffic: self.classifier.statistics(),
            metrics,
        }
    }

    /// Engine counters.
    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read access to the TCP state tracker.
    pub fn tcp_tracker(&self) -> &TcpTracker {
        self.detector.tcp_tracker()
    }

    fn render_frame(&self, frame: &DecodedFrame) -> FrameSummary {
        FrameSummary {
            timestamp: frame.timestamp,
            length: frame.total_len,
            protocol: frame.protocol,
            source: frame.source.map(|addr| addr.to_string()),
            destination: frame.dest.map(|addr| addr.to_string()),
            service: frame.app_hint,
            direction: self.direction_of(frame),
        }
    }

    /// Direction relative to the configured local networks; `None` when no
    /// networks were configured.
    fn direction_of(&self, frame: &DecodedFrame) -> Option<Direction> {
        if self.local_networks.is_empty() {
            return None;
        }
        let is_local = |addr: Option<EndpointAddr>| {
            addr.and_then(|a| a.ipv4())
                .map(|ip| self.local_networks.iter().any(|net| net.contains(&ip)))
        };
        Some(match (is_local(frame.source), is_local(frame.dest)) {
            (Some(true), Some(true)) => Direction::Lateral,
            (Some(true), Some(false)) => Direction::Outbound,
            (Some(false), Some(true)) => Direction::Inbound,
            _ => Direction::Unknown,
        })
    }
}
