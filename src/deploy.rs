//! Multi-producer deployment wrappers.
//!
//! The engine itself is single-writer. Two supported patterns scale it out:
//!
//! - [`ShardedEngine`]: shared-nothing. N independent engines, frames
//!   routed by the unordered link-address pair, snapshots merged off-line.
//!   Recommended above ~100k packets per second.
//! - [`SharedEngine`]: one engine behind a writer lock with many readers
//!   observing consistent point-in-time copies. Fine up to ~50k packets
//!   per second; shard beyond that.

use crate::addr::MacAddr;
use crate::decode::peek_link_pair;
use crate::flow::{FlowStats, FlowSummary};
use crate::metrics::EngineMetricsSnapshot;
use crate::topology::{NodeSummary, TopologySnapshot, TopologyStats};
use crate::{AnalysisEngine, ConfigError, EngineBuilder, Report, RuntimeSummary};

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

const TOP_FLOW_PREVIEW: usize = 5;

/// Shared-nothing set of engine shards.
///
/// Frames are routed by hashing the lesser link-layer address of the pair,
/// so both directions of a conversation always land on the same shard and
/// its flow/TCP state stays coherent. Frames without a readable link pair
/// go to shard 0.
///
/// # Examples
///
/// ```rust
/// use packet_engine::ShardedEngine;
///
/// let mut sharded = ShardedEngine::new(4).unwrap();
/// let frame = [0u8; 60];
/// let _report = sharded.analyze(&frame, 1);
/// let stats = sharded.merged_flow_statistics();
/// # let _ = stats;
/// ```
#[derive(Debug)]
pub struct ShardedEngine {
    shards: Vec<AnalysisEngine>,
}

impl ShardedEngine {
    /// Creates `shards` engines with default configuration.
    pub fn new(shards: usize) -> Result<Self, ConfigError> {
        Self::with_builder(shards, EngineBuilder::default())
    }

    /// Creates `shards` engines from one builder configuration.
    pub fn with_builder(shards: usize, builder: EngineBuilder) -> Result<Self, ConfigError> {
        if shards == 0 {
            return Err(ConfigError::InvalidShardCount);
        }
        let mut engines = Vec::with_capacity(shards);
        for _ in 0..shards {
            engines.push(builder.clone().build()?);
        }
        Ok(ShardedEngine { shards: engines })
    }

    /// Routes one frame to its shard and analyzes it there.
    pub fn analyze(&mut self, bytes: &[u8], timestamp: u64) -> Report {
        let shard = self.shard_for(bytes);
        self.shards[shard].analyze(bytes, timestamp)
    }

    /// The shard index a frame would be routed to.
    pub fn shard_for(&self, bytes: &[u8]) -> usize {
        match peek_link_pair(bytes) {
            Some((a, b)) => {
                let lesser = if a.0 <= b.0 { a } else { b };
                (hash_mac(lesser) % self.shards.len() as u64) as usize
            }
            None => 0,
        }
    }

    /// Runs periodic maintenance on every shard.
    pub fn tick(&mut self, now: u64) {
        for shard in &mut self.shards {
            shard.tick(now);
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shards(&self) -> &[AnalysisEngine] {
        &self.shards
    }

    /// Flow statistics merged across all shards.
    pub fn merged_flow_statistics(&self) -> FlowStats {
        merge_flow_stats(self.shards.iter().map(|shard| shard.flow_statistics()))
    }

    /// Topology snapshots merged across all shards. Nodes appearing in
    /// several shards are combined by address; their neighbor counts are a
    /// lower bound since handles do not cross shards.
    pub fn merged_topology_snapshot(&self) -> TopologySnapshot {
        merge_topology(self.shards.iter().map(|shard| shard.topology_snapshot()))
    }

    /// Engine counters summed across shards.
    pub fn merged_metrics(&self) -> EngineMetricsSnapshot {
        let mut total = EngineMetricsSnapshot {
            packets: 0,
            bytes: 0,
            parse_errors: 0,
            malformed_frames: 0,
            anomalies: 0,
            flows_reaped: 0,
            tcp_states_evicted: 0,
        };
        for shard in &self.shards {
            let m = shard.metrics();
            total.packets += m.packets;
            total.bytes += m.bytes;
            total.parse_errors += m.parse_errors;
            total.malformed_frames += m.malformed_frames;
            total.anomalies += m.anomalies;
            total.flows_reaped += m.flows_reaped;
            total.tcp_states_evicted += m.tcp_states_evicted;
        }
        total
    }
}

fn hash_mac(mac: MacAddr) -> u64 {
    let mut hasher = DefaultHasher::new();
    mac.0.hash(&mut hasher);
    hasher.finish()
}

/// Merges flow statistics from several engines into one view.
pub fn merge_flow_stats(stats: impl IntoIterator<Item = FlowStats>) -> FlowStats {
    let mut total_flows = 0;
    let mut total_packets = 0;
    let mut total_bytes = 0;
    let mut distribution: BTreeMap<String, u64> = BTreeMap::new();
    let mut top: Vec<FlowSummary> = Vec::new();

    for shard_stats in stats {
        total_flows += shard_stats.total_flows;
        total_packets += shard_stats.total_packets;
        total_bytes += shard_stats.total_bytes;
        for (classification, count) in shard_stats.classification_distribution {
            *distribution.entry(classification).or_insert(0) += count;
        }
        top.extend(shard_stats.top_flows);
    }
    top.sort_unstable_by(|a, b| b.byte_count.cmp(&a.byte_count));
    top.truncate(TOP_FLOW_PREVIEW);

    FlowStats {
        total_flows,
        total_packets,
        total_bytes,
        classification_distribution: distribution,
        top_flows: top,
    }
}

/// Merges topology snapshots from several engines into one view.
pub fn merge_topology(snapshots: impl IntoIterator<Item = TopologySnapshot>) -> TopologySnapshot {
    let mut nodes: BTreeMap<String, NodeSummary> = BTreeMap::new();
    let mut connections = Vec::new();

    for snapshot in snapshots {
        for node in snapshot.nodes {
            match nodes.get_mut(&node.id) {
                Some(merged) => {
                    merged.first_seen = merged.first_seen.min(node.first_seen);
                    merged.last_seen = merged.last_seen.max(node.last_seen);
                    merged.packet_count += node.packet_count;
                    merged.byte_count += node.byte_count;
                    merged.protocols.merge(node.protocols);
                    merged.neighbor_count = merged.neighbor_count.max(node.neighbor_count);
                    if merged.vendor.is_none() {
                        merged.vendor = node.vendor;
                        merged.device_class = node.device_class;
                    }
                }
                None => {
                    nodes.insert(node.id.clone(), node);
                }
            }
        }
        connections.extend(snapshot.connections);
    }

    let mut device_class_distribution: BTreeMap<String, u64> = BTreeMap::new();
    for node in nodes.values() {
        *device_class_distribution
            .entry(node.device_class.name().to_string())
            .or_insert(0) += 1;
    }
    let mut protocol_distribution: BTreeMap<String, u64> = BTreeMap::new();
    for connection in &connections {
        *protocol_distribution
            .entry(connection.protocol.name().to_string())
            .or_insert(0) += 1;
    }

    let nodes: Vec<NodeSummary> = nodes.into_values().collect();
    TopologySnapshot {
        stats: TopologyStats {
            total_nodes: nodes.len(),
            total_connections: connections.len(),
            device_class_distribution,
            protocol_distribution,
        },
        nodes,
        connections,
    }
}

/// Single-writer, many-readers handle around one engine.
///
/// Clones share the engine. `analyze` and `tick` take the writer lock;
/// read operations take a read lock and return owned copies, so no lock is
/// held after a method returns. A panicking writer does not wedge the
/// engine: the lock's poison is cleared on the next access.
///
/// # Examples
///
/// ```rust
/// use packet_engine::{AnalysisEngine, SharedEngine};
///
/// let shared = SharedEngine::new(AnalysisEngine::default());
/// let reader = shared.clone();
///
/// shared.analyze(&[0u8; 60], 1);
/// let snapshot = reader.topology_snapshot();
/// # let _ = snapshot;
/// ```
#[derive(Debug, Clone)]
pub struct SharedEngine {
    inner: Arc<RwLock<AnalysisEngine>>,
}

impl SharedEngine {
    pub fn new(engine: AnalysisEngine) -> Self {
        SharedEngine {
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    pub fn analyze(&self, bytes: &[u8], timestamp: u64) -> Report {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .analyze(bytes, timestamp)
    }

    pub fn tick(&self, now: u64) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .tick(now);
    }

    pub fn topology_snapshot(&self) -> TopologySnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .topology_snapshot()
    }

    pub fn flow_statistics(&self) -> FlowStats {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .flow_statistics()
    }

    pub fn top_flows(&self, k: usize) -> Vec<FlowSummary> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .top_flows(k)
    }

    pub fn summary(&self) -> RuntimeSummary {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .summary()
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics()
    }
}
