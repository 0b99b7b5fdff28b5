//! Network topology: endpoint nodes and the directed connections between
//! them.
//!
//! Records live in dense arenas addressed by 32-bit handles; the address
//! and connection-key maps hold handles, not records. That keeps neighbor
//! sets free of pointer cycles and makes a snapshot a bounded structural
//! copy of compact records.

use crate::addr::{EndpointAddr, OuiDb};
use crate::decode::{DecodedFrame, TransportLayer};
use crate::protocol::{ProtocolSet, ProtocolType};

use serde::Serialize;
use tracing::debug;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Coarse device category derived from the vendor string at node creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceClass {
    Router,
    Mobile,
    Computer,
    Unknown,
}

impl DeviceClass {
    pub const fn name(self) -> &'static str {
        match self {
            DeviceClass::Router => "router",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Computer => "computer",
            DeviceClass::Unknown => "unknown",
        }
    }

    fn from_vendor(vendor: Option<&str>) -> DeviceClass {
        let Some(vendor) = vendor else {
            return DeviceClass::Unknown;
        };
        let vendor = vendor.to_ascii_lowercase();
        if vendor.contains("router") || vendor.contains("gateway") {
            DeviceClass::Router
        } else if vendor.contains("phone") || vendor.contains("mobile") {
            DeviceClass::Mobile
        } else if vendor.contains("laptop") || vendor.contains("computer") {
            DeviceClass::Computer
        } else {
            DeviceClass::Unknown
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

type NodeHandle = u32;

#[derive(Debug, Clone)]
struct NodeRecord {
    addr: EndpointAddr,
    first_seen: u64,
    last_seen: u64,
    packet_count: u64,
    byte_count: u64,
    protocols: ProtocolSet,
    neighbors: BTreeSet<NodeHandle>,
    /// Resolved once at creation, never re-queried.
    vendor: Option<String>,
    device_class: DeviceClass,
}

#[derive(Debug, Clone)]
struct ConnectionRecord {
    source: NodeHandle,
    dest: NodeHandle,
    protocol: ProtocolType,
    first_seen: u64,
    last_seen: u64,
    packet_count: u64,
    byte_count: u64,
    /// TCP control flags observed on this connection.
    flags: BTreeSet<String>,
}

/// One node of a topology snapshot, rendered for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: String,
    pub vendor: Option<String>,
    pub device_class: DeviceClass,
    pub first_seen: u64,
    pub last_seen: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub protocols: ProtocolSet,
    pub neighbor_count: usize,
}

/// One directed edge of a topology snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub source: String,
    pub destination: String,
    pub protocol: ProtocolType,
    pub first_seen: u64,
    pub last_seen: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub flags: Vec<String>,
}

/// Derived statistics of a topology snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyStats {
    pub total_nodes: usize,
    pub total_connections: usize,
    pub device_class_distribution: BTreeMap<String, u64>,
    pub protocol_distribution: BTreeMap<String, u64>,
}

/// Consistent point-in-time copy of the graph.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub nodes: Vec<NodeSummary>,
    pub connections: Vec<ConnectionSummary>,
    pub stats: TopologyStats,
}

/// Mutable topology graph. Single writer; reads go through [`snapshot`].
///
/// [`snapshot`]: TopologyGraph::snapshot
pub struct TopologyGraph {
    nodes: Vec<NodeRecord>,
    node_index: HashMap<EndpointAddr, NodeHandle>,
    connections: Vec<ConnectionRecord>,
    connection_index: HashMap<(NodeHandle, NodeHandle, ProtocolType), u32>,
    oui: Arc<dyn OuiDb + Send + Sync>,
}

impl std::fmt::Debug for TopologyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyGraph")
            .field("nodes", &self.nodes.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl TopologyGraph {
    pub(crate) fn new(oui: Arc<dyn OuiDb + Send + Sync>) -> Self {
        TopologyGraph {
            nodes: Vec::new(),
            node_index: HashMap::new(),
            connections: Vec::new(),
            connection_index: HashMap::new(),
            oui,
        }
    }

    /// Folds one decoded frame into the graph. Infallible: frames without
    /// installable endpoints simply leave the graph untouched.
    pub fn observe(&mut self, frame: &DecodedFrame) {
        let source = frame.source.and_then(|addr| self.upsert_node(addr, frame));
        let dest = frame.dest.and_then(|addr| self.upsert_node(addr, frame));

        let (Some(source), Some(dest)) = (source, dest) else {
            return;
        };
        if source != dest {
            self.nodes[source as usize].neighbors.insert(dest);
            self.nodes[dest as usize].neighbors.insert(source);
        }
        self.upsert_connection(source, dest, frame);
    }

    fn upsert_node(&mut self, addr: EndpointAddr, frame: &DecodedFrame) -> Option<NodeHandle> {
        if !addr.is_installable() {
            return None;
        }

        let handle = match self.node_index.get(&addr) {
            Some(handle) => *handle,
            None => {
                let vendor = addr
                    .mac()
                    .and_then(|mac| self.oui.vendor(mac.oui()))
                    .map(str::to_string);
                let device_class = DeviceClass::from_vendor(vendor.as_deref());
                let handle = self.nodes.len() as NodeHandle;
                self.nodes.push(NodeRecord {
                    addr,
                    first_seen: frame.timestamp,
                    last_seen: frame.timestamp,
                    packet_count: 0,
                    byte_count: 0,
                    protocols: ProtocolSet::new(),
                    neighbors: BTreeSet::new(),
                    vendor,
                    device_class,
                });
                self.node_index.insert(addr, handle);
                handle
            }
        };

        let node = &mut self.nodes[handle as usize];
        node.last_seen = node.last_seen.max(frame.timestamp);
        node.packet_count += 1;
        node.byte_count += frame.total_len as u64;
        node.protocols.insert(frame.protocol);
        Some(handle)
    }

    fn upsert_connection(&mut self, source: NodeHandle, dest: NodeHandle, frame: &DecodedFrame) {
        let key = (source, dest, frame.protocol);
        let index = match self.connection_index.get(&key) {
            Some(index) => *index,
            None => {
                let index = self.connections.len() as u32;
                self.connections.push(ConnectionRecord {
                    source,
                    dest,
                    protocol: frame.protocol,
                    first_seen: frame.timestamp,
                    last_seen: frame.timestamp,
                    packet_count: 0,
                    byte_count: 0,
                    flags: BTreeSet::new(),
                });
                self.connection_index.insert(key, index);
                index
            }
        };

        let connection = &mut self.connections[index as usize];
        connection.last_seen = connection.last_seen.max(frame.timestamp);
        connection.packet_count += 1;
        connection.byte_count += frame.total_len as u64;

        if let Some(TransportLayer::Tcp { flags, .. }) = frame.transport {
            for name in [
                (flags.syn(), "SYN"),
                (flags.ack(), "ACK"),
                (flags.fin(), "FIN"),
                (flags.rst(), "RST"),
                (flags.psh(), "PSH"),
                (flags.urg(), "URG"),
            ]
            .into_iter()
            .filter_map(|(set, name)| set.then_some(name))
            {
                if !connection.flags.contains(name) {
                    connection.flags.insert(name.to_string());
                }
            }
        }
    }

    /// Builds a consistent read-only copy of the graph.
    pub fn snapshot(&self) -> TopologySnapshot {
        let nodes: Vec<NodeSummary> = self
            .nodes
            .iter()
            .map(|node| NodeSummary {
                id: node.addr.to_string(),
                vendor: node.vendor.clone(),
                device_class: node.device_class,
                first_seen: node.first_seen,
                last_seen: node.last_seen,
                packet_count: node.packet_count,
                byte_count: node.byte_count,
                protocols: node.protocols,
                neighbor_count: node.neighbors.len(),
            })
            .collect();

        let connections: Vec<ConnectionSummary> = self
            .connections
            .iter()
            .map(|connection| ConnectionSummary {
                source: self.nodes[connection.source as usize].addr.to_string(),
                destination: self.nodes[connection.dest as usize].addr.to_string(),
                protocol: connection.protocol,
                first_seen: connection.first_seen,
                last_seen: connection.last_seen,
                packet_count: connection.packet_count,
                byte_count: connection.byte_count,
                flags: connection.flags.iter().cloned().collect(),
            })
            .collect();

        let mut device_class_distribution: BTreeMap<String, u64> = BTreeMap::new();
        for node in &self.nodes {
            *device_class_distribution
                .entry(node.device_class.name().to_string())
                .or_insert(0) += 1;
        }
        let mut protocol_distribution: BTreeMap<String, u64> = BTreeMap::new();
        for connection in &self.connections {
            *protocol_distribution
                .entry(connection.protocol.name().to_string())
                .or_insert(0) += 1;
        }

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

    /// Drops nodes idle longer than `max_idle` microseconds, along with
    /// their connections, and compacts the arenas. Opt-in: the graph is
    /// otherwise unbounded by design.
    pub fn prune_nodes(&mut self, now: u64, max_idle_us: u64) -> usize {
        let retain: Vec<bool> = self
            .nodes
            .iter()
            .map(|node| now.saturating_sub(node.last_seen) <= max_idle_us)
            .collect();
        let dropped = retain.iter().filter(|keep| !**keep).count();
        if dropped == 0 {
            return 0;
        }

        let mut remap: Vec<Option<NodeHandle>> = vec![None; self.nodes.len()];
        let mut next = 0u32;
        for (old, keep) in retain.iter().enumerate() {
            if *keep {
                remap[old] = Some(next);
                next += 1;
            }
        }

        let old_nodes = std::mem::take(&mut self.nodes);
        self.node_index.clear();
        for (old, mut node) in old_nodes.into_iter().enumerate() {
            let Some(new_handle) = remap[old] else {
                continue;
            };
            node.neighbors = node
                .neighbors
                .iter()
                .filter_map(|n| remap[*n as usize])
                .collect();
            self.node_index.insert(node.addr, new_handle);
            self.nodes.push(node);
        }

        let old_connections = std::mem::take(&mut self.connections);
        self.connection_index.clear();
        for mut connection in old_connections {
            let (Some(source), Some(dest)) = (
                remap[connection.source as usize],
                remap[connection.dest as usize],
            ) else {
                continue;
            };
            connection.source = source;
            connection.dest = dest;
            let index = self.connections.len() as u32;
            self.connection_index
                .insert((source, dest, connection.protocol), index);
            self.connections.push(connection);
        }

        debug!(dropped, remaining = self.nodes.len(), "pruned idle topology nodes");
        dropped
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Union of protocol tags across all nodes.
    pub fn protocols_seen(&self) -> ProtocolSet {
        let mut set = ProtocolSet::new();
        for node in &self.nodes {
            set.merge(node.protocols);
        }
        set
    }

    #[cfg(test)]
    fn node(&self, addr: &EndpointAddr) -> Option<&NodeRecord> {
        self.node_index
            .get(addr)
            .map(|handle| &self.nodes[*handle as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{MacAddr, MemoryOuiDb};
    use crate::decode::LinkLayer;

    fn mac_frame(src: [u8; 6], dst: [u8; 6], len: u32, ts: u64) -> DecodedFrame {
        DecodedFrame {
            timestamp: ts,
            total_len: len,
            link: LinkLayer::Ethernet {
                src: MacAddr(src),
                dst: MacAddr(dst),
                ethertype: 0x88cc,
            },
            network: None,
            transport: None,
            app: None,
            app_hint: None,
            protocol: ProtocolType::Ethernet,
            source: Some(EndpointAddr::Mac(MacAddr(src))),
            dest: Some(EndpointAddr::Mac(MacAddr(dst))),
            malformation: None,
        }
    }

    fn graph() -> TopologyGraph {
        let mut oui = MemoryOuiDb::new();
        oui.insert([0x00, 0x11, 0x22], "Acme Gateway Systems");
        oui.insert([0x00, 0x23, 0x45], "PhoneCorp Mobile");
        TopologyGraph::new(Arc::new(oui))
    }

    const A: [u8; 6] = [0x00, 0x11, 0x22, 0x00, 0x00, 0x01];
    const B: [u8; 6] = [0x00, 0x23, 0x45, 0x00, 0x00, 0x02];
    const C: [u8; 6] = [0x0a, 0x0b, 0x0c, 0x00, 0x00, 0x03];

    #[test]
    fn test_nodes_connections_and_neighbors() {
        let mut graph = graph();
        graph.observe(&mac_frame(A, B, 100, 1));
        graph.observe(&mac_frame(A, B, 50, 2));
        graph.observe(&mac_frame(B, A, 25, 3));

        assert_eq!(graph.node_count(), 2);
        // Two directed edges for the two directions.
        assert_eq!(graph.connection_count(), 2);

        let a = graph.node(&EndpointAddr::Mac(MacAddr(A))).unwrap();
        assert_eq!(a.packet_count, 3);
        assert_eq!(a.byte_count, 175);
        assert_eq!(a.first_seen, 1);
        assert_eq!(a.last_seen, 3);
        assert_eq!(a.neighbors.len(), 1);
        assert!(a.protocols.contains(ProtocolType::Ethernet));
    }

    #[test]
    fn test_vendor_and_device_class_resolved_once() {
        let mut graph = graph();
        graph.observe(&mac_frame(A, B, 100, 1));

        let a = graph.node(&EndpointAddr::Mac(MacAddr(A))).unwrap();
        assert_eq!(a.vendor.as_deref(), Some("Acme Gateway Systems"));
        assert_eq!(a.device_class, DeviceClass::Router);

        let b = graph.node(&EndpointAddr::Mac(MacAddr(B))).unwrap();
        assert_eq!(b.device_class, DeviceClass::Mobile);
    }

    #[test]
    fn test_broadcast_and_zero_never_become_nodes() {
        let mut graph = graph();
        graph.observe(&mac_frame(A, [0xff; 6], 60, 1));
        graph.observe(&mac_frame([0x00; 6], A, 60, 2));

        assert_eq!(graph.node_count(), 1);
        assert!(graph.node(&EndpointAddr::Mac(MacAddr::BROADCAST)).is_none());
        assert!(graph.node(&EndpointAddr::Mac(MacAddr::ZERO)).is_none());
        // No edge either: one endpoint was missing each time.
        assert_eq!(graph.connection_count(), 0);
    }

    #[test]
    fn test_counters_are_monotone_with_out_of_order_timestamps() {
        let mut graph = graph();
        graph.observe(&mac_frame(A, B, 10, 100));
        graph.observe(&mac_frame(A, B, 10, 40)); // late arrival

        let a = graph.node(&EndpointAddr::Mac(MacAddr(A))).unwrap();
        assert_eq!(a.first_seen, 100);
        assert_eq!(a.last_seen, 100); // never decreases
        assert_eq!(a.packet_count, 2);
    }

    #[test]
    fn test_snapshot_distributions() {
        let mut graph = graph();
        graph.observe(&mac_frame(A, B, 100, 1));
        graph.observe(&mac_frame(A, C, 100, 2));

        let snapshot = graph.snapshot();
        assert_eq!(snapshot.stats.total_nodes, 3);
        assert_eq!(snapshot.stats.total_connections, 2);
        assert_eq!(snapshot.stats.device_class_distribution["router"], 1);
        assert_eq!(snapshot.stats.device_class_distribution["mobile"], 1);
        assert_eq!(snapshot.stats.device_class_distribution["unknown"], 1);
        assert_eq!(snapshot.stats.protocol_distribution["ethernet"], 2);

        let a = snapshot
            .nodes
            .iter()
            .find(|n| n.id == "00:11:22:00:00:01")
            .unwrap();
        assert_eq!(a.neighbor_count, 2);
    }

    #[test]
    fn test_prune_compacts_and_keeps_survivors_consistent() {
        let mut graph = graph();
        graph.observe(&mac_frame(A, B, 100, 1_000_000));
        graph.observe(&mac_frame(B, C, 100, 60_000_000));
        graph.observe(&mac_frame(C, B, 100, 61_000_000));

        // A idle for ~60s, B and C fresh.
        let dropped = graph.prune_nodes(61_000_000, 30_000_000);
        assert_eq!(dropped, 1);
        assert_eq!(graph.node_count(), 2);
        assert!(graph.node(&EndpointAddr::Mac(MacAddr(A))).is_none());

        // Connections touching A are gone, B<->C survives both ways.
        assert_eq!(graph.connection_count(), 2);
        let b = graph.node(&EndpointAddr::Mac(MacAddr(B))).unwrap();
        assert_eq!(b.neighbors.len(), 1);

        // The graph keeps working after compaction.
        graph.observe(&mac_frame(B, C, 100, 62_000_000));
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.connection_count(), 2);
    }

    #[test]
    fn test_protocols_seen_union() {
        let mut graph = graph();
        let mut frame = mac_frame(A, B, 100, 1);
        frame.protocol = ProtocolType::Arp;
        graph.observe(&frame);
        graph.observe(&mac_frame(A, C, 100, 2));

        let seen = graph.protocols_seen();
        assert!(seen.contains(ProtocolType::Arp));
        assert!(seen.contains(ProtocolType::Ethernet));
        assert_eq!(seen.len(), 2);
    }
}
