//! Bidirectional flow identity, per-flow aggregates and classification.
//!
//! A flow is the unordered pair of endpoints plus the protocol tag. Both
//! directions collapse onto one record via a content-addressed fingerprint;
//! the table is LRU-bounded and additionally reaped by idle time from
//! [`crate::AnalysisEngine::tick`].

use crate::addr::{CANONICAL_MAX, EndpointAddr};
use crate::decode::DecodedFrame;
use crate::protocol::{ProtocolType, ServiceHint};

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

/// Classification given to a flow nothing has matched yet.
pub const UNCLASSIFIED: &str = "unknown";

/// 128-bit content-addressed flow fingerprint.
///
/// SHA-256 over `lo ‖ hi ‖ protocol` truncated to 16 bytes, where `(lo,
/// hi)` are the endpoints' canonical bytes in ascending order. Collision
/// resistance is all that matters here, not secrecy. Comparison is plain
/// integer comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub u128);

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for FlowId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Computes the direction-independent fingerprint of an endpoint pair.
///
/// # Examples
///
/// ```rust
/// use packet_engine::addr::{EndpointAddr, MacAddr};
/// use packet_engine::flow::flow_id;
/// use packet_engine::protocol::ProtocolType;
///
/// let a = EndpointAddr::Mac(MacAddr([1, 2, 3, 4, 5, 6]));
/// let b = EndpointAddr::Mac(MacAddr([6, 5, 4, 3, 2, 1]));
/// assert_eq!(
///     flow_id(&a, &b, ProtocolType::Tcp),
///     flow_id(&b, &a, ProtocolType::Tcp),
/// );
/// ```
pub fn flow_id(a: &EndpointAddr, b: &EndpointAddr, protocol: ProtocolType) -> FlowId {
    let mut buf_a = [0u8; CANONICAL_MAX];
    let mut buf_b = [0u8; CANONICAL_MAX];
    let len_a = a.canonical_bytes(&mut buf_a);
    let len_b = b.canonical_bytes(&mut buf_b);

    let (lo, hi) = if buf_a[..len_a] <= buf_b[..len_b] {
        (&buf_a[..len_a], &buf_b[..len_b])
    } else {
        (&buf_b[..len_b], &buf_a[..len_a])
    };

    let mut hasher = Sha256::new();
    hasher.update(lo);
    hasher.update(hi);
    hasher.update([protocol.tag_byte()]);
    let digest = hasher.finalize();

    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&digest[..16]);
    FlowId(u128::from_be_bytes(truncated))
}

/// One bidirectional flow record.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: FlowId,
    /// Endpoints in canonical (ascending) order.
    pub endpoints: (EndpointAddr, EndpointAddr),
    pub protocol: ProtocolType,
    pub packet_count: u64,
    pub byte_count: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    pub classification: String,
    pub confidence: f32,
}

impl Flow {
    fn new(
        id: FlowId,
        a: EndpointAddr,
        b: EndpointAddr,
        protocol: ProtocolType,
        timestamp: u64,
    ) -> Self {
        let endpoints = if a <= b { (a, b) } else { (b, a) };
        Flow {
            id,
            endpoints,
            protocol,
            packet_count: 0,
            byte_count: 0,
            first_seen: timestamp,
            last_seen: timestamp,
            classification: UNCLASSIFIED.to_string(),
            confidence: 0.0,
        }
    }

    fn mean_packet_size(&self) -> f64 {
        if self.packet_count == 0 {
            0.0
        } else {
            self.byte_count as f64 / self.packet_count as f64
        }
    }
}

/// One entry of the tunable classification rule table.
///
/// All present conditions must hold for the rule to match.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub name: &'static str,
    pub protocol: Option<ProtocolType>,
    /// Inclusive on-wire frame size range.
    pub packet_size_range: Option<(u32, u32)>,
    /// Minimum packets accumulated by the flow.
    pub min_packets: Option<u64>,
    pub classification: &'static str,
    pub confidence: f32,
}

impl ClassificationRule {
    fn matches(&self, flow: &Flow, frame: &DecodedFrame) -> bool {
        if let Some(protocol) = self.protocol
            && frame.protocol != protocol
        {
            return false;
        }
        if let Some((min, max)) = self.packet_size_range
            && !(min..=max).contains(&frame.total_len)
        {
            return false;
        }
        if let Some(min_packets) = self.min_packets
            && flow.packet_count < min_packets
        {
            return false;
        }
        true
    }
}

fn default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule {
            name: "dns-traffic",
            protocol: Some(ProtocolType::Udp),
            packet_size_range: Some((50, 512)),
            min_packets: None,
            classification: "DNS",
            confidence: 0.9,
        },
        ClassificationRule {
            name: "dhcp-traffic",
            protocol: Some(ProtocolType::Udp),
            packet_size_range: Some((300, 600)),
            min_packets: None,
            classification: "DHCP",
            confidence: 0.8,
        },
        ClassificationRule {
            name: "streaming-media",
            protocol: Some(ProtocolType::Udp),
            packet_size_range: None,
            min_packets: Some(100),
            classification: "Media Streaming",
            confidence: 0.7,
        },
        ClassificationRule {
            name: "arp",
            protocol: Some(ProtocolType::Arp),
            packet_size_range: None,
            min_packets: None,
            classification: "ARP",
            confidence: 0.95,
        },
    ]
}

/// Summary of one flow, rendered for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub flow_id: FlowId,
    pub source: String,
    pub destination: String,
    pub protocol: ProtocolType,
    pub classification: String,
    pub confidence: f32,
    pub packet_count: u64,
    pub byte_count: u64,
}

impl From<&Flow> for FlowSummary {
    fn from(flow: &Flow) -> Self {
        FlowSummary {
            flow_id: flow.id,
            source: flow.endpoints.0.to_string(),
            destination: flow.endpoints.1.to_string(),
            protocol: flow.protocol,
            classification: flow.classification.clone(),
            confidence: flow.confidence,
            packet_count: flow.packet_count,
            byte_count: flow.byte_count,
        }
    }
}

/// Aggregate classifier statistics.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStats {
    pub total_flows: usize,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub classification_distribution: BTreeMap<String, u64>,
    pub top_flows: Vec<FlowSummary>,
}

const TOP_FLOW_PREVIEW: usize = 5;

/// Collapses packets into bidirectional flows and classifies them.
pub struct FlowClassifier {
    flows: LruCache<FlowId, Flow>,
    rules: Vec<ClassificationRule>,
    flow_ttl_us: u64,
    capacity_evictions: u64,
}

impl std::fmt::Debug for FlowClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowClassifier")
            .field("flows", &self.flows.len())
            .field("rules", &self.rules.len())
            .field("flow_ttl_us", &self.flow_ttl_us)
            .finish()
    }
}

impl FlowClassifier {
    pub(crate) fn new(max_flows: NonZeroUsize, flow_ttl_us: u64) -> Self {
        FlowClassifier {
            flows: LruCache::new(max_flows),
            rules: default_rules(),
            flow_ttl_us,
            capacity_evictions: 0,
        }
    }

    /// Replaces the rule table. Rules are evaluated in order; the first
    /// match wins over port and pattern candidates.
    pub fn set_rules(&mut self, rules: Vec<ClassificationRule>) {
        self.rules = rules;
    }

    /// Folds one decoded frame into its flow and returns the flow's current
    /// classification. Frames without an endpoint pair produce no flow.
    pub fn classify(&mut self, frame: &DecodedFrame) -> Option<String> {
        let (source, dest) = match (frame.source, frame.dest) {
            (Some(source), Some(dest)) => (source, dest),
            _ => return None,
        };

        let id = flow_id(&source, &dest, frame.protocol);
        if !self.flows.contains(&id) {
            if self.flows.len() == self.flows.cap().get() {
                self.capacity_evictions += 1;
            }
            self.flows
                .put(id, Flow::new(id, source, dest, frame.protocol, frame.timestamp));
        }
        let flow = self.flows.get_mut(&id)?;

        flow.packet_count += 1;
        flow.byte_count += frame.total_len as u64;
        flow.last_seen = flow.last_seen.max(frame.timestamp);

        let candidate = Self::rule_candidate(&self.rules, flow, frame)
            .or_else(|| Self::port_candidate(frame))
            .or_else(|| Self::pattern_candidate(flow));
        if let Some((label, confidence)) = candidate
            && confidence > flow.confidence
        {
            flow.classification = label.to_string();
            flow.confidence = confidence;
        }

        Some(flow.classification.clone())
    }

    fn rule_candidate(
        rules: &[ClassificationRule],
        flow: &Flow,
        frame: &DecodedFrame,
    ) -> Option<(&'static str, f32)> {
        rules
            .iter()
            .find(|rule| rule.matches(flow, frame))
            .map(|rule| (rule.classification, rule.confidence))
    }

    fn port_candidate(frame: &DecodedFrame) -> Option<(&'static str, f32)> {
        frame
            .app_hint
            .map(|hint: ServiceHint| (hint.label(), hint.confidence()))
    }

    fn pattern_candidate(flow: &Flow) -> Option<(&'static str, f32)> {
        if flow.byte_count > 1_000_000
            && flow.packet_count > 100
            && flow.mean_packet_size() > 1000.0
        {
            Some(("Video Streaming", 0.7))
        } else if flow.byte_count > 10_000_000 {
            Some(("File Transfer", 0.6))
        } else if flow.packet_count > 20 && flow.byte_count < 1_000_000 {
            Some(("Web Browsing", 0.5))
        } else {
            None
        }
    }

    /// Drops flows idle longer than the flow TTL. Returns how many went.
    pub fn reap(&mut self, now: u64) -> usize {
        let expired: Vec<FlowId> = self
            .flows
            .iter()
            .filter(|(_, flow)| now.saturating_sub(flow.last_seen) > self.flow_ttl_us)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.flows.pop(id);
        }
        if !expired.is_empty() {
            debug!(reaped = expired.len(), "reaped idle flows");
        }
        expired.len()
    }

    /// Flows ordered by byte count, largest first.
    pub fn top_flows(&self, k: usize) -> Vec<FlowSummary> {
        let mut flows: Vec<&Flow> = self.flows.iter().map(|(_, flow)| flow).collect();
        flows.sort_unstable_by(|a, b| b.byte_count.cmp(&a.byte_count));
        flows.into_iter().take(k).map(FlowSummary::from).collect()
    }

    pub fn statistics(&self) -> FlowStats {
        let mut distribution: BTreeMap<String, u64> = BTreeMap::new();
        let mut total_packets = 0;
        let mut total_bytes = 0;
        for (_, flow) in self.flows.iter() {
            *distribution.entry(flow.classification.clone()).or_insert(0) += 1;
            total_packets += flow.packet_count;
            total_bytes += flow.byte_count;
        }

        FlowStats {
            total_flows: self.flows.len(),
            total_packets,
            total_bytes,
            classification_distribution: distribution,
            top_flows: self.top_flows(TOP_FLOW_PREVIEW),
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Flows dropped by the LRU capacity bound (not TTL reaping).
    pub fn capacity_evictions(&self) -> u64 {
        self.capacity_evictions
    }

    #[cfg(test)]
    pub(crate) fn get(&mut self, id: &FlowId) -> Option<&Flow> {
        self.flows.get(id).map(|flow| &*flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::MacAddr;
    use crate::decode::decode;

    use proptest::prelude::*;

    fn classifier() -> FlowClassifier {
        FlowClassifier::new(NonZeroUsize::new(1024).unwrap(), 300 * 1_000_000)
    }

    fn udp_frame(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        total_len: usize,
        ts: u64,
    ) -> DecodedFrame {
        let mut bytes = Vec::with_capacity(total_len);
        bytes.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]); // dst MAC
        bytes.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]); // src MAC
        bytes.extend_from_slice(&[0x08, 0x00]);
        let ip_len = (total_len - 14) as u16;
        bytes.push(0x45);
        bytes.push(0);
        bytes.extend_from_slice(&ip_len.to_be_bytes());
        bytes.extend_from_slice(&[0, 0, 0x40, 0, 0x40, 17, 0, 0]);
        bytes.extend_from_slice(&src);
        bytes.extend_from_slice(&dst);
        bytes.extend_from_slice(&src_port.to_be_bytes());
        bytes.extend_from_slice(&dst_port.to_be_bytes());
        let udp_len = (total_len - 34) as u16;
        bytes.extend_from_slice(&udp_len.to_be_bytes());
        bytes.extend_from_slice(&[0, 0]);
        bytes.resize(total_len, 0);
        decode(&bytes, ts).unwrap()
    }

    #[test]
    fn test_dns_rule_matches_first_packet() {
        let mut classifier = classifier();
        let frame = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 53, 120, 1);
        let classification = classifier.classify(&frame).unwrap();
        assert_eq!(classification, "DNS");

        let id = flow_id(&frame.source.unwrap(), &frame.dest.unwrap(), frame.protocol);
        let flow = classifier.get(&id).unwrap();
        assert!(flow.confidence >= 0.9);
    }

    #[test]
    fn test_bidirectional_packets_collapse_to_one_flow() {
        let mut classifier = classifier();
        let forward = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1234, 9999, 700, 1);
        let reverse = udp_frame([10, 0, 0, 2], [10, 0, 0, 1], 9999, 1234, 700, 2);

        classifier.classify(&forward);
        classifier.classify(&reverse);

        assert_eq!(classifier.len(), 1);
        let id = flow_id(
            &forward.source.unwrap(),
            &forward.dest.unwrap(),
            forward.protocol,
        );
        let flow = classifier.get(&id).unwrap();
        assert_eq!(flow.packet_count, 2);
        assert_eq!(flow.byte_count, 1400);
    }

    #[test]
    fn test_classification_only_upgrades_on_higher_confidence() {
        let mut classifier = classifier();
        // 120-byte port-53 flow: DNS rule at 0.9 beats the later pattern
        // candidates as more packets arrive.
        for i in 0..30 {
            let frame = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 53, 120, i);
            let classification = classifier.classify(&frame).unwrap();
            assert_eq!(classification, "DNS");
        }
    }

    #[test]
    fn test_media_streaming_rule_needs_packet_volume() {
        let mut classifier = classifier();
        // 700-byte UDP frames: outside both size rules, unknown port.
        let mut last = None;
        for i in 0..120 {
            let frame = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 9999, 700, i);
            last = classifier.classify(&frame);
        }
        assert_eq!(last.unwrap(), "Media Streaming");
    }

    #[test]
    fn test_reap_drops_only_idle_flows() {
        let mut classifier = classifier();
        let old = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 100, 1_000_000);
        let fresh = udp_frame([10, 0, 0, 3], [10, 0, 0, 4], 3, 4, 100, 200_000_000);
        classifier.classify(&old);
        classifier.classify(&fresh);

        let reaped = classifier.reap(302 * 1_000_000);
        assert_eq!(reaped, 1);
        assert_eq!(classifier.len(), 1);

        let survivor = flow_id(&fresh.source.unwrap(), &fresh.dest.unwrap(), fresh.protocol);
        assert!(classifier.get(&survivor).is_some());
    }

    #[test]
    fn test_capacity_bound_evicts_least_recent() {
        let mut classifier = FlowClassifier::new(NonZeroUsize::new(2).unwrap(), u64::MAX);
        for octet in 1..=3u8 {
            let frame = udp_frame([10, 0, 0, octet], [10, 0, 0, 100], 5, 6, 100, octet as u64);
            classifier.classify(&frame);
        }
        assert_eq!(classifier.len(), 2);
        assert_eq!(classifier.capacity_evictions(), 1);
    }

    #[test]
    fn test_statistics_histogram() {
        let mut classifier = classifier();
        classifier.classify(&udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 53, 120, 1));
        classifier.classify(&udp_frame([10, 0, 0, 3], [10, 0, 0, 4], 40000, 53, 120, 2));
        classifier.classify(&udp_frame([10, 0, 0, 5], [10, 0, 0, 6], 7, 8, 700, 3));

        let stats = classifier.statistics();
        assert_eq!(stats.total_flows, 3);
        assert_eq!(stats.total_packets, 3);
        assert_eq!(stats.classification_distribution["DNS"], 2);
        assert_eq!(stats.classification_distribution[UNCLASSIFIED], 1);
        assert_eq!(stats.top_flows.len(), 3);
        assert_eq!(stats.top_flows[0].byte_count, 700);
    }

    proptest! {
        #[test]
        fn prop_flow_id_is_direction_independent(
            a in proptest::array::uniform6(any::<u8>()),
            b in proptest::array::uniform6(any::<u8>()),
            tag in 0u8..8,
        ) {
            let protocol = match tag {
                0 => ProtocolType::Ieee80211,
                1 => ProtocolType::Ethernet,
                2 => ProtocolType::Ip,
                3 => ProtocolType::Arp,
                4 => ProtocolType::Tcp,
                5 => ProtocolType::Udp,
                6 => ProtocolType::Icmp,
                _ => ProtocolType::Unknown,
            };
            let left = EndpointAddr::Mac(MacAddr(a));
            let right = EndpointAddr::Mac(MacAddr(b));
            prop_assert_eq!(
                flow_id(&left, &right, protocol),
                flow_id(&right, &left, protocol)
            );
        }

        #[test]
        fn prop_distinct_protocols_get_distinct_ids(
            a in proptest::array::uniform6(any::<u8>()),
            b in proptest::array::uniform6(any::<u8>()),
        ) {
            let left = EndpointAddr::Mac(MacAddr(a));
            let right = EndpointAddr::Mac(MacAddr(b));
            prop_assert_ne!(
                flow_id(&left, &right, ProtocolType::Tcp),
                flow_id(&left, &right, ProtocolType::Udp)
            );
        }
    }
}
