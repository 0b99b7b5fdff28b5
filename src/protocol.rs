//! Protocol tags and well-known service ports.

use serde::Serialize;

/// Protocol tag attached to every decoded frame.
///
/// The tag is the most specific layer the decoder produced: transport if
/// present, otherwise network, otherwise link. Discriminants are stable:
/// they are fed into the flow fingerprint and must not be reordered.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Serialize)]
pub enum ProtocolType {
    Ieee80211 = 0,
    Ethernet = 1,
    Ip = 2,
    Arp = 3,
    Tcp = 4,
    Udp = 5,
    Icmp = 6,
    Unknown = 7,
}

impl ProtocolType {
    /// Stable byte used in flow fingerprints.
    #[inline]
    pub const fn tag_byte(self) -> u8 {
        self as u8
    }

    /// Wire-format name, matching the strings emitted in reports.
    pub const fn name(self) -> &'static str {
        match self {
            ProtocolType::Ieee80211 => "802.11",
            ProtocolType::Ethernet => "ethernet",
            ProtocolType::Ip => "ip",
            ProtocolType::Arp => "arp",
            ProtocolType::Tcp => "tcp",
            ProtocolType::Udp => "udp",
            ProtocolType::Icmp => "icmp",
            ProtocolType::Unknown => "unknown",
        }
    }

    const ALL: [ProtocolType; 8] = [
        ProtocolType::Ieee80211,
        ProtocolType::Ethernet,
        ProtocolType::Ip,
        ProtocolType::Arp,
        ProtocolType::Tcp,
        ProtocolType::Udp,
        ProtocolType::Icmp,
        ProtocolType::Unknown,
    ];
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Compact set of [`ProtocolType`] tags.
///
/// Topology records are stored in dense arenas; a bitmask keeps them `Copy`
/// and makes snapshotting a plain structural copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSet(u16);

impl ProtocolSet {
    pub const fn new() -> Self {
        ProtocolSet(0)
    }

    #[inline]
    pub fn insert(&mut self, protocol: ProtocolType) {
        self.0 |= 1 << protocol.tag_byte();
    }

    #[inline]
    pub fn contains(&self, protocol: ProtocolType) -> bool {
        self.0 & (1 << protocol.tag_byte()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = ProtocolType> + '_ {
        ProtocolType::ALL.into_iter().filter(|p| self.contains(*p))
    }

    /// Union with another set.
    pub fn merge(&mut self, other: ProtocolSet) {
        self.0 |= other.0;
    }
}

impl Serialize for ProtocolSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// Application service recognized from a well-known port.
///
/// Port 443 is reported as HTTPS purely by port number; there is no TLS
/// parsing, so non-TLS traffic on 443 carries the same hint.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum ServiceHint {
    Http,
    Https,
    Dns,
    Dhcp,
    Ssh,
    Telnet,
    Smtp,
    Pop3,
    Imap,
    Imaps,
    Pop3s,
}

impl ServiceHint {
    /// Classification label used by the flow classifier.
    pub const fn label(self) -> &'static str {
        match self {
            ServiceHint::Http => "HTTP",
            ServiceHint::Https => "HTTPS",
            ServiceHint::Dns => "DNS",
            ServiceHint::Dhcp => "DHCP",
            ServiceHint::Ssh => "SSH",
            ServiceHint::Telnet => "Telnet",
            ServiceHint::Smtp => "SMTP",
            ServiceHint::Pop3 => "POP3",
            ServiceHint::Imap => "IMAP",
            ServiceHint::Imaps => "IMAPS",
            ServiceHint::Pop3s => "POP3S",
        }
    }

    /// Confidence assigned when a flow is classified from this port alone.
    pub const fn confidence(self) -> f32 {
        match self {
            ServiceHint::Dns => 0.95,
            _ => 0.9,
        }
    }
}

impl std::fmt::Display for ServiceHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Maps a TCP/UDP port to a well-known service.
pub fn service_for_port(port: u16) -> Option<ServiceHint> {
    match port {
        80 => Some(ServiceHint::Http),
        443 => Some(ServiceHint::Https),
        53 => Some(ServiceHint::Dns),
        67 | 68 => Some(ServiceHint::Dhcp),
        22 => Some(ServiceHint::Ssh),
        23 => Some(ServiceHint::Telnet),
        25 => Some(ServiceHint::Smtp),
        110 => Some(ServiceHint::Pop3),
        143 => Some(ServiceHint::Imap),
        993 => Some(ServiceHint::Imaps),
        995 => Some(ServiceHint::Pop3s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_bytes_are_stable() {
        assert_eq!(ProtocolType::Ieee80211.tag_byte(), 0);
        assert_eq!(ProtocolType::Tcp.tag_byte(), 4);
        assert_eq!(ProtocolType::Unknown.tag_byte(), 7);
    }

    #[test]
    fn test_protocol_set_insert_and_iter() {
        let mut set = ProtocolSet::new();
        assert!(set.is_empty());

        set.insert(ProtocolType::Tcp);
        set.insert(ProtocolType::Udp);
        set.insert(ProtocolType::Tcp);

        assert_eq!(set.len(), 2);
        assert!(set.contains(ProtocolType::Tcp));
        assert!(!set.contains(ProtocolType::Arp));

        let collected: Vec<_> = set.iter().collect();
        assert_eq!(collected, vec![ProtocolType::Tcp, ProtocolType::Udp]);
    }

    #[test]
    fn test_protocol_set_merge() {
        let mut a = ProtocolSet::new();
        a.insert(ProtocolType::Ip);
        let mut b = ProtocolSet::new();
        b.insert(ProtocolType::Arp);

        a.merge(b);
        assert!(a.contains(ProtocolType::Ip));
        assert!(a.contains(ProtocolType::Arp));
    }

    #[test]
    fn test_well_known_ports() {
        assert_eq!(service_for_port(53), Some(ServiceHint::Dns));
        assert_eq!(service_for_port(67), Some(ServiceHint::Dhcp));
        assert_eq!(service_for_port(68), Some(ServiceHint::Dhcp));
        assert_eq!(service_for_port(8080), None);
    }

    #[test]
    fn test_dns_port_confidence_outranks_default() {
        assert!(ServiceHint::Dns.confidence() > ServiceHint::Http.confidence());
    }
}
