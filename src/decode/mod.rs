//! Layered frame decoder.
//!
//! `decode` is a pure function from raw capture bytes to a [`DecodedFrame`];
//! it keeps no state, allocates nothing on success, and never fails the
//! whole pipeline over a single bad field. Layer recognizers live in the
//! submodules; this module owns detection precedence and address selection.
//!
//! Endianness note: radiotap and the 802.11 MAC header are little-endian,
//! everything from Ethernet up (IP, ARP, TCP, UDP, DNS, DHCP) is big-endian.

pub mod app;
pub mod link;
pub mod network;
pub mod transport;

pub use app::AppLayer;
pub use link::{Dot11FrameType, LinkLayer};
pub use network::{ArpOp, NetworkLayer};
pub use transport::{TcpFlags, TransportLayer};

use crate::addr::{EndpointAddr, MacAddr};
use crate::protocol::{ProtocolType, ServiceHint};

use serde::Serialize;

/// Minimum bytes for the smallest recognizable frame (Ethernet II header).
pub const MIN_FRAME_LEN: usize = 14;

/// A field-level defect found while decoding.
///
/// A malformation stops the decoder from descending further, so a frame
/// carries at most one. The affected layer is left out of the decoded view;
/// the anomaly detector turns the malformation into a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Malformation {
    /// IPv4 IHL below the minimum of 5 words.
    BadIpv4HeaderLength { ihl: u8 },
    /// TCP data offset below the minimum of 5 words.
    BadTcpDataOffset { offset: u8 },
    /// UDP length field below 8 or longer than the captured datagram.
    BadUdpLength { length: u16, available: u16 },
    /// DHCP message shorter than the 236-byte fixed header.
    ShortDhcp { available: u16 },
}

impl std::fmt::Display for Malformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Malformation::BadIpv4HeaderLength { ihl } => {
                write!(f, "IPv4 header length {ihl} below minimum of 5 words")
            }
            Malformation::BadTcpDataOffset { offset } => {
                write!(f, "TCP data offset {offset} below minimum of 5 words")
            }
            Malformation::BadUdpLength { length, available } => {
                write!(
                    f,
                    "UDP length field {length} inconsistent with {available} captured bytes"
                )
            }
            Malformation::ShortDhcp { available } => {
                write!(f, "DHCP message truncated at {available} bytes")
            }
        }
    }
}

/// Fully decoded view of one frame.
///
/// Ephemeral: produced by [`decode`], consumed within the same `analyze`
/// call chain, never stored. All fields are fixed-size; the struct owns no
/// heap data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecodedFrame {
    /// Capture timestamp, microseconds since the epoch.
    pub timestamp: u64,
    /// Bytes on the wire, including any radiotap header.
    pub total_len: u32,
    pub link: LinkLayer,
    pub network: Option<NetworkLayer>,
    pub transport: Option<TransportLayer>,
    pub app: Option<AppLayer>,
    /// Best-effort service guess from well-known ports.
    pub app_hint: Option<ServiceHint>,
    /// Most specific decoded layer; drives topology and flow identity.
    pub protocol: ProtocolType,
    /// Canonical source endpoint, when any layer yielded one.
    pub source: Option<EndpointAddr>,
    /// Canonical destination endpoint, when any layer yielded one.
    pub dest: Option<EndpointAddr>,
    pub malformation: Option<Malformation>,
}

impl DecodedFrame {
    fn unknown(timestamp: u64, total_len: u32) -> Self {
        DecodedFrame {
            timestamp,
            total_len,
            link: LinkLayer::Unknown,
            network: None,
            transport: None,
            app: None,
            app_hint: None,
            protocol: ProtocolType::Unknown,
            source: None,
            dest: None,
            malformation: None,
        }
    }

    /// Source and destination ports, when a port-bearing transport decoded.
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self.transport {
            Some(TransportLayer::Tcp {
                src_port, dst_port, ..
            })
            | Some(TransportLayer::Udp { src_port, dst_port }) => Some((src_port, dst_port)),
            _ => None,
        }
    }
}

/// Decodes one captured frame.
///
/// Returns `None` only when the buffer is shorter than the smallest
/// recognizable frame; every other defect degrades to a partial
/// [`DecodedFrame`] (missing layers, possibly a [`Malformation`]).
///
/// Detection precedence: a leading `00 00` pair is taken as a radiotap
/// signature (version 0, pad 0) followed by an 802.11 MAC header; anything
/// else is Ethernet II, with IPv4 and ARP recognized by ethertype. The
/// radiotap signature is a heuristic rather than a negotiated capability:
/// an Ethernet frame whose destination MAC starts `00:00` would be misread,
/// which is an accepted trade-off for monitor-mode capture sources.
///
/// # Examples
///
/// ```rust
/// use packet_engine::decode::decode;
/// use packet_engine::protocol::ProtocolType;
///
/// let frame_bytes = [
///     0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x00, 0x66, 0x77, 0x88, 0x99, 0x00,
///     0x08, 0x06, 0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01, 0x00, 0x66,
///     0x77, 0x88, 0x99, 0x00, 0xc0, 0xa8, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
///     0x00, 0x00, 0xc0, 0xa8, 0x00, 0x02,
/// ];
/// let frame = decode(&frame_bytes, 1_000_000).unwrap();
/// assert_eq!(frame.protocol, ProtocolType::Arp);
/// ```
pub fn decode(bytes: &[u8], timestamp: u64) -> Option<DecodedFrame> {
    if bytes.len() < MIN_FRAME_LEN {
        return None;
    }

    let mut frame = DecodedFrame::unknown(timestamp, bytes.len() as u32);

    if link::has_radiotap_signature(bytes) {
        link::decode_dot11(bytes, &mut frame);
    } else {
        decode_ethernet_chain(bytes, &mut frame);
    }

    Some(frame)
}

/// Ethernet II and everything stacked above it.
fn decode_ethernet_chain(bytes: &[u8], frame: &mut DecodedFrame) {
    let eth = link::decode_ethernet(bytes);
    frame.link = LinkLayer::Ethernet {
        src: eth.src,
        dst: eth.dst,
        ethertype: eth.ethertype,
    };
    frame.protocol = ProtocolType::Ethernet;
    frame.source = Some(EndpointAddr::Mac(eth.src));
    frame.dest = Some(EndpointAddr::Mac(eth.dst));

    let payload = &bytes[link::ETHERNET_HEADER_LEN..];
    match eth.ethertype {
        link::ETHERTYPE_IPV4 => decode_ipv4_chain(payload, frame),
        link::ETHERTYPE_ARP => decode_arp(payload, frame),
        _ => {}
    }
}

fn decode_ipv4_chain(payload: &[u8], frame: &mut DecodedFrame) {
    let ip = match network::decode_ipv4(payload) {
        Ok(Some(ip)) => ip,
        Ok(None) => return,
        Err(malformation) => {
            frame.malformation = Some(malformation);
            return;
        }
    };

    frame.network = Some(NetworkLayer::Ipv4 {
        src: ip.src,
        dst: ip.dst,
        protocol: ip.protocol,
        header_len: ip.header_len,
    });
    frame.protocol = ProtocolType::Ip;
    frame.source = Some(EndpointAddr::Ipv4(ip.src));
    frame.dest = Some(EndpointAddr::Ipv4(ip.dst));

    let segment = &payload[ip.header_len as usize..];
    match ip.protocol {
        network::IPPROTO_TCP => match transport::decode_tcp(segment) {
            Ok(Some((tcp, tcp_payload))) => {
                frame.transport = Some(tcp);
                frame.protocol = ProtocolType::Tcp;
                app::attach_app_layer(frame, tcp_payload);
            }
            Ok(None) => {}
            Err(malformation) => frame.malformation = Some(malformation),
        },
        network::IPPROTO_UDP => match transport::decode_udp(segment) {
            Ok(Some((udp, udp_payload))) => {
                frame.transport = Some(udp);
                frame.protocol = ProtocolType::Udp;
                app::attach_app_layer(frame, udp_payload);
            }
            Ok(None) => {}
            Err(malformation) => frame.malformation = Some(malformation),
        },
        network::IPPROTO_ICMP => {
            if transport::decode_icmp(segment) {
                frame.transport = Some(TransportLayer::Icmp);
                frame.protocol = ProtocolType::Icmp;
            }
        }
        _ => {}
    }
}

fn decode_arp(payload: &[u8], frame: &mut DecodedFrame) {
    let Some(arp) = network::decode_arp(payload) else {
        return;
    };

    frame.network = Some(NetworkLayer::Arp {
        sender_hw: arp.sender_hw,
        sender_ip: arp.sender_ip,
        target_hw: arp.target_hw,
        target_ip: arp.target_ip,
        op: arp.op,
    });
    frame.protocol = ProtocolType::Arp;
    // ARP binds hardware and protocol addresses; carry both so the topology
    // can exclude the zero target MAC of a request.
    frame.source = Some(EndpointAddr::Bound(arp.sender_hw, arp.sender_ip));
    frame.dest = Some(EndpointAddr::Bound(arp.target_hw, arp.target_ip));
}

/// Cheap link-address peek used to route frames across engine shards.
///
/// Reads just enough of the header to recover the unordered MAC pair; no
/// upper layers are touched.
pub fn peek_link_pair(bytes: &[u8]) -> Option<(MacAddr, MacAddr)> {
    if bytes.len() < MIN_FRAME_LEN {
        return None;
    }
    if link::has_radiotap_signature(bytes) {
        link::peek_dot11_pair(bytes)
    } else {
        let eth = link::decode_ethernet(bytes);
        Some((eth.src, eth.dst))
    }
}
