//! Transport-layer recognizers: TCP, UDP, ICMP.

use super::Malformation;

use nom_derive::{Nom, Parse};
use serde::Serialize;

const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const ICMP_MIN_LEN: usize = 4;

/// Decoded transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportLayer {
    Tcp {
        src_port: u16,
        dst_port: u16,
        sequence: u32,
        acknowledgment: u32,
        flags: TcpFlags,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Icmp,
}

/// TCP control flags (low six bits of the offset/flags word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    const FIN: u8 = 0x01;
    const SYN: u8 = 0x02;
    const RST: u8 = 0x04;
    const PSH: u8 = 0x08;
    const ACK: u8 = 0x10;
    const URG: u8 = 0x20;

    pub fn from_wire(offset_flags: u16) -> Self {
        TcpFlags((offset_flags & 0x3f) as u8)
    }

    /// Builds a flag set from booleans, wire-order FIN..URG. Test helper
    /// friendly.
    pub fn new(fin: bool, syn: bool, rst: bool, psh: bool, ack: bool, urg: bool) -> Self {
        let mut bits = 0;
        for (on, bit) in [
            (fin, Self::FIN),
            (syn, Self::SYN),
            (rst, Self::RST),
            (psh, Self::PSH),
            (ack, Self::ACK),
            (urg, Self::URG),
        ] {
            if on {
                bits |= bit;
            }
        }
        TcpFlags(bits)
    }

    pub fn fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }
    pub fn syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }
    pub fn rst(&self) -> bool {
        self.0 & Self::RST != 0
    }
    pub fn psh(&self) -> bool {
        self.0 & Self::PSH != 0
    }
    pub fn ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }
    pub fn urg(&self) -> bool {
        self.0 & Self::URG != 0
    }

    fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        [
            (Self::FIN, "FIN"),
            (Self::SYN, "SYN"),
            (Self::RST, "RST"),
            (Self::PSH, "PSH"),
            (Self::ACK, "ACK"),
            (Self::URG, "URG"),
        ]
        .into_iter()
        .filter(|(bit, _)| self.0 & bit != 0)
        .map(|(_, name)| name)
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for name in self.names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

impl Serialize for TcpFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.names())
    }
}

#[derive(Nom)]
struct TcpHeaderRaw {
    src_port: u16,
    dst_port: u16,
    sequence: u32,
    acknowledgment: u32,
    offset_flags: u16,
    _window: u16,
    _checksum: u16,
    _urgent: u16,
}

#[derive(Nom)]
struct UdpHeaderRaw {
    src_port: u16,
    dst_port: u16,
    length: u16,
    _checksum: u16,
}

/// Reads a TCP header, returning the layer and the segment payload.
///
/// A truncated header recovers to `Ok(None)`; a data offset below 5 words
/// is a malformation.
pub(crate) fn decode_tcp(
    segment: &[u8],
) -> Result<Option<(TransportLayer, &[u8])>, Malformation> {
    if segment.len() < TCP_MIN_HEADER_LEN {
        return Ok(None);
    }
    let Ok((_, raw)) = TcpHeaderRaw::parse_be(segment) else {
        return Ok(None);
    };

    let offset = (raw.offset_flags >> 12) as u8;
    if offset < 5 {
        return Err(Malformation::BadTcpDataOffset { offset });
    }
    let header_len = offset as usize * 4;
    if segment.len() < header_len {
        // Options advertised but not captured.
        return Ok(None);
    }

    let layer = TransportLayer::Tcp {
        src_port: raw.src_port,
        dst_port: raw.dst_port,
        sequence: raw.sequence,
        acknowledgment: raw.acknowledgment,
        flags: TcpFlags::from_wire(raw.offset_flags),
    };
    Ok(Some((layer, &segment[header_len..])))
}

/// Reads a UDP header, returning the layer and the datagram payload.
///
/// The length field must cover its own header and fit inside the captured
/// bytes; trailing link-layer padding beyond the field is legal.
pub(crate) fn decode_udp(
    segment: &[u8],
) -> Result<Option<(TransportLayer, &[u8])>, Malformation> {
    if segment.len() < UDP_HEADER_LEN {
        return Ok(None);
    }
    let Ok((_, raw)) = UdpHeaderRaw::parse_be(segment) else {
        return Ok(None);
    };

    let length = raw.length as usize;
    if raw.length < UDP_HEADER_LEN as u16 || length > segment.len() {
        return Err(Malformation::BadUdpLength {
            length: raw.length,
            available: segment.len().min(u16::MAX as usize) as u16,
        });
    }

    let layer = TransportLayer::Udp {
        src_port: raw.src_port,
        dst_port: raw.dst_port,
    };
    Ok(Some((layer, &segment[UDP_HEADER_LEN..length])))
}

/// ICMP carries no addressing the engine uses; the tag is enough.
pub(crate) fn decode_icmp(segment: &[u8]) -> bool {
    segment.len() >= ICMP_MIN_LEN
}
