//! Link-layer recognizers: Ethernet II and 802.11 behind radiotap.

use crate::addr::MacAddr;

use serde::Serialize;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Minimum radiotap header: version, pad, length, present word.
const RADIOTAP_MIN_LEN: usize = 8;
/// 802.11 MAC header through addr3 and sequence control.
const DOT11_HEADER_LEN: usize = 24;

/// Decoded link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkLayer {
    Dot11 {
        /// Receiver address.
        addr1: MacAddr,
        /// Transmitter address.
        addr2: MacAddr,
        /// Filtering address (BSSID for infrastructure frames).
        addr3: MacAddr,
        frame_type: Dot11FrameType,
        subtype: u8,
    },
    Ethernet {
        src: MacAddr,
        dst: MacAddr,
        ethertype: u16,
    },
    Unknown,
}

/// 802.11 frame type from the frame-control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dot11FrameType {
    Management,
    Control,
    Data,
    Extension,
}

impl From<u8> for Dot11FrameType {
    fn from(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Dot11FrameType::Management,
            1 => Dot11FrameType::Control,
            2 => Dot11FrameType::Data,
            _ => Dot11FrameType::Extension,
        }
    }
}

#[inline]
pub(crate) fn has_radiotap_signature(bytes: &[u8]) -> bool {
    bytes[0] == 0x00 && bytes[1] == 0x00
}

#[inline]
fn mac_at(bytes: &[u8], offset: usize) -> MacAddr {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[offset..offset + 6]);
    MacAddr(mac)
}

pub(crate) struct EthernetView {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub ethertype: u16,
}

/// Reads an Ethernet II header. Caller guarantees at least 14 bytes.
pub(crate) fn decode_ethernet(bytes: &[u8]) -> EthernetView {
    EthernetView {
        dst: mac_at(bytes, 0),
        src: mac_at(bytes, 6),
        ethertype: u16::from_be_bytes([bytes[12], bytes[13]]),
    }
}

/// Skips the radiotap header and reads the 802.11 MAC header into `frame`.
///
/// Radiotap advertises its own length little-endian at offset 2. A bogus
/// length or a body shorter than the MAC header leaves the frame at
/// `LinkLayer::Unknown`; the frame still flows downstream so the
/// protocol-mix check can see it.
///
/// Endpoints are taken from addr2 (transmitter) and addr1 (receiver) for
/// every frame type, management included; beacon and probe transmitters
/// become topology nodes this way. The frame type is decoded and exposed
/// but does not gate address selection.
pub(crate) fn decode_dot11(bytes: &[u8], frame: &mut super::DecodedFrame) {
    let radiotap_len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    if radiotap_len < RADIOTAP_MIN_LEN {
        tracing::trace!(radiotap_len, "implausible radiotap length, leaving frame unknown");
        return;
    }
    let Some(body) = bytes.get(radiotap_len..) else {
        return;
    };
    if body.len() < DOT11_HEADER_LEN {
        return;
    }

    let frame_control = u16::from_le_bytes([body[0], body[1]]);
    let addr1 = mac_at(body, 4);
    let addr2 = mac_at(body, 10);
    let addr3 = mac_at(body, 16);

    frame.link = LinkLayer::Dot11 {
        addr1,
        addr2,
        addr3,
        frame_type: Dot11FrameType::from(((frame_control >> 2) & 0x3) as u8),
        subtype: ((frame_control >> 4) & 0xf) as u8,
    };
    frame.protocol = crate::protocol::ProtocolType::Ieee80211;
    // Transmitter to receiver.
    frame.source = Some(crate::addr::EndpointAddr::Mac(addr2));
    frame.dest = Some(crate::addr::EndpointAddr::Mac(addr1));
}

/// Transmitter/receiver pair of an 802.11 frame, for shard routing.
pub(crate) fn peek_dot11_pair(bytes: &[u8]) -> Option<(MacAddr, MacAddr)> {
    let radiotap_len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    if radiotap_len < RADIOTAP_MIN_LEN {
        return None;
    }
    let body = bytes.get(radiotap_len..)?;
    if body.len() < DOT11_HEADER_LEN {
        return None;
    }
    Some((mac_at(body, 10), mac_at(body, 4)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_bits() {
        assert_eq!(Dot11FrameType::from(0), Dot11FrameType::Management);
        assert_eq!(Dot11FrameType::from(1), Dot11FrameType::Control);
        assert_eq!(Dot11FrameType::from(2), Dot11FrameType::Data);
        assert_eq!(Dot11FrameType::from(3), Dot11FrameType::Extension);
    }

    #[test]
    fn test_ethernet_view() {
        let mut bytes = [0u8; 14];
        bytes[0..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        bytes[6..12].copy_from_slice(&[7, 8, 9, 10, 11, 12]);
        bytes[12] = 0x08;
        bytes[13] = 0x00;

        let eth = decode_ethernet(&bytes);
        assert_eq!(eth.dst, MacAddr([1, 2, 3, 4, 5, 6]));
        assert_eq!(eth.src, MacAddr([7, 8, 9, 10, 11, 12]));
        assert_eq!(eth.ethertype, ETHERTYPE_IPV4);
    }

    #[test]
    fn test_radiotap_signature() {
        assert!(has_radiotap_signature(&[0x00, 0x00, 0x08, 0x00]));
        assert!(!has_radiotap_signature(&[0x00, 0x11, 0x08, 0x00]));
    }
}
