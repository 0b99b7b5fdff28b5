//! Application-layer dissectors: DNS, DHCP and an HTTP shape sniff.
//!
//! These are deliberately shallow. The engine only needs enough of each
//! protocol to hint classification and catch truncated messages; full field
//! parity with dedicated dissectors is a non-goal.

use super::{DecodedFrame, Malformation, TransportLayer};
use crate::addr::MacAddr;
use crate::protocol::{ServiceHint, service_for_port};

use nom_derive::{Nom, Parse};
use serde::Serialize;

use std::net::Ipv4Addr;

const DNS_HEADER_LEN: usize = 12;
/// Fixed BOOTP/DHCP header through the 16-byte chaddr field and beyond.
const DHCP_MIN_LEN: usize = 236;

/// Decoded application layer (best effort).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AppLayer {
    Dns {
        id: u16,
        is_response: bool,
        questions: u16,
        answers: u16,
    },
    Dhcp {
        op: DhcpOp,
        transaction_id: u32,
        client_ip: Ipv4Addr,
        your_ip: Ipv4Addr,
        client_mac: MacAddr,
    },
    Http {
        is_request: bool,
    },
}

/// BOOTP operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DhcpOp {
    Request,
    Reply,
    Other(u8),
}

impl From<u8> for DhcpOp {
    fn from(op: u8) -> Self {
        match op {
            1 => DhcpOp::Request,
            2 => DhcpOp::Reply,
            other => DhcpOp::Other(other),
        }
    }
}

#[derive(Nom)]
struct DnsHeaderRaw {
    id: u16,
    flags: u16,
    questions: u16,
    answers: u16,
    _authority: u16,
    _additional: u16,
}

/// Attaches the port hint and, where the payload shape allows, a shallow
/// application layer to an already transport-decoded frame.
pub(crate) fn attach_app_layer(frame: &mut DecodedFrame, payload: &[u8]) {
    let Some((src_port, dst_port)) = frame.ports() else {
        return;
    };
    let hint = service_for_port(src_port).or_else(|| service_for_port(dst_port));
    frame.app_hint = hint;

    let is_udp = matches!(frame.transport, Some(TransportLayer::Udp { .. }));
    match hint {
        Some(ServiceHint::Dns) if is_udp => {
            frame.app = decode_dns(payload);
        }
        Some(ServiceHint::Dhcp) if is_udp => match decode_dhcp(payload) {
            Ok(app) => frame.app = app,
            Err(malformation) => frame.malformation = Some(malformation),
        },
        Some(ServiceHint::Http) if !is_udp => {
            frame.app = sniff_http(payload);
        }
        _ => {}
    }
}

fn decode_dns(payload: &[u8]) -> Option<AppLayer> {
    if payload.len() < DNS_HEADER_LEN {
        return None;
    }
    let (_, raw) = DnsHeaderRaw::parse_be(payload).ok()?;
    Some(AppLayer::Dns {
        id: raw.id,
        is_response: raw.flags >> 15 == 1,
        questions: raw.questions,
        answers: raw.answers,
    })
}

fn decode_dhcp(payload: &[u8]) -> Result<Option<AppLayer>, Malformation> {
    if payload.len() < DHCP_MIN_LEN {
        return Err(Malformation::ShortDhcp {
            available: payload.len().min(u16::MAX as usize) as u16,
        });
    }

    let mut client_mac = [0u8; 6];
    client_mac.copy_from_slice(&payload[28..34]);

    Ok(Some(AppLayer::Dhcp {
        op: DhcpOp::from(payload[0]),
        transaction_id: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
        client_ip: Ipv4Addr::new(payload[12], payload[13], payload[14], payload[15]),
        your_ip: Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]),
        client_mac: MacAddr(client_mac),
    }))
}

fn sniff_http(payload: &[u8]) -> Option<AppLayer> {
    const METHODS: [&[u8]; 5] = [b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD "];

    if METHODS.iter().any(|m| payload.starts_with(m)) {
        Some(AppLayer::Http { is_request: true })
    } else if payload.starts_with(b"HTTP/") {
        Some(AppLayer::Http { is_request: false })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_header() {
        let mut payload = vec![0u8; 16];
        payload[0] = 0xab;
        payload[1] = 0xcd;
        payload[2] = 0x81; // QR set
        payload[5] = 1; // one question
        payload[7] = 2; // two answers

        match decode_dns(&payload) {
            Some(AppLayer::Dns {
                id,
                is_response,
                questions,
                answers,
            }) => {
                assert_eq!(id, 0xabcd);
                assert!(is_response);
                assert_eq!(questions, 1);
                assert_eq!(answers, 2);
            }
            other => panic!("expected DNS, got {other:?}"),
        }
    }

    #[test]
    fn test_short_dns_is_skipped() {
        assert!(decode_dns(&[0u8; 11]).is_none());
    }

    #[test]
    fn test_dhcp_fixed_header() {
        let mut payload = vec![0u8; DHCP_MIN_LEN];
        payload[0] = 2; // reply
        payload[4..8].copy_from_slice(&0xdeadbeefu32.to_be_bytes());
        payload[16..20].copy_from_slice(&[192, 168, 0, 50]);
        payload[28..34].copy_from_slice(&[0, 0x11, 0x22, 0x33, 0x44, 0x55]);

        match decode_dhcp(&payload).unwrap() {
            Some(AppLayer::Dhcp {
                op,
                transaction_id,
                your_ip,
                client_mac,
                ..
            }) => {
                assert_eq!(op, DhcpOp::Reply);
                assert_eq!(transaction_id, 0xdeadbeef);
                assert_eq!(your_ip, Ipv4Addr::new(192, 168, 0, 50));
                assert_eq!(client_mac, MacAddr([0, 0x11, 0x22, 0x33, 0x44, 0x55]));
            }
            other => panic!("expected DHCP, got {other:?}"),
        }
    }

    #[test]
    fn test_short_dhcp_is_malformed() {
        assert_eq!(
            decode_dhcp(&[0u8; 100]),
            Err(Malformation::ShortDhcp { available: 100 })
        );
    }

    #[test]
    fn test_http_sniff() {
        assert_eq!(
            sniff_http(b"GET /index.html HTTP/1.1\r\n"),
            Some(AppLayer::Http { is_request: true })
        );
        assert_eq!(
            sniff_http(b"HTTP/1.1 200 OK\r\n"),
            Some(AppLayer::Http { is_request: false })
        );
        assert_eq!(sniff_http(b"\x16\x03\x01"), None);
    }
}
