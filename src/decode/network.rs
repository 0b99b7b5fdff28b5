//! Network-layer recognizers: IPv4 and ARP.

use super::Malformation;
use crate::addr::MacAddr;

use nom::IResult;
use nom::bytes::complete::take;
use nom::number::complete::{be_u8, be_u16};
use serde::Serialize;

use std::net::Ipv4Addr;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER_LEN: usize = 20;
const ARP_BODY_LEN: usize = 28;

/// Decoded network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NetworkLayer {
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        /// IP protocol number (6 TCP, 17 UDP, 1 ICMP).
        protocol: u8,
        /// Header length in bytes (IHL × 4).
        header_len: u8,
    },
    Arp {
        sender_hw: MacAddr,
        sender_ip: Ipv4Addr,
        target_hw: MacAddr,
        target_ip: Ipv4Addr,
        op: ArpOp,
    },
}

/// ARP operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArpOp {
    Request,
    Reply,
    Other(u16),
}

impl From<u16> for ArpOp {
    fn from(op: u16) -> Self {
        match op {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            other => ArpOp::Other(other),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Ipv4View {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub header_len: u8,
}

/// Reads an IPv4 header from the start of `payload`.
///
/// `Ok(None)` means the buffer is simply too short (recovered silently);
/// `Err` means the IHL field itself is bad and an anomaly should be raised.
pub(crate) fn decode_ipv4(payload: &[u8]) -> Result<Option<Ipv4View>, Malformation> {
    if payload.len() < IPV4_MIN_HEADER_LEN {
        return Ok(None);
    }
    let ihl = payload[0] & 0x0f;
    if ihl < 5 {
        return Err(Malformation::BadIpv4HeaderLength { ihl });
    }
    let header_len = ihl as usize * 4;
    if payload.len() < header_len {
        return Ok(None);
    }

    Ok(Some(Ipv4View {
        src: Ipv4Addr::new(payload[12], payload[13], payload[14], payload[15]),
        dst: Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]),
        protocol: payload[9],
        header_len: header_len as u8,
    }))
}

pub(crate) struct ArpView {
    pub sender_hw: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: MacAddr,
    pub target_ip: Ipv4Addr,
    pub op: ArpOp,
}

fn mac(i: &[u8]) -> IResult<&[u8], MacAddr> {
    let (i, raw) = take(6usize)(i)?;
    let mut mac = [0u8; 6];
    mac.copy_from_slice(raw);
    Ok((i, MacAddr(mac)))
}

fn ipv4(i: &[u8]) -> IResult<&[u8], Ipv4Addr> {
    let (i, raw) = take(4usize)(i)?;
    Ok((i, Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])))
}

fn parse_arp(i: &[u8]) -> IResult<&[u8], ArpView> {
    let (i, _hardware_type) = be_u16(i)?;
    let (i, _protocol_type) = be_u16(i)?;
    let (i, _hardware_len) = be_u8(i)?;
    let (i, _protocol_len) = be_u8(i)?;
    let (i, op) = be_u16(i)?;
    let (i, sender_hw) = mac(i)?;
    let (i, sender_ip) = ipv4(i)?;
    let (i, target_hw) = mac(i)?;
    let (i, target_ip) = ipv4(i)?;

    Ok((
        i,
        ArpView {
            sender_hw,
            sender_ip,
            target_hw,
            target_ip,
            op: ArpOp::from(op),
        },
    ))
}

/// Reads an Ethernet-framed ARP body. Short bodies are recovered silently.
pub(crate) fn decode_arp(payload: &[u8]) -> Option<ArpView> {
    if payload.len() < ARP_BODY_LEN {
        return None;
    }
    parse_arp(payload).ok().map(|(_, view)| view)
}
