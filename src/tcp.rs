//! Simplified TCP connection state tracking.
//!
//! The tracker mirrors the TCP lifecycle just closely enough to flag
//! violations; it does not reconstruct streams. One entry per connection,
//! stored under the initiator's socket pair; replies are found through the
//! reversed pair.

use crate::addr::EndpointAddr;
use crate::decode::TcpFlags;

use serde::Serialize;
use tracing::debug;

use std::collections::HashMap;

/// Connection lifecycle state. `Closed` is the implicit state of any pair
/// without a tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TcpState {
    Closed,
    SynSent,
    SynRcvd,
    Established,
    FinWait,
    Closing,
    TimeWait,
}

/// Ordered socket pair identifying one direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketPair {
    pub src: EndpointAddr,
    pub src_port: u16,
    pub dst: EndpointAddr,
    pub dst_port: u16,
}

impl SocketPair {
    pub fn new(src: EndpointAddr, src_port: u16, dst: EndpointAddr, dst_port: u16) -> Self {
        SocketPair {
            src,
            src_port,
            dst,
            dst_port,
        }
    }

    fn reversed(&self) -> Self {
        SocketPair {
            src: self.dst,
            src_port: self.dst_port,
            dst: self.src,
            dst_port: self.src_port,
        }
    }
}

#[derive(Debug, Clone)]
struct ConnEntry {
    state: TcpState,
    last_seq: u32,
    last_ack: u32,
    last_update: u64,
}

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    /// Along the stored (initiator → responder) orientation.
    Forward,
    Reverse,
}

/// Per-pair TCP state machine used to flag protocol violations.
#[derive(Debug)]
pub struct TcpTracker {
    connections: HashMap<SocketPair, ConnEntry>,
    flow_ttl_us: u64,
    timewait_factor: u32,
}

impl TcpTracker {
    pub(crate) fn new(flow_ttl_us: u64, timewait_factor: u32) -> Self {
        TcpTracker {
            connections: HashMap::new(),
            flow_ttl_us,
            timewait_factor,
        }
    }

    /// Advances the state machine with one observed segment.
    ///
    /// Returns a violation description when the segment does not fit the
    /// tracked state; the state itself is never corrupted by an unexpected
    /// segment. RST tears the entry down without a violation.
    pub fn observe(
        &mut self,
        pair: SocketPair,
        sequence: u32,
        acknowledgment: u32,
        flags: TcpFlags,
        timestamp: u64,
    ) -> Option<String> {
        let reversed = pair.reversed();
        let located = if self.connections.contains_key(&pair) {
            Some((pair, Direction::Forward))
        } else if self.connections.contains_key(&reversed) {
            Some((reversed, Direction::Reverse))
        } else {
            None
        };

        let Some((key, direction)) = located else {
            if flags.syn() && !flags.ack() {
                self.connections.insert(
                    pair,
                    ConnEntry {
                        state: TcpState::SynSent,
                        last_seq: sequence,
                        last_ack: acknowledgment,
                        last_update: timestamp,
                    },
                );
                return None;
            }
            if flags.rst() {
                // Reset against nothing tracked; ignore.
                return None;
            }
            return Some(format!(
                "TCP segment ({flags}) on closed connection {}:{} -> {}:{}",
                pair.src, pair.src_port, pair.dst, pair.dst_port
            ));
        };

        if flags.rst() {
            self.connections.remove(&key);
            return None;
        }

        let entry = self.connections.get_mut(&key)?;
        entry.last_update = entry.last_update.max(timestamp);

        let (next, violation) = Self::transition(entry.state, direction, flags);
        entry.state = next;
        entry.last_seq = sequence;
        entry.last_ack = acknowledgment;

        violation.map(|what| {
            format!(
                "{what} on {}:{} -> {}:{}",
                key.src, key.src_port, key.dst, key.dst_port
            )
        })
    }

    fn transition(
        state: TcpState,
        direction: Direction,
        flags: TcpFlags,
    ) -> (TcpState, Option<&'static str>) {
        match state {
            TcpState::Closed => (state, None),
            TcpState::SynSent => {
                if flags.syn() && flags.ack() && direction == Direction::Reverse {
                    (TcpState::SynRcvd, None)
                } else if flags.syn() && !flags.ack() && direction == Direction::Forward {
                    // SYN retransmission.
                    (state, None)
                } else {
                    (state, Some("unexpected TCP segment during handshake"))
                }
            }
            TcpState::SynRcvd => {
                if flags.ack() && !flags.syn() && !flags.fin() {
                    (TcpState::Established, None)
                } else if flags.syn() && flags.ack() && direction == Direction::Reverse {
                    // SYN+ACK retransmission.
                    (state, None)
                } else {
                    (state, Some("unexpected TCP segment before handshake completion"))
                }
            }
            TcpState::Established => {
                if flags.syn() {
                    (state, Some("TCP SYN on established connection"))
                } else if flags.fin() {
                    (TcpState::FinWait, None)
                } else {
                    (state, None)
                }
            }
            TcpState::FinWait => {
                if flags.fin() {
                    (TcpState::Closing, None)
                } else if flags.ack() {
                    (TcpState::TimeWait, None)
                } else {
                    (state, None)
                }
            }
            TcpState::Closing => {
                if flags.ack() {
                    (TcpState::TimeWait, None)
                } else {
                    (state, None)
                }
            }
            TcpState::TimeWait => {
                if flags.syn() {
                    (state, Some("TCP SYN during TIME-WAIT"))
                } else {
                    (state, None)
                }
            }
        }
    }

    /// Drops stale entries: TIME-WAIT after `timewait_factor × flow_ttl`,
    /// anything else after `flow_ttl` of inactivity.
    pub fn evict(&mut self, now: u64) -> usize {
        let ttl = self.flow_ttl_us;
        let timewait = ttl.saturating_mul(self.timewait_factor as u64);
        let before = self.connections.len();
        self.connections.retain(|_, entry| {
            let idle = now.saturating_sub(entry.last_update);
            match entry.state {
                TcpState::TimeWait => idle <= timewait,
                _ => idle <= ttl,
            }
        });
        let dropped = before - self.connections.len();
        if dropped > 0 {
            debug!(dropped, "evicted stale TCP connection state");
        }
        dropped
    }

    /// Current state of a pair, `Closed` when untracked. Checks both
    /// orientations.
    pub fn state_of(&self, pair: &SocketPair) -> TcpState {
        self.connections
            .get(pair)
            .or_else(|| self.connections.get(&pair.reversed()))
            .map(|entry| entry.state)
            .unwrap_or(TcpState::Closed)
    }

    /// Last sequence and acknowledgment numbers seen on a tracked pair.
    pub fn last_numbers(&self, pair: &SocketPair) -> Option<(u32, u32)> {
        self.connections
            .get(pair)
            .or_else(|| self.connections.get(&pair.reversed()))
            .map(|entry| (entry.last_seq, entry.last_ack))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::MacAddr;

    fn addr(last: u8) -> EndpointAddr {
        EndpointAddr::Mac(MacAddr([0, 0, 0, 0, 0, last]))
    }

    fn syn() -> TcpFlags {
        TcpFlags::new(false, true, false, false, false, false)
    }
    fn syn_ack() -> TcpFlags {
        TcpFlags::new(false, true, false, false, true, false)
    }
    fn ack() -> TcpFlags {
        TcpFlags::new(false, false, false, false, true, false)
    }
    fn fin_ack() -> TcpFlags {
        TcpFlags::new(true, false, false, false, true, false)
    }
    fn rst() -> TcpFlags {
        TcpFlags::new(false, false, true, false, false, false)
    }

    fn pair() -> SocketPair {
        SocketPair::new(addr(1), 1234, addr(2), 80)
    }

    #[test]
    fn test_handshake_reaches_established_without_violations() {
        let mut tracker = TcpTracker::new(300_000_000, 2);
        let forward = pair();
        let reverse = SocketPair::new(addr(2), 80, addr(1), 1234);

        assert_eq!(tracker.observe(forward, 100, 0, syn(), 1), None);
        assert_eq!(tracker.state_of(&forward), TcpState::SynSent);

        assert_eq!(tracker.observe(reverse, 500, 101, syn_ack(), 2), None);
        assert_eq!(tracker.state_of(&forward), TcpState::SynRcvd);

        assert_eq!(tracker.observe(forward, 101, 501, ack(), 3), None);
        assert_eq!(tracker.state_of(&forward), TcpState::Established);
        assert_eq!(tracker.last_numbers(&forward), Some((101, 501)));
    }

    #[test]
    fn test_syn_on_established_is_a_violation_and_state_holds() {
        let mut tracker = TcpTracker::new(300_000_000, 2);
        let forward = pair();
        let reverse = SocketPair::new(addr(2), 80, addr(1), 1234);
        tracker.observe(forward, 0, 0, syn(), 1);
        tracker.observe(reverse, 0, 1, syn_ack(), 2);
        tracker.observe(forward, 1, 1, ack(), 3);

        let violation = tracker.observe(forward, 2, 1, syn(), 4);
        assert!(violation.unwrap().contains("established"));
        assert_eq!(tracker.state_of(&forward), TcpState::Established);
    }

    #[test]
    fn test_data_on_closed_connection_is_a_violation() {
        let mut tracker = TcpTracker::new(300_000_000, 2);
        let violation = tracker.observe(pair(), 9, 9, ack(), 1);
        assert!(violation.unwrap().contains("closed connection"));
        assert_eq!(tracker.state_of(&pair()), TcpState::Closed);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_close_sequence_reaches_time_wait() {
        let mut tracker = TcpTracker::new(300_000_000, 2);
        let forward = pair();
        let reverse = SocketPair::new(addr(2), 80, addr(1), 1234);
        tracker.observe(forward, 0, 0, syn(), 1);
        tracker.observe(reverse, 0, 1, syn_ack(), 2);
        tracker.observe(forward, 1, 1, ack(), 3);

        assert_eq!(tracker.observe(forward, 2, 1, fin_ack(), 4), None);
        assert_eq!(tracker.state_of(&forward), TcpState::FinWait);
        assert_eq!(tracker.observe(reverse, 1, 3, fin_ack(), 5), None);
        assert_eq!(tracker.state_of(&forward), TcpState::Closing);
        assert_eq!(tracker.observe(forward, 3, 2, ack(), 6), None);
        assert_eq!(tracker.state_of(&forward), TcpState::TimeWait);
    }

    #[test]
    fn test_rst_tears_down_without_violation() {
        let mut tracker = TcpTracker::new(300_000_000, 2);
        tracker.observe(pair(), 0, 0, syn(), 1);
        assert_eq!(tracker.observe(pair(), 1, 0, rst(), 2), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_syn_retransmission_is_benign() {
        let mut tracker = TcpTracker::new(300_000_000, 2);
        tracker.observe(pair(), 0, 0, syn(), 1);
        assert_eq!(tracker.observe(pair(), 0, 0, syn(), 2), None);
        assert_eq!(tracker.state_of(&pair()), TcpState::SynSent);
    }

    #[test]
    fn test_eviction_honors_timewait_grace() {
        let ttl = 1_000_000;
        let mut tracker = TcpTracker::new(ttl, 2);
        let forward = pair();
        let reverse = SocketPair::new(addr(2), 80, addr(1), 1234);

        // One connection parked in TIME-WAIT at t=6.
        tracker.observe(forward, 0, 0, syn(), 1);
        tracker.observe(reverse, 0, 1, syn_ack(), 2);
        tracker.observe(forward, 1, 1, ack(), 3);
        tracker.observe(forward, 2, 1, fin_ack(), 4);
        tracker.observe(reverse, 1, 3, fin_ack(), 5);
        tracker.observe(forward, 3, 2, ack(), 6);

        // Another connection mid-handshake at t=10.
        let other = SocketPair::new(addr(3), 5000, addr(4), 80);
        tracker.observe(other, 0, 0, syn(), 10);

        // Past flow_ttl for both, but TIME-WAIT has double the grace.
        assert_eq!(tracker.evict(ttl + 100), 1);
        assert_eq!(tracker.state_of(&other), TcpState::Closed);
        assert_eq!(tracker.state_of(&forward), TcpState::TimeWait);

        // Past the TIME-WAIT grace as well.
        assert_eq!(tracker.evict(2 * ttl + 100), 1);
        assert!(tracker.is_empty());
    }
}
