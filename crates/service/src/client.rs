use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

use codec::header::{Header, PacketType, ProtocolVersion};
use codec::packet::{DataFrame, Packet};

use crate::config::BandwidthBudget;

pub const UDP_MAX_PKT_LEN: usize = 548;
/// How close to `expected` a sequence can be behind it and still count as
/// wrap/noise duplicate rather than a stale reorder miss.
const DUPLICATE_WINDOW: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterType {
    Router,
    Node,
    Proxy,
    IpRouter,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRoutingDescriptor {
    pub domains: Vec<u8>,
    pub subnet_nodes: Vec<(u8, u8)>,
    pub neuron_ids: Vec<[u8; 6]>,
    pub router_type: Option<RouterType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Bound,
    Transmitting,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub sent_frames: u64,
    pub dropped: u64,
    pub duplicates: u64,
    pub lost: u64,
    pub auth_failures: u64,
    pub alt_port_used: u64,
}

struct QueuedFrame {
    bytes: Vec<u8>,
}

struct EscrowEntry {
    frame: Vec<u8>,
    parked_at_ms: u64,
}

pub enum OutboundOutcome {
    SendNow(Vec<u8>),
    Queued,
    Dropped,
}

pub enum InboundFrame {
    Deliver(Vec<u8>),
    Duplicate,
    Stale,
    Parked,
}

/// Per-member state applying channel policy to one peer (§4.4).
pub struct PerPeerClient {
    pub peer: SocketAddr,
    pub routing: Option<ChannelRoutingDescriptor>,
    state: ClientState,
    our_session: u32,
    sequence: u32,
    peer_session_current: Option<u32>,
    peer_session_previous: Option<u32>,
    expected_sequence: u32,
    waiting: VecDeque<QueuedFrame>,
    waiting_bytes: usize,
    escrow: BTreeMap<u32, EscrowEntry>,
    pub stats: ClientStats,
}

impl PerPeerClient {
    pub fn new(peer: SocketAddr, our_session: u32) -> Self {
        Self {
            peer,
            routing: None,
            state: ClientState::Idle,
            our_session,
            sequence: 0,
            peer_session_current: None,
            peer_session_previous: None,
            expected_sequence: 0,
            waiting: VecDeque::new(),
            waiting_bytes: 0,
            escrow: BTreeMap::new(),
            stats: ClientStats::default(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn mark_bound(&mut self) {
        if self.state == ClientState::Idle {
            self.state = ClientState::Bound;
        }
    }

    fn mark_transmitting(&mut self) {
        self.state = ClientState::Transmitting;
    }

    /// Flushes all waiting and escrowed frames and moves to `Stopped`,
    /// per the channel-stop transition in §4.4's state machine.
    pub fn stop(&mut self) {
        self.waiting.clear();
        self.waiting_bytes = 0;
        self.escrow.clear();
        self.state = ClientState::Stopped;
    }

    fn encode_data_frame(&self, lontalk_frame: &[u8], timestamp: u32, auth_flag: bool, extended: bool, sender_ext: Option<codec::ExtendedHeader>) -> Vec<u8> {
        let header = Header {
            packet_size: 0,
            version: if extended { ProtocolVersion::Current } else { ProtocolVersion::Legacy },
            vendor_private: false,
            packet_type: PacketType::Data,
            auth_flag,
            vendor_code: 0,
            session: self.our_session,
            sequence: self.sequence,
            timestamp,
            extended: sender_ext,
        };

        Packet::Data(DataFrame {
            header,
            frame: lontalk_frame,
            crc_ok: true,
        })
        .encode_marked(auth_flag)
    }

    /// Accepts a frame handed down from the LRE for transmission (§4.4
    /// outbound pipeline, steps 1-5). `frame_age_ms` is how long the frame
    /// has already waited upstream of this call.
    #[allow(clippy::too_many_arguments)]
    pub fn accept_outbound(
        &mut self,
        lontalk_frame: &[u8],
        frame_age_ms: u64,
        now_ms: u64,
        timestamp: u32,
        channel_timeout_ms: u32,
        aggregate: bool,
        bw_limit: bool,
        queue_depth: usize,
        auth_flag: bool,
        extended: bool,
    ) -> OutboundOutcome {
        if frame_age_ms > (channel_timeout_ms as u64) / 2 {
            self.stats.dropped += 1;
            return OutboundOutcome::Dropped;
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.mark_transmitting();

        let encoded = self.encode_data_frame(lontalk_frame, timestamp, auth_flag, extended, None);

        if !aggregate && !bw_limit && self.waiting.is_empty() {
            self.stats.sent_frames += 1;
            return OutboundOutcome::SendNow(encoded);
        }

        self.waiting_bytes += encoded.len();
        self.waiting.push_back(QueuedFrame { bytes: encoded });

        while self.waiting.len() > queue_depth {
            if let Some(dropped) = self.waiting.pop_front() {
                self.waiting_bytes -= dropped.bytes.len();
                self.stats.dropped += 1;
            }
        }

        if self.waiting_bytes >= UDP_MAX_PKT_LEN && !bw_limit {
            let _ = self.drain_ready(now_ms, None);
        }

        OutboundOutcome::Queued
    }

    /// Packs queued frames into datagrams no larger than `UDP_MAX_PKT_LEN`,
    /// driven by the master's aggregation timer; throttled by `budget`
    /// when the channel is bandwidth-limited.
    pub fn drain_ready(&mut self, now_ms: u64, mut budget: Option<&mut BandwidthBudget>) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        let mut current = Vec::new();

        while let Some(front) = self.waiting.front() {
            if !current.is_empty() && current.len() + front.bytes.len() > UDP_MAX_PKT_LEN {
                break;
            }

            if let Some(budget) = budget.as_deref_mut() {
                if current.is_empty() && !budget.try_take(now_ms) {
                    break;
                }
            }

            let frame = self.waiting.pop_front().unwrap();
            self.waiting_bytes -= frame.bytes.len();
            current.extend_from_slice(&frame.bytes);
        }

        if !current.is_empty() {
            self.stats.sent_frames += 1;
            datagrams.push(current);
        }

        datagrams
    }

    /// Inbound pipeline step 3: session/sequence logic for one DATA frame.
    /// `frame` is the LonTalk frame carried by this packet, captured so a
    /// `Deliver`/`Parked` outcome can hand the real bytes up to the LRE.
    #[allow(clippy::too_many_arguments)]
    pub fn on_data_frame(
        &mut self,
        session: u32,
        sequence: u32,
        timestamp: u32,
        now_ts: u32,
        channel_timeout_ms: u32,
        reorder_enabled: bool,
        now_ms: u64,
        frame: &[u8],
    ) -> InboundFrame {
        self.mark_transmitting();

        let is_new_session = self.peer_session_current != Some(session);

        if is_new_session {
            self.peer_session_previous = self.peer_session_current;
            self.peer_session_current = Some(session);
            self.expected_sequence = sequence.wrapping_add(1);

            if now_ts.saturating_sub(timestamp) > channel_timeout_ms {
                return InboundFrame::Stale;
            }

            return InboundFrame::Deliver(frame.to_vec());
        }

        if now_ts.saturating_sub(timestamp) > channel_timeout_ms {
            return InboundFrame::Stale;
        }

        if sequence == self.expected_sequence {
            self.expected_sequence = self.expected_sequence.wrapping_add(1);
            return InboundFrame::Deliver(frame.to_vec());
        }

        if self.expected_sequence.wrapping_sub(sequence) <= DUPLICATE_WINDOW
            && sequence < self.expected_sequence
        {
            self.stats.duplicates += 1;
            return InboundFrame::Duplicate;
        }

        if reorder_enabled {
            self.escrow.insert(
                sequence,
                EscrowEntry {
                    frame: frame.to_vec(),
                    parked_at_ms: now_ms,
                },
            );
            InboundFrame::Parked
        } else {
            self.expected_sequence = sequence.wrapping_add(1);
            InboundFrame::Deliver(frame.to_vec())
        }
    }

    /// Escrow timer (§4.4 step 4): once the head entry has aged past
    /// `escrow_time_ms`, deliver remaining parked frames in sequence
    /// order, counting missing slots as lost.
    pub fn drain_escrow(&mut self, now_ms: u64, escrow_time_ms: u32) -> Vec<Vec<u8>> {
        let should_drain = self
            .escrow
            .values()
            .next()
            .is_some_and(|head| now_ms.saturating_sub(head.parked_at_ms) >= escrow_time_ms as u64);

        if !should_drain {
            return Vec::new();
        }

        let mut delivered = Vec::new();
        let mut last_seq: Option<u32> = None;

        for (seq, entry) in std::mem::take(&mut self.escrow) {
            if let Some(last) = last_seq {
                if seq > last + 1 {
                    self.stats.lost += (seq - last - 1) as u64;
                }
            }

            delivered.push(entry.frame);
            last_seq = Some(seq);
        }

        if let Some(last) = last_seq {
            self.expected_sequence = last.wrapping_add(1);
        }

        delivered
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn escrow_len(&self) -> usize {
        self.escrow.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PerPeerClient {
        PerPeerClient::new("10.0.0.2:1628".parse().unwrap(), 1)
    }

    #[test]
    fn sequence_is_monotonic_per_session() {
        let mut c = client();
        for _ in 0..5 {
            c.accept_outbound(b"x", 0, 0, 0, 1500, false, false, 8, false, false);
        }
        assert_eq!(c.sequence, 5);
    }

    #[test]
    fn stale_frame_is_dropped_before_sequencing() {
        let mut c = client();
        let outcome = c.accept_outbound(b"x", 2000, 0, 0, 1000, false, false, 8, false, false);
        assert!(matches!(outcome, OutboundOutcome::Dropped));
        assert_eq!(c.sequence, 0);
    }

    #[test]
    fn inbound_first_packet_resets_expected_and_delivers() {
        let mut c = client();
        let outcome = c.on_data_frame(1, 10, 0, 0, 1500, true, 0, b"payload");
        assert!(matches!(&outcome, InboundFrame::Deliver(f) if f == b"payload"));
        assert_eq!(c.expected_sequence, 11);
    }

    #[test]
    fn duplicate_sequence_is_counted_and_dropped() {
        let mut c = client();
        c.on_data_frame(1, 10, 0, 0, 1500, true, 0, b"x");
        let outcome = c.on_data_frame(1, 10, 0, 0, 1500, true, 0, b"x");
        assert!(matches!(outcome, InboundFrame::Duplicate));
        assert_eq!(c.stats.duplicates, 1);
    }

    #[test]
    fn out_of_order_parks_then_drains_by_age() {
        let mut c = client();
        c.on_data_frame(1, 10, 0, 0, 1500, true, 0, b"seq10");
        assert!(matches!(
            c.on_data_frame(1, 12, 0, 0, 1500, true, 0, b"seq12"),
            InboundFrame::Parked
        ));
        assert!(matches!(
            c.on_data_frame(1, 11, 0, 0, 1500, true, 0, b"seq11"),
            InboundFrame::Deliver(_)
        ));

        let drained = c.drain_escrow(100, 50);
        assert_eq!(drained, vec![b"seq12".to_vec()]);
        assert_eq!(c.stats.lost, 0);
    }
}
