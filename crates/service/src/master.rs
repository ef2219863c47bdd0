use std::net::SocketAddr;

use ahash::AHashMap;

use crate::client::{ChannelRoutingDescriptor, PerPeerClient};
use crate::config::{BandwidthBudget, ChannelOptions};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::member::{Member, MemberTable};
use crate::stats::ChannelStats;
use crate::Error;

bitflags::bitflags! {
    /// Pending-work bitmask driving the master's worker loop (§4.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Work: u8 {
        const READ_PERSIST      = 0b0000_0001;
        const WRITE_PERSIST     = 0b0000_0010;
        const SEND_CHAN_ROUTING = 0b0000_0100;
        const SEND_DEV_REGISTER = 0b0000_1000;
        const REQUEST_INFO      = 0b0001_0000;
        const SET_LINK          = 0b0010_0000;
    }
}

pub const REQUEST_RETRY_ATTEMPTS: u8 = 3;
pub const REQUEST_RETRY_SPACING_MS: u64 = 2_000;
pub const CHAN_ROUTING_HOLD_DOWN_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolCommitment {
    Unknown,
    Legacy,
    Current,
}

struct PendingRequest {
    attempts_left: u8,
    next_attempt_ms: u64,
}

/// Owns the per-channel worker state: membership, per-peer clients, dispatch
/// index, protocol-version commitment and the pending-work bitmask.
pub struct ChannelMaster {
    pub options: ChannelOptions,
    pub members: MemberTable,
    pub clients: Vec<PerPeerClient>,
    pub dispatcher: Dispatcher,
    pub stats: ChannelStats,
    pub protocol: ProtocolCommitment,
    pub session_id: u32,
    pub our_session: u32,
    work: Work,
    last_chan_routing_ms: u64,
    pending_requests: AHashMap<&'static str, PendingRequest>,
    budget: BandwidthBudget,
    last_members_date_time: u32,
    inbound_segments: segmentor::InboundSegmentor,
    outbound_segments: segmentor::OutboundSegmentor,
}

/// Chooses a fresh session id for a device with no usable persisted state
/// (§6: "a u32 chosen at startup and on local address change").
pub fn random_session_id() -> u32 {
    rand::random()
}

impl ChannelMaster {
    pub fn new(options: ChannelOptions, our_session: u32, now_ms: u64) -> Self {
        Self {
            options,
            members: MemberTable::new(),
            clients: Vec::new(),
            dispatcher: Dispatcher::new(),
            stats: ChannelStats::default(),
            protocol: ProtocolCommitment::Unknown,
            session_id: our_session,
            our_session,
            work: Work::READ_PERSIST,
            last_chan_routing_ms: 0,
            pending_requests: AHashMap::new(),
            budget: BandwidthBudget::new(now_ms),
            last_members_date_time: 0,
            inbound_segments: segmentor::InboundSegmentor::new(),
            outbound_segments: segmentor::OutboundSegmentor::new(),
        }
    }

    /// The in-flight inbound segment reassembly state for this channel.
    pub fn inbound_segments_mut(&mut self) -> &mut segmentor::InboundSegmentor {
        &mut self.inbound_segments
    }

    /// The in-flight outbound segment resend state for this channel.
    pub fn outbound_segments_mut(&mut self) -> &mut segmentor::OutboundSegmentor {
        &mut self.outbound_segments
    }

    pub fn work(&self) -> Work {
        self.work
    }

    pub fn schedule(&mut self, work: Work) {
        self.work |= work;
    }

    pub fn clear(&mut self, work: Work) {
        self.work -= work;
    }

    pub fn commit_protocol(&mut self, commitment: ProtocolCommitment) {
        self.protocol = commitment;
    }

    pub fn uses_extended_header(&self) -> bool {
        self.protocol == ProtocolCommitment::Current
    }

    /// Applies a fresh CHN_MEMBERS packet if its dateTime supersedes the
    /// stored one (§4.5 membership change algorithm). Reconciles the client
    /// vector: existing members keep their client, new ones get a fresh
    /// `Idle` client, departed ones are stopped and dropped.
    pub fn apply_members(
        &mut self,
        entries: Vec<Member>,
        date_time: u32,
        our_candidates: &[SocketAddr],
        now_ms: u64,
    ) -> Result<(), Error> {
        if date_time <= self.last_members_date_time && self.last_members_date_time != 0 {
            return Err(Error::Protocol);
        }

        let addresses: Vec<SocketAddr> = entries.iter().map(|m| m.address).collect();
        let previous_addresses: Vec<SocketAddr> = self.members.members().iter().map(|m| m.address).collect();
        let change = self.members.apply_membership(entries, our_candidates)?;
        self.last_members_date_time = date_time;

        let removed_addresses: Vec<SocketAddr> = change
            .removed
            .iter()
            .filter_map(|&idx| previous_addresses.get(idx).copied())
            .collect();

        for client in self.clients.iter_mut() {
            if removed_addresses.contains(&client.peer) {
                client.stop();
            }
        }
        self.clients.retain(|c| !removed_addresses.contains(&c.peer));

        for &idx in &change.added {
            if Some(idx) == self.members.our_index() {
                continue;
            }
            if let Some(addr) = addresses.get(idx) {
                if !self.clients.iter().any(|c| c.peer == *addr) {
                    // The one receive socket is already bound by the time the
                    // channel master exists, so a freshly added member goes
                    // straight from Idle to Bound (§4.4's "first successful
                    // socket bind" transition).
                    let mut client = PerPeerClient::new(*addr, self.our_session);
                    client.mark_bound();
                    self.clients.push(client);
                }
            }
        }

        let indexed: Vec<(usize, SocketAddr)> = self
            .clients
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.peer))
            .collect();
        self.dispatcher.rebuild(&indexed);

        self.schedule(Work::SET_LINK);
        Ok(())
    }

    pub fn client_mut(&mut self, peer: SocketAddr) -> Option<&mut PerPeerClient> {
        self.clients.iter_mut().find(|c| c.peer == peer)
    }

    /// Resolves an inbound datagram's source to its owning client through
    /// the dispatcher's 7-step fallback chain (§4.3), learning an IP-only
    /// NAT port override into the alt-port cache when that step fires.
    pub fn resolve_client_mut(
        &mut self,
        observed: SocketAddr,
        is_data: bool,
        now_ms: u64,
    ) -> Option<&mut PerPeerClient> {
        let has_shared_ip_addrs = self.members.has_shared_ip_addrs();
        let outcome = self.dispatcher.resolve(observed, false, None, None, None, has_shared_ip_addrs, now_ms);

        let idx = match outcome {
            DispatchOutcome::Direct(idx)
            | DispatchOutcome::ExtendedHeader(idx)
            | DispatchOutcome::AltPortCached(idx)
            | DispatchOutcome::VendorDeviceId(idx) => Some(idx),
            DispatchOutcome::IpOnly(idx) if is_data => {
                self.dispatcher.learn_alt_port(observed, idx, now_ms);
                Some(idx)
            }
            _ => None,
        }?;

        self.clients.get_mut(idx)
    }

    pub fn update_routing(&mut self, peer: SocketAddr, routing: ChannelRoutingDescriptor) {
        if let Some(client) = self.client_mut(peer) {
            client.routing = Some(routing);
        }
    }

    /// Whether a channel-routing retransmit is allowed right now, given the
    /// 100ms hold-down since the last one.
    pub fn chan_routing_ready(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_chan_routing_ms) >= CHAN_ROUTING_HOLD_DOWN_MS
    }

    pub fn mark_chan_routing_sent(&mut self, now_ms: u64) {
        self.last_chan_routing_ms = now_ms;
        self.clear(Work::SEND_CHAN_ROUTING);
    }

    /// Registers a request needing retry tracking (CHAN_MEMBERS,
    /// CHAN_ROUTING, DEV_RESPONSE, CS_TYPE), per the 3-attempt/2s budget.
    pub fn start_request(&mut self, name: &'static str, now_ms: u64) {
        self.pending_requests.insert(
            name,
            PendingRequest {
                attempts_left: REQUEST_RETRY_ATTEMPTS,
                next_attempt_ms: now_ms,
            },
        );
    }

    pub fn complete_request(&mut self, name: &str) {
        self.pending_requests.remove(name);
    }

    /// Returns the names of requests due for a retry right now, consuming
    /// one attempt each; exhausted requests are dropped silently.
    pub fn due_requests(&mut self, now_ms: u64) -> Vec<&'static str> {
        let mut due = Vec::new();
        self.pending_requests.retain(|name, pending| {
            if pending.attempts_left == 0 {
                return false;
            }
            if now_ms >= pending.next_attempt_ms {
                pending.attempts_left -= 1;
                pending.next_attempt_ms = now_ms + REQUEST_RETRY_SPACING_MS;
                due.push(*name);
            }
            pending.attempts_left > 0 || now_ms < pending.next_attempt_ms
        });
        due
    }

    pub fn budget_mut(&mut self) -> &mut BandwidthBudget {
        &mut self.budget
    }

    /// Disjoint borrows of the client vector and the send budget, so a
    /// caller can drive `PerPeerClient::drain_ready` for every client
    /// against the one shared budget without re-borrowing `self`.
    pub fn clients_and_budget_mut(&mut self) -> (&mut [PerPeerClient], &mut BandwidthBudget) {
        (&mut self.clients, &mut self.budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn apply_members_creates_and_stops_clients() {
        let mut master = ChannelMaster::new(ChannelOptions::default(), 1, 0);
        let us = addr("10.0.0.1:1628");
        let peer = addr("10.0.0.2:1628");

        master
            .apply_members(
                vec![
                    Member { address: us, last_update: 1 },
                    Member { address: peer, last_update: 1 },
                ],
                1,
                &[us],
                0,
            )
            .unwrap();

        assert_eq!(master.clients.len(), 1);
        assert_eq!(master.clients[0].peer, peer);

        master
            .apply_members(vec![Member { address: us, last_update: 2 }], 2, &[us], 0)
            .unwrap();

        assert!(master.clients.is_empty());
    }

    #[test]
    fn stale_date_time_is_rejected() {
        let mut master = ChannelMaster::new(ChannelOptions::default(), 1, 0);
        let us = addr("10.0.0.1:1628");

        master
            .apply_members(vec![Member { address: us, last_update: 1 }], 5, &[us], 0)
            .unwrap();

        let result = master.apply_members(vec![Member { address: us, last_update: 1 }], 3, &[us], 0);
        assert_eq!(result, Err(Error::Protocol));
    }

    #[test]
    fn request_retry_budget_is_exhausted_after_three_attempts() {
        let mut master = ChannelMaster::new(ChannelOptions::default(), 1, 0);
        master.start_request("chan_members", 0);

        let mut now = 0u64;
        let mut total = 0;
        for _ in 0..5 {
            total += master.due_requests(now).len();
            now += REQUEST_RETRY_SPACING_MS;
        }

        assert_eq!(total, REQUEST_RETRY_ATTEMPTS as usize);
    }

    #[test]
    fn chan_routing_hold_down_blocks_immediate_retransmit() {
        let mut master = ChannelMaster::new(ChannelOptions::default(), 1, 0);
        master.mark_chan_routing_sent(0);

        assert!(!master.chan_routing_ready(50));
        assert!(master.chan_routing_ready(100));
    }
}
