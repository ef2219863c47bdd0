use std::net::{Ipv4Addr, SocketAddr};

use crate::Error;

pub const MEMBER_TABLE_CAPACITY: usize = 256;

/// Decodes a CHN_MEMBERS control body: a 4-byte dateTime, a 2-byte entry
/// count, then that many (4-byte IPv4, 2-byte port) pairs. Silence on the
/// exact wire layout in the design is resolved by mirroring the persisted
/// address framing used elsewhere in this crate.
pub fn decode_members_body(body: &[u8]) -> Result<(u32, Vec<Member>), Error> {
    if body.len() < 6 {
        return Err(Error::Protocol);
    }

    let date_time = u32::from_be_bytes(body[0..4].try_into().unwrap());
    let count = u16::from_be_bytes(body[4..6].try_into().unwrap()) as usize;

    let mut entries = Vec::with_capacity(count);
    let mut offset = 6;
    for _ in 0..count {
        if body.len() < offset + 6 {
            return Err(Error::Protocol);
        }
        let ip = Ipv4Addr::from(u32::from_be_bytes(body[offset..offset + 4].try_into().unwrap()));
        let port = u16::from_be_bytes(body[offset + 4..offset + 6].try_into().unwrap());
        entries.push(Member {
            address: SocketAddr::from((ip, port)),
            last_update: date_time,
        });
        offset += 6;
    }

    Ok((date_time, entries))
}

/// Encodes a CHN_MEMBERS control body, the inverse of [`decode_members_body`].
/// IPv6 members are skipped; the wire format has no slot for them.
pub fn encode_members_body(date_time: u32, members: &[Member]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + members.len() * 6);
    out.extend_from_slice(&date_time.to_be_bytes());
    out.extend_from_slice(&(members.len() as u16).to_be_bytes());
    for member in members {
        if let SocketAddr::V4(v4) = member.address {
            out.extend_from_slice(&u32::from(*v4.ip()).to_be_bytes());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub address: SocketAddr,
    pub last_update: u32,
}

/// Result of applying a fresh CHN_MEMBERS list (§4.5 membership change
/// algorithm): which member-table indices were added or removed, so the
/// caller can reconcile its per-peer client vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: Vec<usize>,
    pub removed: Vec<usize>,
}

/// Insertion-ordered, capacity-256 membership roster. Exactly one entry is
/// "our index" if we are an active member of the channel.
#[derive(Debug, Default)]
pub struct MemberTable {
    members: Vec<Member>,
    our_index: Option<usize>,
    /// Two members share an IP with differing ports; suppresses the
    /// IP-only NAT disambiguation in the link multiplexer.
    has_shared_ip_addrs: bool,
}

impl MemberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn our_index(&self) -> Option<usize> {
        self.our_index
    }

    pub fn is_active_member(&self) -> bool {
        self.our_index.is_some()
    }

    pub fn has_shared_ip_addrs(&self) -> bool {
        self.has_shared_ip_addrs
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn other_members(&self) -> impl Iterator<Item = (usize, &Member)> {
        let ours = self.our_index;
        self.members
            .iter()
            .enumerate()
            .filter(move |(idx, _)| Some(*idx) != ours)
    }

    /// Applies a freshly received CHN_MEMBERS list, per §4.5:
    /// 1. reject on exact (IP, port) duplicates,
    /// 2. set `has_shared_ip_addrs` on same-IP-different-port pairs,
    /// 3. locate our own index,
    /// 4. diff against the previous roster to report adds/removes.
    pub fn apply_membership(
        &mut self,
        entries: Vec<Member>,
        our_candidates: &[SocketAddr],
    ) -> Result<MembershipChange, Error> {
        if entries.len() > MEMBER_TABLE_CAPACITY {
            return Err(Error::Policy);
        }

        for (i, a) in entries.iter().enumerate() {
            for b in entries.iter().skip(i + 1) {
                if a.address == b.address {
                    return Err(Error::Protocol);
                }
            }
        }

        let has_shared_ip_addrs = entries.iter().enumerate().any(|(i, a)| {
            entries
                .iter()
                .skip(i + 1)
                .any(|b| a.address.ip() == b.address.ip() && a.address.port() != b.address.port())
        });

        let our_index = entries
            .iter()
            .position(|m| our_candidates.contains(&m.address));

        let previous: Vec<SocketAddr> = self.members.iter().map(|m| m.address).collect();
        let next: Vec<SocketAddr> = entries.iter().map(|m| m.address).collect();

        let added = next
            .iter()
            .enumerate()
            .filter(|(_, addr)| !previous.contains(addr))
            .map(|(idx, _)| idx)
            .collect();

        let removed = previous
            .iter()
            .enumerate()
            .filter(|(_, addr)| !next.contains(addr))
            .map(|(idx, _)| idx)
            .collect();

        self.members = entries;
        self.our_index = our_index;
        self.has_shared_ip_addrs = has_shared_ip_addrs;

        Ok(MembershipChange { added, removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_body_round_trips() {
        let members = vec![
            Member { address: addr("10.0.0.1:1628"), last_update: 42 },
            Member { address: addr("10.0.0.2:1629"), last_update: 42 },
        ];

        let body = encode_members_body(42, &members);
        let (date_time, decoded) = decode_members_body(&body).unwrap();

        assert_eq!(date_time, 42);
        assert_eq!(decoded, members);
    }

    #[test]
    fn truncated_members_body_is_rejected() {
        assert_eq!(decode_members_body(&[0, 0, 0, 1, 0, 1]), Err(Error::Protocol));
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn rejects_exact_duplicate_address() {
        let mut table = MemberTable::new();
        let entries = vec![
            Member { address: addr("10.0.0.1:1628"), last_update: 1 },
            Member { address: addr("10.0.0.1:1628"), last_update: 2 },
        ];

        assert_eq!(table.apply_membership(entries, &[]), Err(Error::Protocol));
    }

    #[test]
    fn flags_shared_ip_different_port() {
        let mut table = MemberTable::new();
        let entries = vec![
            Member { address: addr("10.0.0.1:1628"), last_update: 1 },
            Member { address: addr("10.0.0.1:1629"), last_update: 1 },
        ];

        table.apply_membership(entries, &[]).unwrap();
        assert!(table.has_shared_ip_addrs());
    }

    #[test]
    fn finds_our_index_and_reports_adds_removes() {
        let mut table = MemberTable::new();
        let us = addr("10.0.0.1:1628");
        let peer = addr("10.0.0.2:1628");

        let change = table
            .apply_membership(
                vec![
                    Member { address: us, last_update: 1 },
                    Member { address: peer, last_update: 1 },
                ],
                &[us],
            )
            .unwrap();

        assert_eq!(table.our_index(), Some(0));
        assert_eq!(change.added, vec![0, 1]);
        assert!(change.removed.is_empty());

        let change = table
            .apply_membership(vec![Member { address: us, last_update: 2 }], &[us])
            .unwrap();

        assert_eq!(change.added, Vec::<usize>::new());
        assert_eq!(change.removed, vec![1]);
    }

    #[test]
    fn not_a_member_when_our_address_absent() {
        let mut table = MemberTable::new();
        let peer = addr("10.0.0.2:1628");

        table
            .apply_membership(vec![Member { address: peer, last_update: 1 }], &[addr("10.0.0.1:1628")])
            .unwrap();

        assert!(!table.is_active_member());
    }
}
