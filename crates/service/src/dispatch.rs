use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ahash::AHashMap;

/// How long a learned alt-port mapping stays trusted before the dispatcher
/// falls back to a fresh lookup (§4.3's "five minute" cache lifetime).
pub const ALT_PORT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Exact (ip, port) match against a known member.
    Direct(usize),
    /// Resolved via the sender's extended-header declared address.
    ExtendedHeader(usize),
    /// Resolved via a previously learned alt-port mapping.
    AltPortCached(usize),
    /// Exactly one member shares this source IP; port changed under NAT.
    IpOnly(usize),
    /// A vendor device-id frame identified the sender by neuron id, not address.
    VendorDeviceId(usize),
    /// No member recognized; hand to the diagnostic/unknown path.
    Unknown,
}

struct AltPortEntry {
    member: usize,
    learned_at_ms: u64,
}

/// Dispatches inbound datagrams to a member-table index by source address,
/// tolerating NAT port rewriting (§4.3 link multiplexer).
#[derive(Default)]
pub struct Dispatcher {
    by_address: AHashMap<SocketAddr, usize>,
    by_ip: AHashMap<IpAddr, Vec<usize>>,
    alt_port: AHashMap<SocketAddr, AltPortEntry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&mut self, members: &[(usize, SocketAddr)]) {
        self.by_address.clear();
        self.by_ip.clear();

        for &(idx, addr) in members {
            self.by_address.insert(addr, idx);
            self.by_ip.entry(addr.ip()).or_default().push(idx);
        }
    }

    pub fn learn_alt_port(&mut self, observed: SocketAddr, member: usize, now_ms: u64) {
        self.alt_port.insert(
            observed,
            AltPortEntry {
                member,
                learned_at_ms: now_ms,
            },
        );
    }

    fn alt_port_hit(&self, observed: SocketAddr, now_ms: u64) -> Option<usize> {
        let entry = self.alt_port.get(&observed)?;
        if now_ms.saturating_sub(entry.learned_at_ms) > ALT_PORT_CACHE_TTL.as_millis() as u64 {
            return None;
        }
        Some(entry.member)
    }

    /// Resolves the source of an inbound datagram to a member index,
    /// following the ordered fallback chain from multicast dispatch down
    /// to the unknown/diagnostic path.
    pub fn resolve(
        &mut self,
        observed: SocketAddr,
        is_multicast_delivery: bool,
        multicast_member: Option<usize>,
        extended_header_member: Option<usize>,
        vendor_device_id_member: Option<usize>,
        has_shared_ip_addrs: bool,
        now_ms: u64,
    ) -> DispatchOutcome {
        if is_multicast_delivery {
            if let Some(idx) = multicast_member {
                return DispatchOutcome::Direct(idx);
            }
        }

        if let Some(&idx) = self.by_address.get(&observed) {
            self.alt_port.retain(|_, entry| entry.member != idx);
            return DispatchOutcome::Direct(idx);
        }

        if let Some(idx) = extended_header_member {
            return DispatchOutcome::ExtendedHeader(idx);
        }

        if let Some(idx) = self.alt_port_hit(observed, now_ms) {
            return DispatchOutcome::AltPortCached(idx);
        }

        if !has_shared_ip_addrs {
            if let Some(candidates) = self.by_ip.get(&observed.ip()) {
                if candidates.len() == 1 {
                    return DispatchOutcome::IpOnly(candidates[0]);
                }
            }
        }

        if let Some(idx) = vendor_device_id_member {
            return DispatchOutcome::VendorDeviceId(idx);
        }

        DispatchOutcome::Unknown
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn direct_hit_wins_over_everything_else() {
        let mut d = Dispatcher::new();
        d.rebuild(&[(0, addr("10.0.0.1:1628"))]);

        let outcome = d.resolve(addr("10.0.0.1:1628"), false, None, Some(9), None, false, 0);
        assert_eq!(outcome, DispatchOutcome::Direct(0));
    }

    #[test]
    fn alt_port_cache_expires_after_ttl() {
        let mut d = Dispatcher::new();
        d.learn_alt_port(addr("10.0.0.5:9000"), 3, 0);

        let fresh = d.resolve(addr("10.0.0.5:9000"), false, None, None, None, false, 1000);
        assert_eq!(fresh, DispatchOutcome::AltPortCached(3));

        let stale = d.resolve(
            addr("10.0.0.5:9000"),
            false,
            None,
            None,
            None,
            false,
            ALT_PORT_CACHE_TTL.as_millis() as u64 + 1001,
        );
        assert_eq!(stale, DispatchOutcome::Unknown);
    }

    #[test]
    fn ip_only_disambiguation_requires_single_candidate() {
        let mut d = Dispatcher::new();
        d.rebuild(&[(0, addr("10.0.0.1:1628")), (1, addr("10.0.0.1:1629"))]);

        let ambiguous = d.resolve(addr("10.0.0.1:5555"), false, None, None, None, true, 0);
        assert_eq!(ambiguous, DispatchOutcome::Unknown);

        let mut single = Dispatcher::new();
        single.rebuild(&[(0, addr("10.0.0.1:1628"))]);
        let outcome = single.resolve(addr("10.0.0.1:5555"), false, None, None, None, false, 0);
        assert_eq!(outcome, DispatchOutcome::IpOnly(0));
    }
}
