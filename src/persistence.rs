use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use service::{ChannelOptions, ChannelRoutingDescriptor, Member, RouterType};

const MAGIC: u32 = 0x4c54_4950; // "LTIP"
const VERSION: u8 = 1;

/// One versioned, length-prefixed persistence record (§4.5/§6). Unknown
/// trailing bytes from a newer writer are preserved verbatim so an older
/// reader round-trips them without understanding their meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState {
    pub session_id: u32,
    pub date_time: u32,
    pub local_addr: SocketAddr,
    pub cs_addr: Option<SocketAddr>,
    pub ntp_servers: Vec<SocketAddr>,
    pub nat_address: Option<Ipv4Addr>,
    pub protocol_committed: Option<bool>,
    pub options: ChannelOptions,
    /// The membership roster as of `date_time`, restored into the member
    /// table on startup (§4.5's READ_PERSIST: "populate config and member
    /// table").
    pub members: Vec<Member>,
    /// Per-peer channel-routing descriptors, keyed by peer address.
    pub routing: Vec<(SocketAddr, ChannelRoutingDescriptor)>,
    /// Bytes this writer did not recognize on load; re-emitted unchanged.
    pub unknown_tail: Vec<u8>,
}

fn put_members(out: &mut Vec<u8>, members: &[Member]) {
    out.extend_from_slice(&(members.len() as u16).to_be_bytes());
    for member in members {
        put_addr(out, Some(member.address));
        out.extend_from_slice(&member.last_update.to_be_bytes());
    }
}

fn get_members(bytes: &[u8], pos: &mut usize) -> Option<Vec<Member>> {
    let count = u16::from_be_bytes(bytes.get(*pos..*pos + 2)?.try_into().ok()?);
    *pos += 2;

    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let address = get_addr(bytes, pos)?;
        let last_update = u32::from_be_bytes(bytes.get(*pos..*pos + 4)?.try_into().ok()?);
        *pos += 4;
        members.push(Member { address, last_update });
    }

    Some(members)
}

fn router_type_tag(router_type: Option<RouterType>) -> u8 {
    match router_type {
        None => 0,
        Some(RouterType::Router) => 1,
        Some(RouterType::Node) => 2,
        Some(RouterType::Proxy) => 3,
        Some(RouterType::IpRouter) => 4,
    }
}

fn router_type_from_tag(tag: u8) -> Option<RouterType> {
    match tag {
        1 => Some(RouterType::Router),
        2 => Some(RouterType::Node),
        3 => Some(RouterType::Proxy),
        4 => Some(RouterType::IpRouter),
        _ => None,
    }
}

fn put_routing(out: &mut Vec<u8>, routing: &[(SocketAddr, ChannelRoutingDescriptor)]) {
    out.push(routing.len().min(255) as u8);
    for (addr, descriptor) in routing.iter().take(255) {
        put_addr(out, Some(*addr));

        let domains_len = descriptor.domains.len().min(255);
        out.push(domains_len as u8);
        out.extend_from_slice(&descriptor.domains[..domains_len]);

        let subnet_nodes_len = descriptor.subnet_nodes.len().min(255);
        out.push(subnet_nodes_len as u8);
        for &(subnet, node) in descriptor.subnet_nodes.iter().take(subnet_nodes_len) {
            out.push(subnet);
            out.push(node);
        }

        let neuron_ids_len = descriptor.neuron_ids.len().min(255);
        out.push(neuron_ids_len as u8);
        for id in descriptor.neuron_ids.iter().take(neuron_ids_len) {
            out.extend_from_slice(id);
        }

        out.push(router_type_tag(descriptor.router_type));
    }
}

fn get_routing(bytes: &[u8], pos: &mut usize) -> Option<Vec<(SocketAddr, ChannelRoutingDescriptor)>> {
    let count = *bytes.get(*pos)?;
    *pos += 1;

    let mut routing = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let addr = get_addr(bytes, pos)?;

        let domains_len = *bytes.get(*pos)? as usize;
        *pos += 1;
        let domains = bytes.get(*pos..*pos + domains_len)?.to_vec();
        *pos += domains_len;

        let subnet_nodes_len = *bytes.get(*pos)? as usize;
        *pos += 1;
        let mut subnet_nodes = Vec::with_capacity(subnet_nodes_len);
        for _ in 0..subnet_nodes_len {
            let subnet = *bytes.get(*pos)?;
            let node = *bytes.get(*pos + 1)?;
            *pos += 2;
            subnet_nodes.push((subnet, node));
        }

        let neuron_ids_len = *bytes.get(*pos)? as usize;
        *pos += 1;
        let mut neuron_ids = Vec::with_capacity(neuron_ids_len);
        for _ in 0..neuron_ids_len {
            let id: [u8; 6] = bytes.get(*pos..*pos + 6)?.try_into().ok()?;
            *pos += 6;
            neuron_ids.push(id);
        }

        let router_type = router_type_from_tag(*bytes.get(*pos)?);
        *pos += 1;

        routing.push((
            addr,
            ChannelRoutingDescriptor {
                domains,
                subnet_nodes,
                neuron_ids,
                router_type,
            },
        ));
    }

    Some(routing)
}

fn put_addr(out: &mut Vec<u8>, addr: Option<SocketAddr>) {
    match addr {
        Some(SocketAddr::V4(a)) => {
            out.push(1);
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
        _ => out.push(0),
    }
}

fn get_addr(bytes: &[u8], pos: &mut usize) -> Option<SocketAddr> {
    let present = bytes[*pos];
    *pos += 1;
    if present == 0 {
        return None;
    }
    let ip = Ipv4Addr::new(bytes[*pos], bytes[*pos + 1], bytes[*pos + 2], bytes[*pos + 3]);
    let port = u16::from_be_bytes(bytes[*pos + 4..*pos + 6].try_into().unwrap());
    *pos += 6;
    Some(SocketAddr::new(ip.into(), port))
}

impl PersistedState {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.session_id.to_be_bytes());
        body.extend_from_slice(&self.date_time.to_be_bytes());
        put_addr(&mut body, Some(self.local_addr));
        put_addr(&mut body, self.cs_addr);

        body.push(self.ntp_servers.len().min(2) as u8);
        for addr in self.ntp_servers.iter().take(2) {
            put_addr(&mut body, Some(*addr));
        }

        match self.nat_address {
            Some(ip) => {
                body.push(1);
                body.extend_from_slice(&ip.octets());
            }
            None => body.push(0),
        }

        body.push(match self.protocol_committed {
            None => 0,
            Some(false) => 1,
            Some(true) => 2,
        });

        body.push(self.options.aggregate as u8);
        body.extend_from_slice(&self.options.aggregate_window_ms.to_be_bytes());
        body.push(self.options.bw_limit as u8);
        body.extend_from_slice(&self.options.bw_limit_kb_per_sec.to_be_bytes());
        body.push(self.options.reorder as u8);
        body.extend_from_slice(&self.options.reorder_escrow_ms.to_be_bytes());
        body.extend_from_slice(&self.options.channel_timeout_ms.to_be_bytes());
        body.push(self.options.staleness_check as u8);
        body.push(self.options.use_tos as u8);
        body.push(self.options.tos_bits);
        body.push(self.options.authenticate as u8);
        body.push(self.options.eia852_strict as u8);
        body.extend_from_slice(&self.options.secret);

        let name_bytes = self.options.device_name.as_bytes();
        let name_len = name_bytes.len().min(128);
        body.push(name_len as u8);
        body.extend_from_slice(&name_bytes[..name_len]);

        put_members(&mut body, &self.members);
        put_routing(&mut body, &self.routing);

        body.extend_from_slice(&self.unknown_tail);

        let mut out = Vec::with_capacity(body.len() + 9);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(VERSION);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parses a persistence file. A missing or malformed file is not an
    /// error: the caller gets `Ok(None)` and treats the device as fresh
    /// with empty membership, per §4.5's failure semantics.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 9 {
            return None;
        }
        if u32::from_be_bytes(bytes[0..4].try_into().unwrap()) != MAGIC {
            return None;
        }
        let _version = bytes[4];
        let len = u32::from_be_bytes(bytes[5..9].try_into().unwrap()) as usize;
        let body = bytes.get(9..9 + len)?;

        let mut pos = 0;
        let session_id = u32::from_be_bytes(body.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;
        let date_time = u32::from_be_bytes(body.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;
        let local_addr = get_addr(body, &mut pos)?;
        let cs_addr = get_addr(body, &mut pos);

        let ntp_count = *body.get(pos)?;
        pos += 1;
        let mut ntp_servers = Vec::new();
        for _ in 0..ntp_count.min(2) {
            if let Some(addr) = get_addr(body, &mut pos) {
                ntp_servers.push(addr);
            }
        }

        let nat_present = *body.get(pos)?;
        pos += 1;
        let nat_address = if nat_present == 1 {
            let ip = Ipv4Addr::new(
                *body.get(pos)?,
                *body.get(pos + 1)?,
                *body.get(pos + 2)?,
                *body.get(pos + 3)?,
            );
            pos += 4;
            Some(ip)
        } else {
            None
        };

        let protocol_committed = match *body.get(pos)? {
            1 => Some(false),
            2 => Some(true),
            _ => None,
        };
        pos += 1;

        let mut options = ChannelOptions::default();
        options.aggregate = *body.get(pos)? != 0;
        pos += 1;
        options.aggregate_window_ms = u32::from_be_bytes(body.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;
        options.bw_limit = *body.get(pos)? != 0;
        pos += 1;
        options.bw_limit_kb_per_sec = u32::from_be_bytes(body.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;
        options.reorder = *body.get(pos)? != 0;
        pos += 1;
        options.reorder_escrow_ms = u32::from_be_bytes(body.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;
        options.channel_timeout_ms = u32::from_be_bytes(body.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;
        options.staleness_check = *body.get(pos)? != 0;
        pos += 1;
        options.use_tos = *body.get(pos)? != 0;
        pos += 1;
        options.tos_bits = *body.get(pos)?;
        pos += 1;
        options.authenticate = *body.get(pos)? != 0;
        pos += 1;
        options.eia852_strict = *body.get(pos)? != 0;
        pos += 1;
        options.secret.copy_from_slice(body.get(pos..pos + 16)?);
        pos += 16;

        let name_len = *body.get(pos)? as usize;
        pos += 1;
        options.device_name = String::from_utf8_lossy(body.get(pos..pos + name_len)?).into_owned();
        pos += name_len;

        let members = get_members(body, &mut pos)?;
        let routing = get_routing(body, &mut pos)?;

        let unknown_tail = body.get(pos..).unwrap_or(&[]).to_vec();

        Some(Self {
            session_id,
            date_time,
            local_addr,
            cs_addr,
            ntp_servers,
            nat_address,
            protocol_committed,
            options,
            members,
            routing,
            unknown_tail,
        })
    }

    pub fn load(path: &Path) -> io::Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Self::decode(&bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedState {
        PersistedState {
            session_id: 7,
            date_time: 123,
            local_addr: "10.0.0.1:1628".parse().unwrap(),
            cs_addr: Some("10.0.0.9:1629".parse().unwrap()),
            ntp_servers: vec!["10.0.0.8:123".parse().unwrap()],
            nat_address: Some(Ipv4Addr::new(203, 0, 113, 4)),
            protocol_committed: Some(true),
            options: ChannelOptions::default(),
            members: vec![
                Member { address: "10.0.0.1:1628".parse().unwrap(), last_update: 123 },
                Member { address: "10.0.0.2:1628".parse().unwrap(), last_update: 123 },
            ],
            routing: vec![(
                "10.0.0.2:1628".parse().unwrap(),
                ChannelRoutingDescriptor {
                    domains: vec![1, 2, 3],
                    subnet_nodes: vec![(1, 5)],
                    neuron_ids: vec![[0, 1, 2, 3, 4, 5]],
                    router_type: Some(RouterType::Router),
                },
            )],
            unknown_tail: Vec::new(),
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let state = sample();
        let decoded = PersistedState::decode(&state.encode()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn malformed_bytes_decode_to_none() {
        assert!(PersistedState::decode(&[0u8; 4]).is_none());
    }

    #[test]
    fn unknown_trailing_bytes_round_trip_unchanged() {
        let mut state = sample();
        state.unknown_tail = vec![0xde, 0xad, 0xbe, 0xef];

        let decoded = PersistedState::decode(&state.encode()).unwrap();
        assert_eq!(decoded.unknown_tail, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn empty_members_and_routing_round_trip() {
        let mut state = sample();
        state.members.clear();
        state.routing.clear();

        let decoded = PersistedState::decode(&state.encode()).unwrap();
        assert!(decoded.members.is_empty());
        assert!(decoded.routing.is_empty());
    }
}
