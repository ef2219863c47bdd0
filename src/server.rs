use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};

use codec::header::{Header, PacketType, ProtocolVersion};
use codec::packet::{Packet, RequestFrame, SegmentFrame, REASON_REQUEST_ALL};
use service::{ChannelMaster, ProtocolCommitment, Stat};

use crate::config::Config;
use crate::observer::Observer;
use crate::persistence::PersistedState;
use crate::statistics::Statistics;

const UDP_RECV_TIMEOUT: Duration = Duration::from_secs(10);
const AGGREGATE_TICK: Duration = Duration::from_millis(20);
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(16);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The five long-lived workers' join handles plus the signal that tells
/// them to unwind (§5 cancellation discipline).
pub struct Workers {
    stopping_tx: watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Workers {
    /// Sets the stopping flag, then waits for every worker to notice and
    /// unwind. The persistence writer drains its queue before exiting.
    pub async fn shutdown(self) {
        let _ = self.stopping_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Starts the five long-lived workers for one channel master (§5): the
/// receive worker, the aggregation/BW timer, the request-retry timer and
/// the persistence writer.
pub async fn run(config: Arc<Config>, statistics: Statistics, observer: Arc<Observer>) -> anyhow::Result<Workers> {
    let socket = Arc::new(UdpSocket::bind(config.net.listen).await?);
    log::info!("lonip channel listening: addr={}", config.net.listen);

    let persistence_path = PathBuf::from(&config.persistence_path);
    let loaded = PersistedState::load(&persistence_path).unwrap_or(None);

    let options = loaded
        .as_ref()
        .map(|s| s.options.clone())
        .unwrap_or_else(|| config.channel.clone());

    let mut our_candidates = vec![config.net.listen];
    if let Some(nat_ip) = options.nat_address {
        our_candidates.push(SocketAddr::new(nat_ip.into(), config.net.listen.port()));
    }
    let our_candidates = Arc::new(our_candidates);

    // A session id is reused from persisted state only if the local address
    // it was recorded against still matches; otherwise a fresh one is
    // chosen, per §6 ("a u32 chosen at startup and on local address change").
    let our_session = match &loaded {
        Some(state) if state.local_addr == config.net.listen => state.session_id,
        _ => service::random_session_id(),
    };

    let mut master_state = ChannelMaster::new(options, our_session, now_ms());
    if let Some(state) = &loaded {
        if !state.members.is_empty() {
            match master_state.apply_members(state.members.clone(), state.date_time, &our_candidates, now_ms()) {
                Ok(()) => {
                    for (peer, routing) in state.routing.clone() {
                        master_state.update_routing(peer, routing);
                    }
                }
                Err(e) => log::warn!("failed to restore persisted membership: {e}"),
            }
        }
        if let Some(current) = state.protocol_committed {
            master_state.commit_protocol(if current { ProtocolCommitment::Current } else { ProtocolCommitment::Legacy });
        }
    }
    let master = Arc::new(RwLock::new(master_state));

    let (stopping_tx, stopping_rx) = watch::channel(false);
    let (persist_tx, persist_rx) = mpsc::channel::<Vec<u8>>(8);

    let mut handles = Vec::new();
    handles.push(tokio::spawn(persistence_writer(
        persist_rx,
        persistence_path,
        stopping_rx.clone(),
    )));
    handles.push(tokio::spawn(aggregation_timer(
        master.clone(),
        socket.clone(),
        statistics.clone(),
        observer.clone(),
        stopping_rx.clone(),
    )));
    handles.push(tokio::spawn(request_retry_timer(
        master.clone(),
        socket.clone(),
        stopping_rx.clone(),
    )));
    handles.push(tokio::spawn(receive_worker(
        socket,
        master,
        statistics,
        observer,
        persist_tx,
        our_candidates,
        stopping_rx,
    )));

    Ok(Workers { stopping_tx, handles })
}

async fn receive_worker(
    socket: Arc<UdpSocket>,
    master: Arc<RwLock<ChannelMaster>>,
    statistics: Statistics,
    observer: Arc<Observer>,
    persist_tx: mpsc::Sender<Vec<u8>>,
    our_candidates: Arc<Vec<SocketAddr>>,
    mut stopping: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 2048];

    loop {
        let recv = tokio::time::timeout(UDP_RECV_TIMEOUT, socket.recv_from(&mut buf));

        tokio::select! {
            result = recv => {
                match result {
                    Ok(Ok((size, addr))) => {
                        handle_datagram(
                            &master,
                            &statistics,
                            &observer,
                            &persist_tx,
                            &our_candidates,
                            addr,
                            &buf[..size],
                        )
                        .await
                    }
                    Ok(Err(e)) => {
                        log::warn!("recv_from failed: {e}");
                    }
                    Err(_) => {}
                }
            }
            _ = stopping.changed() => {
                if *stopping.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("receive worker stopped");
}

/// Validates the trailing keyed digest on an authenticated datagram. `body`
/// is the frame's bytes up to (not including) the digest.
fn auth_ok(options: &service::ChannelOptions, body: &[u8], digest: Option<&[u8]>) -> bool {
    if !options.authenticate {
        return true;
    }
    match digest.and_then(|d| <[u8; 16]>::try_from(d).ok()) {
        Some(digest) => codec::crypto::verify(&options.secret, body, &digest),
        None => false,
    }
}

async fn handle_datagram(
    master: &Arc<RwLock<ChannelMaster>>,
    statistics: &Statistics,
    observer: &Arc<Observer>,
    persist_tx: &mpsc::Sender<Vec<u8>>,
    our_candidates: &Arc<Vec<SocketAddr>>,
    addr: SocketAddr,
    mut data: &[u8],
) {
    let reporter = statistics.get_reporter();
    reporter.send(&addr, &[Stat::ReceivedFrames(1)]);

    let now = now_ms();
    let mut reply_sequences = Vec::new();

    while !data.is_empty() {
        let (packet, consumed) = match Packet::decode(data) {
            Ok(parsed) => parsed,
            Err(_) => {
                reporter.send(&addr, &[Stat::DroppedFrames(1)]);
                break;
            }
        };

        let header = packet.header();
        if header.auth_flag {
            let body_len = header.packet_size as usize;
            let digest = data.get(body_len..body_len + 16);
            let options_secret_ok = {
                let guard = master.read();
                auth_ok(&guard.options, &data[..body_len], digest)
            };
            if !options_secret_ok {
                observer.auth_failure(&addr);
                reporter.send(&addr, &[Stat::AuthFailures(1)]);
                data = &data[consumed..];
                continue;
            }
        }

        match &packet {
            Packet::Data(frame) => {
                if !frame.crc_ok {
                    reporter.send(&addr, &[Stat::DroppedFrames(1)]);
                    data = &data[consumed..];
                    continue;
                }

                let outcome = {
                    let mut guard = master.write();
                    let channel_timeout_ms = guard.options.channel_timeout_ms;
                    let reorder = guard.options.reorder;

                    guard.resolve_client_mut(addr, true, now).map(|client| {
                        client.on_data_frame(
                            frame.header.session,
                            frame.header.sequence,
                            frame.header.timestamp,
                            now as u32,
                            channel_timeout_ms,
                            reorder,
                            now,
                            frame.frame,
                        )
                    })
                };

                match outcome {
                    Some(service::InboundFrame::Deliver(bytes)) => {
                        reporter.send(&addr, &[Stat::ReceivedFrames(1)]);
                        observer.frame_delivered(&addr, &bytes);
                    }
                    Some(service::InboundFrame::Duplicate) => {
                        reporter.send(&addr, &[Stat::DuplicateFrames(1)]);
                    }
                    _ => {}
                }
            }
            Packet::Response(resp) => {
                reply_sequences.push(resp.request_id);
            }
            Packet::Control(frame) if frame.header.packet_type == PacketType::ChnMembers => {
                handle_chn_members(master, observer, persist_tx, our_candidates, frame.body, frame.header.version, now).await;
            }
            Packet::Control(_) => {
                log::debug!("unhandled control packet: type={:?} from={addr}", header.packet_type);
            }
            Packet::Segment(frame) => {
                let assembled = {
                    let mut guard = master.write();
                    guard.inbound_segments_mut().on_segment(
                        addr,
                        frame.request_id,
                        frame.segment_id,
                        frame.date_time,
                        frame.flags,
                        frame.payload,
                        now,
                    )
                };
                // Reassembled control packets are only meaningful here as a
                // CHN_MEMBERS list (the only control body this router
                // currently interprets); see DESIGN.md.
                if let segmentor::InboundOutcome::Assembled(body) = assembled {
                    handle_chn_members(master, observer, persist_tx, our_candidates, &body, frame.header.version, now).await;
                }
            }
            _ => {}
        }

        data = &data[consumed..];
    }

    if !reply_sequences.is_empty() {
        log::debug!("pending response request ids from {addr}: {reply_sequences:?}");
    }
}

/// Applies a CHN_MEMBERS control packet (§4.5 membership change algorithm),
/// reconciling the client vector, logging the roster delta through the
/// observer and persisting the new membership snapshot.
async fn handle_chn_members(
    master: &Arc<RwLock<ChannelMaster>>,
    observer: &Arc<Observer>,
    persist_tx: &mpsc::Sender<Vec<u8>>,
    our_candidates: &Arc<Vec<SocketAddr>>,
    body: &[u8],
    version: ProtocolVersion,
    now: u64,
) {
    let (date_time, entries) = match service::decode_members_body(body) {
        Ok(parsed) => parsed,
        Err(_) => return,
    };

    let before: Vec<SocketAddr> = {
        let guard = master.read();
        guard.members.members().iter().map(|m| m.address).collect()
    };

    let (applied, session_id, options, is_active_member, committed_now, protocol_committed, members_snapshot, routing_snapshot) = {
        let mut guard = master.write();
        let applied = guard.apply_members(entries, date_time, our_candidates, now).is_ok();

        // The first CHN_MEMBERS a device receives also settles which
        // protocol generation the channel speaks (§4.3's version commitment).
        let committed_now = if applied && guard.protocol == ProtocolCommitment::Unknown {
            let commitment = match version {
                ProtocolVersion::Current => ProtocolCommitment::Current,
                ProtocolVersion::Legacy => ProtocolCommitment::Legacy,
            };
            guard.commit_protocol(commitment);
            Some(commitment == ProtocolCommitment::Current)
        } else {
            None
        };

        let protocol_committed = match guard.protocol {
            ProtocolCommitment::Unknown => None,
            ProtocolCommitment::Legacy => Some(false),
            ProtocolCommitment::Current => Some(true),
        };

        let routing_snapshot: Vec<(SocketAddr, _)> = guard
            .clients
            .iter()
            .filter_map(|c| c.routing.clone().map(|r| (c.peer, r)))
            .collect();

        (
            applied,
            guard.session_id,
            guard.options.clone(),
            guard.members.is_active_member(),
            committed_now,
            protocol_committed,
            guard.members.members().to_vec(),
            routing_snapshot,
        )
    };

    if !applied {
        return;
    }

    if let Some(current) = committed_now {
        observer.protocol_committed(current);
    }

    let after: Vec<SocketAddr> = {
        let guard = master.read();
        guard.members.members().iter().map(|m| m.address).collect()
    };

    for addr in after.iter().filter(|a| !before.contains(a)) {
        observer.member_added(addr);
        if !our_candidates.contains(addr) {
            observer.client_bound(addr);
        }
    }
    for addr in before.iter().filter(|a| !after.contains(a)) {
        observer.member_removed(addr);
        observer.client_stopped(addr);
    }

    log::info!("channel membership applied: date_time={date_time} active_member={is_active_member}");

    let state = crate::persistence::PersistedState {
        session_id,
        date_time,
        local_addr: our_candidates[0],
        cs_addr: None,
        ntp_servers: options.ntp_servers.clone(),
        nat_address: options.nat_address,
        protocol_committed,
        options,
        members: members_snapshot,
        routing: routing_snapshot,
        unknown_tail: Vec::new(),
    };
    let _ = persist_tx.send(state.encode()).await;
}

async fn aggregation_timer(
    master: Arc<RwLock<ChannelMaster>>,
    socket: Arc<UdpSocket>,
    statistics: Statistics,
    observer: Arc<Observer>,
    mut stopping: watch::Receiver<bool>,
) {
    let mut ticker = interval(AGGREGATE_TICK);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = now_ms();
                let reporter = statistics.get_reporter();

                // Collect everything that needs sending while the lock is
                // held, then release it before any socket `.await` (§5's
                // "never held across an await" discipline).
                let (outgoing, delivered): (Vec<(SocketAddr, Vec<u8>)>, Vec<(SocketAddr, Vec<u8>)>) = {
                    let mut guard = master.write();
                    let aggregate = guard.options.aggregate;
                    let bw_limit = guard.options.bw_limit;
                    let escrow_ms = guard.options.reorder_escrow_ms;
                    let (clients, budget) = guard.clients_and_budget_mut();

                    let mut outgoing = Vec::new();
                    let mut delivered = Vec::new();
                    for client in clients.iter_mut() {
                        let peer = client.peer;
                        if aggregate || bw_limit {
                            for datagram in client.drain_ready(now, Some(&mut *budget)) {
                                outgoing.push((peer, datagram));
                            }
                        }
                        for frame in client.drain_escrow(now, escrow_ms) {
                            delivered.push((peer, frame));
                        }
                    }
                    (outgoing, delivered)
                };

                for (peer, datagram) in outgoing {
                    if socket.send_to(&datagram, peer).await.is_ok() {
                        reporter.send(&peer, &[Stat::SentFrames(1)]);
                    }
                }

                for (peer, frame) in delivered {
                    reporter.send(&peer, &[Stat::ReceivedFrames(1)]);
                    observer.frame_delivered(&peer, &frame);
                }
            }
            _ = stopping.changed() => {
                if *stopping.borrow() {
                    break;
                }
            }
        }
    }
}

/// Builds a standalone REQUEST packet (segment gap-fill or, with
/// `reason = 0`, a plain status request), signing it if the channel
/// authenticates.
fn build_request_packet(
    session: u32,
    now: u32,
    extended: bool,
    since_date_time: u32,
    request_id: u16,
    reason: u8,
    segment_id: u8,
    secret: Option<&[u8; 16]>,
) -> Vec<u8> {
    let header = Header {
        packet_size: 0,
        version: if extended { ProtocolVersion::Current } else { ProtocolVersion::Legacy },
        vendor_private: false,
        packet_type: PacketType::Request,
        auth_flag: secret.is_some(),
        vendor_code: 0,
        session,
        sequence: 0,
        timestamp: now,
        extended: None,
    };

    Packet::Request(RequestFrame {
        header,
        since_date_time,
        request_id,
        reason,
        segment_id,
    })
    .encode(secret)
}

/// Builds a standalone SEGMENT packet for a has-the-ball resend.
fn build_segment_packet(
    session: u32,
    now: u32,
    extended: bool,
    request_id: u16,
    segment: &segmentor::Segment,
    secret: Option<&[u8; 16]>,
) -> Vec<u8> {
    let header = Header {
        packet_size: 0,
        version: if extended { ProtocolVersion::Current } else { ProtocolVersion::Legacy },
        vendor_private: false,
        packet_type: PacketType::Segment,
        auth_flag: secret.is_some(),
        vendor_code: 0,
        session,
        sequence: 0,
        timestamp: now,
        extended: None,
    };

    Packet::Segment(SegmentFrame {
        header,
        request_id,
        segment_id: segment.segment_id,
        date_time: segment.date_time,
        flags: segment.flags,
        payload: &segment.payload,
    })
    .encode(secret)
}

async fn request_retry_timer(
    master: Arc<RwLock<ChannelMaster>>,
    socket: Arc<UdpSocket>,
    mut stopping: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = now_ms();

                let (due, gap_requests, resends, session, extended, secret) = {
                    let mut guard = master.write();
                    let due = guard.due_requests(now);
                    let gap_requests = guard.inbound_segments_mut().tick(now);
                    let resends = guard.outbound_segments_mut().tick(now);
                    let session = guard.our_session;
                    let extended = guard.uses_extended_header();
                    let secret = guard.options.authenticate.then_some(guard.options.secret);
                    (due, gap_requests, resends, session, extended, secret)
                };

                for name in due {
                    log::debug!("retrying request: {name}");
                }

                for (peer, request_id, lowest_missing) in gap_requests {
                    let packet = build_request_packet(
                        session,
                        now as u32,
                        extended,
                        0,
                        request_id,
                        REASON_REQUEST_ALL,
                        lowest_missing,
                        secret.as_ref(),
                    );
                    if let Err(e) = socket.send_to(&packet, peer).await {
                        log::warn!("failed to send segment-gap request to {peer}: {e}");
                    }
                }

                for (peer, request_id, segment) in resends {
                    let packet = build_segment_packet(session, now as u32, extended, request_id, &segment, secret.as_ref());
                    if let Err(e) = socket.send_to(&packet, peer).await {
                        log::warn!("failed to resend segment to {peer}: {e}");
                    }
                }
            }
            _ = stopping.changed() => {
                if *stopping.borrow() {
                    break;
                }
            }
        }
    }
}

async fn persistence_writer(
    mut rx: mpsc::Receiver<Vec<u8>>,
    path: PathBuf,
    mut stopping: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            Some(bytes) = rx.recv() => {
                if let Err(e) = tokio::fs::write(&path, &bytes).await {
                    log::error!("persistence write failed: {e}");
                }
                tokio::time::sleep(PERSIST_DEBOUNCE).await;
            }
            _ = stopping.changed() => {
                if *stopping.borrow() {
                    break;
                }
            }
            else => break,
        }
    }

    while let Ok(bytes) = rx.try_recv() {
        let _ = tokio::fs::write(&path, &bytes).await;
    }
}
