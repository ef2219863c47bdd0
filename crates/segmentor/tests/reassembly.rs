use lonip_segmentor::{InboundOutcome, InboundSegmentor, OutboundSegmentor};

#[test]
fn fragment_then_assemble_regardless_of_arrival_order() {
    let mut out = OutboundSegmentor::new();
    let peer = "10.0.0.2:1628".parse().unwrap();
    let payload: Vec<u8> = (0..1500u32).map(|b| b as u8).collect();

    let segments = out.build_segments(peer, 1, 0, &payload, 0).unwrap();
    assert!(segments.len() <= 40);

    let mut inb = InboundSegmentor::new();
    let mut reordered = segments.clone();
    reordered.reverse();

    let mut assembled = None;
    for seg in &reordered {
        let outcome = inb.on_segment(peer, 1, seg.segment_id, seg.date_time, seg.flags, &seg.payload, 0);
        if let InboundOutcome::Assembled(bytes) = outcome {
            assembled = Some(bytes);
        }
    }

    assert_eq!(assembled.unwrap(), payload);
}

#[test]
fn duplicate_segment_is_ignored() {
    let mut inb = InboundSegmentor::new();
    let peer = "10.0.0.2:1628".parse().unwrap();

    let first = inb.on_segment(peer, 1, 0, 0, 0x80 | 0x40, b"only", 0);
    assert_eq!(first, InboundOutcome::Assembled(b"only".to_vec()));

    let dup = inb.on_segment(peer, 1, 0, 0, 0x80 | 0x40, b"only", 5);
    assert_eq!(dup, InboundOutcome::Duplicate);
}

#[test]
fn later_date_time_zaps_and_restarts_entry() {
    let mut inb = InboundSegmentor::new();
    let peer = "10.0.0.2:1628".parse().unwrap();

    inb.on_segment(peer, 1, 0, 0, 0x80, b"stale-0", 0);
    let outcome = inb.on_segment(peer, 1, 0, 5, 0x80 | 0x40, b"fresh", 1);
    assert_eq!(outcome, InboundOutcome::Assembled(b"fresh".to_vec()));
}

#[test]
fn lost_segment_triggers_gap_request_after_timeout() {
    let mut inb = InboundSegmentor::new();
    let peer = "10.0.0.2:1628".parse().unwrap();

    inb.on_segment(peer, 7, 0, 0, 0x80, b"first", 0);
    inb.on_segment(peer, 7, 2, 0, 0x80 | 0x40, b"third", 0);

    let requests = inb.tick(lonip_segmentor::TIMEOUT_RETRANS_MS);
    assert_eq!(requests, vec![(peer, 7, 1)]);
}

#[test]
fn outbound_stops_resending_after_peer_response() {
    let mut out = OutboundSegmentor::new();
    let peer = "10.0.0.2:1628".parse().unwrap();
    out.build_segments(peer, 3, 0, b"short payload", 0).unwrap();

    let resend = out.tick(lonip_segmentor::TIMEOUT_RETRANS_MS);
    assert_eq!(resend.len(), 1);

    out.on_peer_response(peer, 3);
    let resend = out.tick(lonip_segmentor::TIMEOUT_RETRANS_MS * 2);
    assert!(resend.is_empty());
}
