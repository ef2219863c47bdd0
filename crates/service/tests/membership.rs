use lonip_service::{decode_members_body, encode_members_body, ChannelMaster, ChannelOptions, DispatchOutcome, Member};

fn addr(s: &str) -> std::net::SocketAddr {
    s.parse().unwrap()
}

#[test]
fn members_body_round_trips_through_the_wire_codec() {
    let members = vec![
        Member { address: addr("10.0.0.1:1628"), last_update: 100 },
        Member { address: addr("10.0.0.2:1628"), last_update: 100 },
    ];

    let body = encode_members_body(100, &members);
    let (date_time, decoded) = decode_members_body(&body).unwrap();

    assert_eq!(date_time, 100);
    assert_eq!(decoded, members);
}

#[test]
fn applying_a_decoded_members_body_creates_clients_and_dispatch_routes() {
    let us = addr("10.0.0.1:1628");
    let peer = addr("10.0.0.2:1628");
    let body = encode_members_body(
        1,
        &[Member { address: us, last_update: 1 }, Member { address: peer, last_update: 1 }],
    );

    let (date_time, members) = decode_members_body(&body).unwrap();

    let mut master = ChannelMaster::new(ChannelOptions::default(), 7, 0);
    master.apply_members(members, date_time, &[us], 0).unwrap();

    assert_eq!(master.clients.len(), 1);
    assert_eq!(master.clients[0].peer, peer);

    let resolved = master.dispatcher.resolve(peer, false, None, None, None, false, 0);
    assert_eq!(resolved, DispatchOutcome::Direct(0));
}
