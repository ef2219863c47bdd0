use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lonip_codec::header::{Header, PacketType, ProtocolVersion};
use lonip_codec::packet::{Packet, SegmentFrame};

fn build_segment() -> Vec<u8> {
    let header = Header {
        packet_size: 0,
        version: ProtocolVersion::Current,
        vendor_private: false,
        packet_type: PacketType::Segment,
        auth_flag: false,
        vendor_code: 0,
        session: 1,
        sequence: 1,
        timestamp: 1,
        extended: None,
    };

    let payload = vec![0x42u8; 492];
    Packet::Segment(SegmentFrame {
        header,
        request_id: 1,
        segment_id: 0,
        date_time: 0,
        flags: 0,
        payload: &payload,
    })
    .encode(None)
}

fn bench_decode(c: &mut Criterion) {
    let bytes = build_segment();
    c.bench_function("segment decode", |b| {
        b.iter(|| {
            let (packet, _) = Packet::decode(black_box(&bytes)).unwrap();
            black_box(packet);
        })
    });
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
