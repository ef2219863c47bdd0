use lonip_codec::header::{Header, PacketType, ProtocolVersion};
use lonip_codec::packet::{DataFrame, Packet, RequestFrame, ResponseFrame, SegmentFrame};

fn base_header(packet_type: PacketType) -> Header {
    Header {
        packet_size: 0,
        version: ProtocolVersion::Current,
        vendor_private: false,
        packet_type,
        auth_flag: false,
        vendor_code: 0,
        session: 42,
        sequence: 7,
        timestamp: 1_000,
        extended: None,
    }
}

#[test]
fn data_frame_round_trips_with_crc() {
    let mut frame = vec![0x01u8, 0x02, 0x03];
    let crc = lonip_codec::crc::crc16(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());

    let packet = Packet::Data(DataFrame {
        header: base_header(PacketType::Data),
        frame: &frame,
        crc_ok: true,
    });

    let bytes = packet.encode(None);
    let (decoded, consumed) = Packet::decode(&bytes).unwrap();

    assert_eq!(consumed, bytes.len());
    match decoded {
        Packet::Data(f) => {
            assert_eq!(f.frame, frame.as_slice());
            assert!(f.crc_ok);
        }
        _ => panic!("expected Data"),
    }
}

#[test]
fn request_and_response_round_trip() {
    let request = Packet::Request(RequestFrame {
        header: base_header(PacketType::Request),
        since_date_time: 123,
        request_id: 5,
        reason: lonip_codec::packet::REASON_REQUEST_ALL,
        segment_id: 2,
    });

    let bytes = request.encode(None);
    let (decoded, _) = Packet::decode(&bytes).unwrap();
    assert_eq!(decoded, request);

    let response = Packet::Response(ResponseFrame {
        header: base_header(PacketType::Response),
        request_id: 5,
        segment_id: 2,
        code: 0,
    });

    let bytes = response.encode(None);
    let (decoded, _) = Packet::decode(&bytes).unwrap();
    assert_eq!(decoded, response);
}

#[test]
fn segment_round_trips_with_flags() {
    let payload = vec![0xffu8; 32];
    let segment = Packet::Segment(SegmentFrame {
        header: base_header(PacketType::Segment),
        request_id: 9,
        segment_id: 0,
        date_time: 55,
        flags: lonip_codec::packet::SEGMENT_FLAG_VALID,
        payload: &payload,
    });

    let bytes = segment.encode(None);
    let (decoded, _) = Packet::decode(&bytes).unwrap();
    match decoded {
        Packet::Segment(f) => {
            assert_eq!(f.payload, payload.as_slice());
            assert!(f.is_valid());
            assert!(!f.is_final());
        }
        _ => panic!("expected Segment"),
    }
}

#[test]
fn auth_round_trip_and_single_byte_flip_fails() {
    let secret = [9u8; 16];
    let mut frame = vec![0xaau8; 4];
    let crc = lonip_codec::crc::crc16(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());

    let packet = Packet::Data(DataFrame {
        header: base_header(PacketType::Data),
        frame: &frame,
        crc_ok: true,
    });

    let mut bytes = packet.encode(Some(&secret));
    let body_len = bytes.len() - 16;
    let digest: [u8; 16] = bytes[body_len..].try_into().unwrap();

    assert!(lonip_codec::crypto::verify(&secret, &bytes[..body_len], &digest));

    bytes[0] ^= 0x01;
    assert!(!lonip_codec::crypto::verify(&secret, &bytes[..body_len], &digest));
}

#[test]
fn packet_size_overrun_is_rejected() {
    let header = base_header(PacketType::Data);
    let mut buf = Vec::new();
    header.encode(&mut buf);
    buf[0..2].copy_from_slice(&(buf.len() as u16 + 1000).to_be_bytes());

    assert!(Packet::decode(&buf).is_err());
}
