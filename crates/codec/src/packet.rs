use crate::crc;
use crate::crypto::{self, DIGEST_LEN};
use crate::header::{Header, PacketType, STANDARD_HEADER_LEN};
use crate::Error;

/// `reason` bit asking the peer to stream every segment from the named
/// segmentId onward, per the resolved "emit from that id onward" rule.
pub const REASON_REQUEST_ALL: u8 = 0x01;

pub const SEGMENT_FLAG_VALID: u8 = 0x80;
pub const SEGMENT_FLAG_FINAL: u8 = 0x40;

/// Minimum payload floor below which a declared `packet_size` cannot be
/// trusted for a given packet type (header only, no body).
fn min_body_len(packet_type: PacketType) -> usize {
    match packet_type {
        PacketType::Data => 0,
        PacketType::Request => 4 + 2 + 1 + 1,
        PacketType::Response => 2 + 1 + 2,
        PacketType::Segment => 2 + 1 + 4 + 1,
        _ => 0,
    }
}

/// A non-DATA control payload whose body is interpreted by the channel
/// master (membership, routing, registration, statistics, vendor frames);
/// the wire codec only frames the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame<'a> {
    pub header: Header,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrame<'a> {
    pub header: Header,
    /// The LonTalk frame, including its trailing 2-byte CRC.
    pub frame: &'a [u8],
    pub crc_ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    pub header: Header,
    pub since_date_time: u32,
    pub request_id: u16,
    pub reason: u8,
    pub segment_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame {
    pub header: Header,
    pub request_id: u16,
    pub segment_id: u8,
    pub code: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFrame<'a> {
    pub header: Header,
    pub request_id: u16,
    pub segment_id: u8,
    pub date_time: u32,
    pub flags: u8,
    pub payload: &'a [u8],
}

impl<'a> SegmentFrame<'a> {
    pub fn is_final(&self) -> bool {
        self.flags & SEGMENT_FLAG_FINAL != 0
    }

    pub fn is_valid(&self) -> bool {
        self.flags & SEGMENT_FLAG_VALID != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    Data(DataFrame<'a>),
    Request(RequestFrame),
    Response(ResponseFrame),
    Segment(SegmentFrame<'a>),
    Control(ControlFrame<'a>),
}

impl<'a> Packet<'a> {
    pub fn header(&self) -> &Header {
        match self {
            Packet::Data(f) => &f.header,
            Packet::Request(f) => &f.header,
            Packet::Response(f) => &f.header,
            Packet::Segment(f) => &f.header,
            Packet::Control(f) => &f.header,
        }
    }

    /// Parses one packet (and its optional trailing auth digest) from the
    /// front of `bytes`. Returns the packet and the byte length it and its
    /// digest occupied, so the caller can advance to the next aggregated
    /// frame in the same datagram.
    ///
    /// # Test
    ///
    /// ```
    /// use lonip_codec::header::{Header, PacketType, ProtocolVersion};
    /// use lonip_codec::packet::Packet;
    ///
    /// let header = Header {
    ///     packet_size: 0,
    ///     version: ProtocolVersion::Current,
    ///     vendor_private: false,
    ///     packet_type: PacketType::Data,
    ///     auth_flag: false,
    ///     vendor_code: 0,
    ///     session: 1,
    ///     sequence: 1,
    ///     timestamp: 100,
    ///     extended: None,
    /// };
    ///
    /// let bytes = Packet::Data(lonip_codec::packet::DataFrame {
    ///     header,
    ///     frame: &[0xaa, 0xbb],
    ///     crc_ok: true,
    /// })
    /// .encode(None);
    ///
    /// let (decoded, consumed) = Packet::decode(&bytes).unwrap();
    /// assert_eq!(consumed, bytes.len());
    /// assert!(matches!(decoded, Packet::Data(_)));
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<(Self, usize), Error> {
        let (header, header_len) = Header::decode(bytes)?;

        if (header.packet_size as usize) > bytes.len() {
            return Err(Error::SizeMismatch);
        }

        if (header.packet_size as usize) < header_len + min_body_len(header.packet_type) {
            return Err(Error::SizeMismatch);
        }

        let consumed_without_digest = header.packet_size as usize;
        let digest_len = if header.auth_flag { DIGEST_LEN } else { 0 };
        if consumed_without_digest + digest_len > bytes.len() {
            return Err(Error::SizeMismatch);
        }

        let body = &bytes[header_len..consumed_without_digest];

        let packet = match header.packet_type {
            PacketType::Data => {
                let crc_ok = crc::verify_frame(body);
                Packet::Data(DataFrame {
                    header,
                    frame: body,
                    crc_ok,
                })
            }
            PacketType::Request => {
                if body.len() < 8 {
                    return Err(Error::SizeMismatch);
                }
                Packet::Request(RequestFrame {
                    header,
                    since_date_time: u32::from_be_bytes(body[0..4].try_into().unwrap()),
                    request_id: u16::from_be_bytes(body[4..6].try_into().unwrap()),
                    reason: body[6],
                    segment_id: body[7],
                })
            }
            PacketType::Response => {
                if body.len() < 5 {
                    return Err(Error::SizeMismatch);
                }
                Packet::Response(ResponseFrame {
                    header,
                    request_id: u16::from_be_bytes(body[0..2].try_into().unwrap()),
                    segment_id: body[2],
                    code: u16::from_be_bytes(body[3..5].try_into().unwrap()),
                })
            }
            PacketType::Segment => {
                if body.len() < 8 {
                    return Err(Error::SizeMismatch);
                }
                Packet::Segment(SegmentFrame {
                    header,
                    request_id: u16::from_be_bytes(body[0..2].try_into().unwrap()),
                    segment_id: body[2],
                    date_time: u32::from_be_bytes(body[3..7].try_into().unwrap()),
                    flags: body[7],
                    payload: &body[8..],
                })
            }
            _ => Packet::Control(ControlFrame { header, body }),
        };

        Ok((packet, consumed_without_digest + digest_len))
    }

    /// Builds the wire bytes for this packet, fixing up `packet_size` to
    /// the actual encoded length and, if `secret` is given, appending the
    /// 16-byte keyed digest (with the header's `auth_flag` pre-set before
    /// digesting, per the stricter on-send form).
    pub fn encode(&self, secret: Option<&[u8; 16]>) -> Vec<u8> {
        let mut out = self.encode_marked(secret.is_some());

        if let Some(secret) = secret {
            let digest = crypto::sign(secret, &out);
            out.extend_from_slice(&digest);
        }

        out
    }

    /// Builds the wire bytes for this packet with `auth_flag` pre-set but
    /// without appending a digest. Used when several frames are aggregated
    /// into one datagram and the digest covers the whole datagram rather
    /// than any single frame (§4.4 outbound pipeline).
    pub fn encode_marked(&self, auth_flag: bool) -> Vec<u8> {
        let mut header = self.header().clone();
        header.auth_flag = auth_flag;

        let mut out = Vec::with_capacity(64);
        header.encode(&mut out);
        debug_assert_eq!(out.len(), header.header_len());

        match self {
            Packet::Data(f) => out.extend_from_slice(f.frame),
            Packet::Request(f) => {
                out.extend_from_slice(&f.since_date_time.to_be_bytes());
                out.extend_from_slice(&f.request_id.to_be_bytes());
                out.push(f.reason);
                out.push(f.segment_id);
            }
            Packet::Response(f) => {
                out.extend_from_slice(&f.request_id.to_be_bytes());
                out.push(f.segment_id);
                out.extend_from_slice(&f.code.to_be_bytes());
            }
            Packet::Segment(f) => {
                out.extend_from_slice(&f.request_id.to_be_bytes());
                out.push(f.segment_id);
                out.extend_from_slice(&f.date_time.to_be_bytes());
                out.push(f.flags);
                out.extend_from_slice(f.payload);
            }
            Packet::Control(f) => out.extend_from_slice(f.body),
        }

        let size = out.len() as u16;
        out[0..2].copy_from_slice(&size.to_be_bytes());

        out
    }
}
