use std::net::Ipv4Addr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Error;

pub const STANDARD_HEADER_LEN: usize = 20;
pub const EXTENDED_HEADER_LEN: usize = 12;

/// Bit 5 of the protocol-flags byte: packet is (or must be) authenticated.
pub const FLAG_AUTHENTICATED: u8 = 0x20;

/// Bit 7 of the version byte: vendor-private packet type.
const VERSION_VENDOR_PRIVATE: u8 = 0x80;
const VERSION_MASK: u8 = 0x1f;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum PacketType {
    Data = 0x01,
    ChnMembers = 0x02,
    ChnRouting = 0x03,
    DevRegister = 0x04,
    DevConfigure = 0x05,
    SendList = 0x06,
    Statistics = 0x07,
    Request = 0x08,
    Response = 0x09,
    Segment = 0x0a,
    TimeSynchRequest = 0x10,
    TimeSynchResponse = 0x11,
    EchelonConfig = 0x12,
    EchelonConfigRequest = 0x13,
    EchelonControl = 0x14,
    EchelonVersion = 0x15,
    EchelonVersionRequest = 0x16,
    EchelonMode = 0x17,
    EchelonModeRequest = 0x18,
    EchelonDeviceId = 0x19,
    EchelonDeviceIdRequest = 0x1a,
    EchelonChannelRoutingRequest = 0x1b,
}

impl PacketType {
    pub fn is_vendor_private(self) -> bool {
        matches!(
            self,
            PacketType::TimeSynchRequest
                | PacketType::TimeSynchResponse
                | PacketType::EchelonConfig
                | PacketType::EchelonConfigRequest
                | PacketType::EchelonControl
                | PacketType::EchelonVersion
                | PacketType::EchelonVersionRequest
                | PacketType::EchelonMode
                | PacketType::EchelonModeRequest
                | PacketType::EchelonDeviceId
                | PacketType::EchelonDeviceIdRequest
                | PacketType::EchelonChannelRoutingRequest
        )
    }
}

/// Protocol version as negotiated between a channel master and its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// EIA-852 legacy peer (v1): no extended header, legacy digest only.
    Legacy,
    /// Current vendor protocol (v2): extended headers, EIA-852 auth.
    Current,
}

impl ProtocolVersion {
    fn from_raw(raw: u8) -> Result<Self, Error> {
        match raw & VERSION_MASK {
            0 => Ok(ProtocolVersion::Legacy),
            1 => Ok(ProtocolVersion::Current),
            _ => Err(Error::UnknownVersion),
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            ProtocolVersion::Legacy => 0,
            ProtocolVersion::Current => 1,
        }
    }
}

/// The 12-byte vendor extension carrying the sender's declared addressing,
/// so NAT port/address rewriting at the receiver can be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub sender_local_ip: Ipv4Addr,
    pub sender_nat_ip: Ipv4Addr,
    pub sender_port: u16,
    pub reserved: u16,
}

impl ExtendedHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < EXTENDED_HEADER_LEN {
            return Err(Error::MalformedHeader);
        }

        Ok(Self {
            sender_local_ip: Ipv4Addr::from(u32::from_be_bytes(bytes[0..4].try_into().unwrap())),
            sender_nat_ip: Ipv4Addr::from(u32::from_be_bytes(bytes[4..8].try_into().unwrap())),
            sender_port: u16::from_be_bytes(bytes[8..10].try_into().unwrap()),
            reserved: u16::from_be_bytes(bytes[10..12].try_into().unwrap()),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&u32::from(self.sender_local_ip).to_be_bytes());
        out.extend_from_slice(&u32::from(self.sender_nat_ip).to_be_bytes());
        out.extend_from_slice(&self.sender_port.to_be_bytes());
        out.extend_from_slice(&self.reserved.to_be_bytes());
    }
}

/// The 20-byte standard header shared by every packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub packet_size: u16,
    pub version: ProtocolVersion,
    pub vendor_private: bool,
    pub packet_type: PacketType,
    pub auth_flag: bool,
    pub vendor_code: u16,
    pub session: u32,
    pub sequence: u32,
    pub timestamp: u32,
    pub extended: Option<ExtendedHeader>,
}

impl Header {
    /// Parses the standard (and, if present, extended) header from the
    /// front of `bytes`. Does not validate `packet_size` against `bytes`'s
    /// actual length; callers check that against the enclosing buffer.
    ///
    /// # Test
    ///
    /// ```
    /// use lonip_codec::header::{Header, PacketType, ProtocolVersion};
    ///
    /// let mut buf = Vec::new();
    /// let header = Header {
    ///     packet_size: 20,
    ///     version: ProtocolVersion::Current,
    ///     vendor_private: false,
    ///     packet_type: PacketType::Data,
    ///     auth_flag: false,
    ///     vendor_code: 0,
    ///     session: 1,
    ///     sequence: 2,
    ///     timestamp: 3,
    ///     extended: None,
    /// };
    ///
    /// header.encode(&mut buf);
    /// let (decoded, consumed) = Header::decode(&buf).unwrap();
    ///
    /// assert_eq!(decoded, header);
    /// assert_eq!(consumed, 20);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), Error> {
        if bytes.len() < STANDARD_HEADER_LEN {
            return Err(Error::MalformedHeader);
        }

        let packet_size = u16::from_be_bytes(bytes[0..2].try_into().unwrap());
        let version_byte = bytes[2];
        let version = ProtocolVersion::from_raw(version_byte)?;
        let vendor_private = version_byte & VERSION_VENDOR_PRIVATE != 0;

        let packet_type = PacketType::try_from(bytes[3]).map_err(|_| Error::UnknownPacketType)?;
        let ext_header_len = bytes[4];
        let flags = bytes[5];
        let vendor_code = u16::from_be_bytes(bytes[6..8].try_into().unwrap());
        let session = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let sequence = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let timestamp = u32::from_be_bytes(bytes[16..20].try_into().unwrap());

        let has_extended = ext_header_len != 0 && matches!(version, ProtocolVersion::Current);
        let (extended, consumed) = if has_extended {
            let ext = ExtendedHeader::decode(&bytes[STANDARD_HEADER_LEN..])?;
            (Some(ext), STANDARD_HEADER_LEN + EXTENDED_HEADER_LEN)
        } else {
            (None, STANDARD_HEADER_LEN)
        };

        Ok((
            Self {
                packet_size,
                version,
                vendor_private,
                packet_type,
                auth_flag: flags & FLAG_AUTHENTICATED != 0,
                vendor_code,
                session,
                sequence,
                timestamp,
                extended,
            },
            consumed,
        ))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.packet_size.to_be_bytes());

        let mut version_byte = self.version.as_raw();
        if self.vendor_private {
            version_byte |= VERSION_VENDOR_PRIVATE;
        }
        out.push(version_byte);

        out.push(self.packet_type.into());
        out.push(if self.extended.is_some() {
            EXTENDED_HEADER_LEN as u8
        } else {
            0
        });

        let mut flags = 0u8;
        if self.auth_flag {
            flags |= FLAG_AUTHENTICATED;
        }
        out.push(flags);

        out.extend_from_slice(&self.vendor_code.to_be_bytes());
        out.extend_from_slice(&self.session.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());

        if let Some(ext) = &self.extended {
            ext.encode(out);
        }
    }

    pub fn header_len(&self) -> usize {
        STANDARD_HEADER_LEN + if self.extended.is_some() { EXTENDED_HEADER_LEN } else { 0 }
    }
}
