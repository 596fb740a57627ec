//! PCP packet codec (RFC 6887).
//!
//! Only the opcodes the gateway runtime needs are implemented:
//! [`OpCode::Announce`] for server probing and [`OpCode::Map`] for creating,
//! refreshing and deleting mappings. The PEER opcode and the option system
//! are not part of this client.

use std::net::Ipv6Addr;

use crate::wire::{ParseError, Reader, Writer};

/// The version all RFC 6887 compliant clients and servers speak
pub const VERSION: u8 = 2;

/// IANA assigned UDP port PCP servers listen on
pub const SERVER_PORT: u16 = 5351;

/// Maximum size of a PCP UDP packet
pub const MAX_PACKET_SIZE: usize = 1100;

/// Size of the common request/response header in bytes
pub const HEADER_SIZE: usize = 24;

/// Size of the MAP opcode data appended to the header
pub const MAP_PAYLOAD_SIZE: usize = 36;

/// Longest lifetime a response is taken at face value for; anything above
/// is clamped down (RFC 6887 §15)
pub const MAX_LIFETIME: u32 = 86_400;

/// Bit 7 of the opcode byte, set on responses
const RESPONSE_BIT: u8 = 0b1000_0000;

/// The PCP opcodes used by this client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Server liveness and epoch probe
    Announce = 0,
    /// Create or refresh an explicit dynamic mapping
    Map = 1,
}

impl TryFrom<u8> for OpCode {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Self::Announce),
            1 => Ok(Self::Map),
            n => Err(ParseError::OpCode(n)),
        }
    }
}

/// Result code carried in the header of every response (RFC 6887 §7.4)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    /// The version number in the request is not supported by this server
    UnsupportedVersion = 1,
    /// The operation is disabled for this client or forbidden by policy
    NotAuthorized = 2,
    /// The request could not be successfully parsed
    MalformedRequest = 3,
    UnsupportedOpcode = 4,
    UnsupportedOption = 5,
    MalformedOption = 6,
    /// The server or the device it controls is experiencing a network
    /// failure
    NetworkFailure = 7,
    /// The server lacks the resources to complete the request right now
    NoResources = 8,
    UnsupportedProtocol = 9,
    /// Creating the mapping would exceed the subscriber's port quota
    UserExceededQuota = 10,
    /// The suggested external port and/or address cannot be provided
    CannotProvideExternal = 11,
    /// The request's source address does not match the client address
    /// field, hinting at an unexpected NAT on the path
    AddressMismatch = 12,
    /// The server was not able to create the requested filters
    ExcessiveRemotePeers = 13,
}

impl ResultCode {
    /// Canonical message for this code
    pub const fn message(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UnsupportedVersion => "unsupported version",
            Self::NotAuthorized => "not authorized",
            Self::MalformedRequest => "malformed request",
            Self::UnsupportedOpcode => "unsupported opcode",
            Self::UnsupportedOption => "unsupported option",
            Self::MalformedOption => "malformed option",
            Self::NetworkFailure => "network failure",
            Self::NoResources => "no resources",
            Self::UnsupportedProtocol => "unsupported transport protocol",
            Self::UserExceededQuota => "user exceeded port quota",
            Self::CannotProvideExternal => "cannot provide the suggested external port or address",
            Self::AddressMismatch => "client address mismatch",
            Self::ExcessiveRemotePeers => "excessive remote peers",
        }
    }
}

impl TryFrom<u8> for ResultCode {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::UnsupportedVersion),
            2 => Ok(Self::NotAuthorized),
            3 => Ok(Self::MalformedRequest),
            4 => Ok(Self::UnsupportedOpcode),
            5 => Ok(Self::UnsupportedOption),
            6 => Ok(Self::MalformedOption),
            7 => Ok(Self::NetworkFailure),
            8 => Ok(Self::NoResources),
            9 => Ok(Self::UnsupportedProtocol),
            10 => Ok(Self::UserExceededQuota),
            11 => Ok(Self::CannotProvideExternal),
            12 => Ok(Self::AddressMismatch),
            13 => Ok(Self::ExcessiveRemotePeers),
            n => Err(ParseError::ResultCode(n.into())),
        }
    }
}

/// Fields of a MAP request
///
/// # Format
///
/// The 24-byte request header followed by the 36-byte MAP opcode data:
///
/// ```plain
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Version = 2  |R|   Opcode    |         Reserved              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 Requested Lifetime (32 bits)                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |            PCP Client's IP Address (128 bits)                 |
/// |                                                               |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                 Mapping Nonce (96 bits)                       |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Protocol    |          Reserved (24 bits)                   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |        Internal Port          |    Suggested External Port    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |           Suggested External IP Address (128 bits)            |
/// |                                                               |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapRequest {
    /// Requested lifetime in seconds; zero deletes the mapping
    pub lifetime: u32,
    /// Source address the client sends this request from. IPv4 is
    /// represented as an IPv4-mapped IPv6 address.
    pub client: Ipv6Addr,
    /// Random value tying this request to the mapping; refreshes must
    /// carry the nonce of the mapping they retarget
    pub nonce: [u8; 12],
    /// IANA protocol number (TCP is 6, UDP is 17)
    pub protocol: u8,
    pub internal_port: u16,
    /// Zero when the client has no preference
    pub suggested_external_port: u16,
    /// The all-zeros address when the client has no preference
    pub suggested_external_addr: Ipv6Addr,
}

impl MapRequest {
    pub fn encode(&self) -> Vec<u8> {
        Writer::with_capacity(HEADER_SIZE + MAP_PAYLOAD_SIZE)
            .u8(VERSION)
            .u8(OpCode::Map as u8 & !RESPONSE_BIT)
            .zeros(2)
            .u32(self.lifetime)
            .ipv6(self.client)
            .bytes(&self.nonce)
            .u8(self.protocol)
            .zeros(3)
            .u16(self.internal_port)
            .u16(self.suggested_external_port)
            .ipv6(self.suggested_external_addr)
            .finish()
    }
}

/// Encodes an ANNOUNCE request: the bare header with a zero lifetime
pub fn encode_announce(client: Ipv6Addr) -> Vec<u8> {
    Writer::with_capacity(HEADER_SIZE)
        .u8(VERSION)
        .u8(OpCode::Announce as u8 & !RESPONSE_BIT)
        .zeros(2)
        .u32(0)
        .ipv6(client)
        .finish()
}

/// MAP opcode data appended to a response header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapResponse {
    /// Copied from the corresponding request
    pub nonce: [u8; 12],
    /// Copied from the corresponding request
    pub protocol: u8,
    /// Copied from the corresponding request
    pub internal_port: u16,
    pub external_port: u16,
    /// IPv4 assignments arrive as IPv4-mapped IPv6 addresses
    pub external_addr: Ipv6Addr,
}

/// A parsed PCP response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub opcode: OpCode,
    pub result: ResultCode,
    /// Granted lifetime in seconds, already clamped to [`MAX_LIFETIME`]
    pub lifetime: u32,
    /// Seconds since the server booted
    pub epoch: u32,
    /// Present on MAP responses
    pub map: Option<MapResponse>,
}

/// Parses a datagram received from the configured server.
///
/// Length sanity comes first: PCP packets are at least one header long, at
/// most [`MAX_PACKET_SIZE`], and always a multiple of four bytes. A MAP
/// response shorter than header + opcode data is rejected rather than
/// half-parsed.
pub fn decode_response(buf: &[u8]) -> Result<Response, ParseError> {
    if buf.len() < HEADER_SIZE || buf.len() > MAX_PACKET_SIZE || buf.len() % 4 != 0 {
        return Err(ParseError::Length(buf.len()));
    }
    let mut r = Reader::new(buf);
    let version = r.u8()?;
    if version != VERSION {
        return Err(ParseError::Version(version));
    }
    let opcode_byte = r.u8()?;
    if opcode_byte & RESPONSE_BIT == 0 {
        return Err(ParseError::NotAResponse);
    }
    let opcode = OpCode::try_from(opcode_byte & !RESPONSE_BIT)?;
    let result = ResultCode::try_from(r.skip(1)?.u8()?)?;
    let lifetime = r.u32()?.min(MAX_LIFETIME);
    let epoch = r.u32()?;
    r.skip(12)?;

    let map = match opcode {
        OpCode::Map => {
            if buf.len() < HEADER_SIZE + MAP_PAYLOAD_SIZE {
                return Err(ParseError::Length(buf.len()));
            }
            let nonce = r.array()?;
            let protocol = r.u8()?;
            let internal_port = r.skip(3)?.u16()?;
            let external_port = r.u16()?;
            let external_addr = r.ipv6()?;
            Some(MapResponse {
                nonce,
                protocol,
                internal_port,
                external_port,
                external_addr,
            })
        }
        OpCode::Announce => None,
    };

    Ok(Response {
        opcode,
        result,
        lifetime,
        epoch,
        map,
    })
}

/// Builds a response packet, for the fake servers the tests run against
#[cfg(test)]
pub(crate) fn encode_response(
    opcode: OpCode,
    result: ResultCode,
    lifetime: u32,
    epoch: u32,
    map: Option<&MapResponse>,
) -> Vec<u8> {
    let mut w = Writer::with_capacity(HEADER_SIZE + MAP_PAYLOAD_SIZE)
        .u8(VERSION)
        .u8(opcode as u8 | RESPONSE_BIT)
        .u8(0)
        .u8(result as u8)
        .u32(lifetime)
        .u32(epoch)
        .zeros(12);
    if let Some(map) = map {
        w = w
            .bytes(&map.nonce)
            .u8(map.protocol)
            .zeros(3)
            .u16(map.internal_port)
            .u16(map.external_port)
            .ipv6(map.external_addr);
    }
    w.finish()
}

/// Parses a request packet, for the fake servers the tests run against
#[cfg(test)]
pub(crate) fn decode_map_request(buf: &[u8]) -> Result<MapRequest, ParseError> {
    if buf.len() < HEADER_SIZE + MAP_PAYLOAD_SIZE {
        return Err(ParseError::Length(buf.len()));
    }
    let mut r = Reader::new(buf);
    let version = r.u8()?;
    if version != VERSION {
        return Err(ParseError::Version(version));
    }
    let opcode = OpCode::try_from(r.u8()? & !RESPONSE_BIT)?;
    if opcode != OpCode::Map {
        return Err(ParseError::OpCode(opcode as u8));
    }
    let lifetime = r.skip(2)?.u32()?;
    let client = r.ipv6()?;
    Ok(MapRequest {
        lifetime,
        client,
        nonce: r.array()?,
        protocol: r.u8()?,
        internal_port: r.skip(3)?.u16()?,
        suggested_external_port: r.u16()?,
        suggested_external_addr: r.ipv6()?,
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn map_request(nonce: [u8; 12]) -> MapRequest {
        MapRequest {
            lifetime: 3600,
            client: Ipv4Addr::new(192, 168, 1, 10).to_ipv6_mapped(),
            nonce,
            protocol: 6,
            internal_port: 5000,
            suggested_external_port: 5000,
            suggested_external_addr: Ipv6Addr::UNSPECIFIED,
        }
    }

    #[test]
    fn map_request_bytes() {
        let nonce = [0xAB; 12];
        let buf = map_request(nonce).encode();

        assert_eq!(buf.len(), 60);
        // version, MAP, reserved, lifetime 3600
        assert_eq!(&buf[..8], &[0x02, 0x01, 0x00, 0x00, 0x00, 0x00, 0x0E, 0x10]);
        // IPv4-mapped client address
        let mut client = [0u8; 16];
        client[10] = 0xff;
        client[11] = 0xff;
        client[12..].copy_from_slice(&[192, 168, 1, 10]);
        assert_eq!(&buf[8..24], &client);
        assert_eq!(&buf[24..36], &nonce);
        // protocol, reserved, internal port, suggested external port
        assert_eq!(&buf[36..40], &[0x06, 0x00, 0x00, 0x00]);
        assert_eq!(&buf[40..42], &[0x13, 0x88]);
        assert_eq!(&buf[42..44], &[0x13, 0x88]);
        // unspecified suggested external address
        assert_eq!(&buf[44..60], &[0u8; 16]);
    }

    #[test]
    fn request_header_roundtrip() {
        let buf = map_request([1; 12]).encode();
        // bytes 0 and 1 identify the version and a request-side MAP
        assert_eq!(buf[0], VERSION);
        assert_eq!(buf[1] & RESPONSE_BIT, 0);
        assert_eq!(OpCode::try_from(buf[1]).unwrap(), OpCode::Map);
        assert_eq!(decode_map_request(&buf).unwrap().encode(), buf);
    }

    #[test]
    fn response_lifetime_clamp() {
        let buf = encode_response(OpCode::Announce, ResultCode::Success, 100_000, 17, None);
        let resp = decode_response(&buf).unwrap();
        assert_eq!(resp.lifetime, MAX_LIFETIME);
        assert_eq!(resp.epoch, 17);
    }

    #[test]
    fn response_length_rules() {
        // too short
        assert_eq!(
            decode_response(&[0; 20]),
            Err(ParseError::Length(20))
        );
        // not a multiple of four
        assert_eq!(
            decode_response(&[0; 27]),
            Err(ParseError::Length(27))
        );
        // too long
        assert_eq!(
            decode_response(&[0; 1104]),
            Err(ParseError::Length(1104))
        );
        // a MAP response must carry the full opcode data
        let mut short = encode_response(OpCode::Map, ResultCode::Success, 0, 0, None);
        assert_eq!(short.len(), HEADER_SIZE);
        short[1] = OpCode::Map as u8 | 0b1000_0000;
        assert_eq!(decode_response(&short), Err(ParseError::Length(24)));
    }

    #[test]
    fn response_header_rules() {
        let mut buf = encode_response(OpCode::Announce, ResultCode::Success, 0, 0, None);
        buf[0] = 1;
        assert_eq!(decode_response(&buf), Err(ParseError::Version(1)));

        let mut buf = encode_response(OpCode::Announce, ResultCode::Success, 0, 0, None);
        buf[1] &= 0b0111_1111;
        assert_eq!(decode_response(&buf), Err(ParseError::NotAResponse));

        let mut buf = encode_response(OpCode::Announce, ResultCode::Success, 0, 0, None);
        buf[3] = 77;
        assert_eq!(decode_response(&buf), Err(ParseError::ResultCode(77)));
    }

    #[test]
    fn map_response_roundtrip() {
        let map = MapResponse {
            nonce: [3; 12],
            protocol: 17,
            internal_port: 6000,
            external_port: 6001,
            external_addr: Ipv4Addr::new(1, 2, 3, 4).to_ipv6_mapped(),
        };
        let buf = encode_response(OpCode::Map, ResultCode::Success, 7200, 42, Some(&map));
        let resp = decode_response(&buf).unwrap();
        assert_eq!(resp.opcode, OpCode::Map);
        assert_eq!(resp.result, ResultCode::Success);
        assert_eq!(resp.map, Some(map));
    }

    #[test]
    fn error_results_carry_canonical_messages() {
        let buf = encode_response(OpCode::Map, ResultCode::UserExceededQuota, 0, 0, None);
        // an error MAP response may omit the opcode data only if the
        // server is non-compliant; ours includes it
        assert!(decode_response(&buf).is_err());

        assert_eq!(ResultCode::UserExceededQuota as u8, 10);
        assert_eq!(
            ResultCode::UserExceededQuota.message(),
            "user exceeded port quota"
        );
    }
}
