//! NAT-PMP packet codec (RFC 6886).
//!
//! NAT-PMP is the IPv4-only predecessor of PCP. Requests are tiny: two
//! bytes for an external address query, twelve for a mapping request. A
//! server marks its responses by adding 128 to the request opcode.

use std::net::Ipv4Addr;

use crate::options::Protocol;
use crate::wire::{ParseError, Reader, Writer};

/// NAT-PMP protocol version
pub const VERSION: u8 = 0;

/// NAT-PMP servers listen on the same UDP port as PCP
pub const SERVER_PORT: u16 = 5351;

/// Added to the request opcode in responses
const RESPONSE_OFFSET: u8 = 128;

/// Size of an EXTERNAL-IP response: version, opcode, result, epoch and
/// the four address bytes
pub const EXTERNAL_ADDRESS_RESPONSE_SIZE: usize = 12;

/// Size of a MAP response: version, opcode, result, epoch, the two ports
/// and the granted lifetime
pub const MAP_RESPONSE_SIZE: usize = 16;

/// Recommended lifetime to request when the caller supplied none
/// (RFC 6886 §3.3)
pub const DEFAULT_LIFETIME: u32 = 7200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Query the externally visible IPv4 address
    ExternalAddress = 0,
    MapUdp = 1,
    MapTcp = 2,
}

impl OpCode {
    /// Opcode used when requesting a mapping for this protocol
    pub const fn map(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Udp => Self::MapUdp,
            Protocol::Tcp => Self::MapTcp,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Self::ExternalAddress),
            1 => Ok(Self::MapUdp),
            2 => Ok(Self::MapTcp),
            n => Err(ParseError::OpCode(n)),
        }
    }
}

/// Result code carried in every response (RFC 6886 §3.5)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    /// The feature is supported but administratively disabled
    NotAuthorized = 2,
    /// The gateway itself has no working upstream, e.g. no DHCP lease
    NetworkFailure = 3,
    /// The gateway cannot create more mappings at this time
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl ResultCode {
    pub const fn message(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UnsupportedVersion => "unsupported version",
            Self::NotAuthorized => "not authorized or refused",
            Self::NetworkFailure => "network failure",
            Self::OutOfResources => "out of resources",
            Self::UnsupportedOpcode => "unsupported opcode",
        }
    }
}

impl TryFrom<u16> for ResultCode {
    type Error = ParseError;

    fn try_from(value: u16) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::UnsupportedVersion),
            2 => Ok(Self::NotAuthorized),
            3 => Ok(Self::NetworkFailure),
            4 => Ok(Self::OutOfResources),
            5 => Ok(Self::UnsupportedOpcode),
            n => Err(ParseError::ResultCode(n)),
        }
    }
}

/// Encodes an EXTERNAL-IP request: just the version and opcode bytes
pub fn encode_external_address() -> Vec<u8> {
    Writer::with_capacity(2)
        .u8(VERSION)
        .u8(OpCode::ExternalAddress as u8)
        .finish()
}

/// Encodes a MAP request.
///
/// # Format
///
/// ```plain
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Vers = 0      | OP = 1 or 2   |         Reserved              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Internal Port                 | Suggested External Port       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Requested Port Mapping Lifetime in Seconds                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub fn encode_map(
    protocol: Protocol,
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
) -> Vec<u8> {
    Writer::with_capacity(12)
        .u8(VERSION)
        .u8(OpCode::map(protocol) as u8)
        .zeros(2)
        .u16(internal_port)
        .u16(external_port)
        .u32(lifetime)
        .finish()
}

/// Opcode-specific tail of a response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseBody {
    ExternalAddress(Ipv4Addr),
    Map {
        internal_port: u16,
        external_port: u16,
        /// Granted lifetime in seconds
        lifetime: u32,
    },
}

/// A parsed NAT-PMP response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub opcode: OpCode,
    pub result: ResultCode,
    /// Seconds since the gateway's mapping table was last reset
    pub epoch: u32,
    pub body: ResponseBody,
}

pub fn decode_response(buf: &[u8]) -> Result<Response, ParseError> {
    if buf.len() < EXTERNAL_ADDRESS_RESPONSE_SIZE || buf.len() > MAP_RESPONSE_SIZE {
        return Err(ParseError::Length(buf.len()));
    }
    let mut r = Reader::new(buf);
    let version = r.u8()?;
    if version != VERSION {
        return Err(ParseError::Version(version));
    }
    let opcode_byte = r.u8()?;
    let Some(request_opcode) = opcode_byte.checked_sub(RESPONSE_OFFSET) else {
        return Err(ParseError::NotAResponse);
    };
    let opcode = OpCode::try_from(request_opcode)?;
    let result = ResultCode::try_from(r.u16()?)?;
    let epoch = r.u32()?;

    let body = match opcode {
        OpCode::ExternalAddress => ResponseBody::ExternalAddress(r.ipv4()?),
        OpCode::MapUdp | OpCode::MapTcp => ResponseBody::Map {
            internal_port: r.u16()?,
            external_port: r.u16()?,
            lifetime: r.u32()?,
        },
    };

    if r.remaining() != 0 {
        return Err(ParseError::Length(buf.len()));
    }

    Ok(Response {
        opcode,
        result,
        epoch,
        body,
    })
}

#[cfg(test)]
pub(crate) fn encode_response(
    opcode: OpCode,
    result: ResultCode,
    epoch: u32,
    body: &ResponseBody,
) -> Vec<u8> {
    let w = Writer::with_capacity(MAP_RESPONSE_SIZE)
        .u8(VERSION)
        .u8(opcode as u8 + RESPONSE_OFFSET)
        .u16(result as u16)
        .u32(epoch);
    match body {
        ResponseBody::ExternalAddress(addr) => w.bytes(&addr.octets()),
        ResponseBody::Map {
            internal_port,
            external_port,
            lifetime,
        } => w.u16(*internal_port).u16(*external_port).u32(*lifetime),
    }
    .finish()
}
