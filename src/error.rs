use std::io;

use crate::wire::ParseError;

/// Error generated by the port mapping operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller asked for a transport protocol that is neither TCP nor UDP
    #[error("unknown transport protocol: {0:?}")]
    InvalidProtocol(String),

    /// Error generated by an I/O operation on the sockets used for
    /// communication with the gateway
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The gateway did not answer before the request deadline
    #[error("request timed out")]
    Timeout,

    /// The operation was aborted through its cancellation signal
    #[error("request aborted")]
    Aborted,

    /// The gateway was stopped, or its runtime went away
    #[error("gateway is closed")]
    Closed,

    /// The gateway answered with a packet that could not be parsed
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A well-formed response did not belong to any known mapping
    #[error("no mapping matches the response")]
    UnknownMapping,

    /// The gateway reported an error result code
    #[error("gateway error {code}: {message}")]
    Gateway { code: u16, message: String },

    /// No PCP server answered the announce probe on any local address
    #[error("No PCP server found")]
    NoPcpServer,

    /// Every local interface failed to map the port
    #[error("All attempts to map port {0} failed")]
    AllMappingsFailed(u16),

    /// A gateway discovered over SSDP could no longer be located
    #[error("Could not resolve gateway")]
    GatewayNotResolved,

    /// No local interface address matches the gateway's address family
    #[error("no eligible local addresses")]
    NoLocalAddresses,

    /// The address family is not supported by this gateway variant
    #[error("address family not supported by this gateway")]
    UnsupportedFamily,

    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(String),

    /// Error generated by an HTTP exchange with an IGD control point
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("failed to parse device descriptor: {0}")]
    Descriptor(#[from] quick_xml::DeError),

    /// The SOAP response was missing the expected element
    #[error("invalid SOAP response: {0}")]
    Soap(String),

    /// An SSDP search answer could not be used
    #[error("invalid discovery response: {0}")]
    Discovery(String),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The device descriptor does not advertise a usable mapping service
    #[error("no compatible service on this device")]
    NoService,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
