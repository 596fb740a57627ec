//! Options accepted by the public operations and their defaults.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Default mapping lifetime, in milliseconds (one hour)
pub const DEFAULT_TTL: u64 = 3_600_000;

/// Default description attached to mappings on gateways that store one
pub const DEFAULT_DESCRIPTION: &str = "@achingbrain/nat-port-mapper";

/// Default deadline for a single request, in milliseconds
pub const DEFAULT_REFRESH_TIMEOUT: u64 = 10_000;

/// Default margin before expiry at which a mapping is refreshed,
/// in milliseconds
pub const DEFAULT_REFRESH_THRESHOLD: u64 = 60_000;

/// Options recognized by [`map`](crate::Gateway::map) and the other
/// per-mapping operations. All fields are optional; `None` means the
/// documented default.
#[derive(Clone, Debug, Default)]
pub struct MapOptions {
    /// Requested lifetime of the mapping in milliseconds.
    ///
    /// Converted to whole seconds on the wire and clamped to each
    /// protocol's minimum (120 s for PCP, 3600 s for IPv6 pinholes).
    pub ttl: Option<u64>,
    /// Free-form description stored alongside the mapping where the
    /// protocol supports one (UPnP)
    pub description: Option<String>,
    /// Whether the mapping is renewed before it expires. Defaults to `true`.
    pub auto_refresh: Option<bool>,
    /// Deadline for a single request round-trip, in milliseconds
    pub refresh_timeout: Option<u64>,
    /// How long before expiry a refresh is issued, in milliseconds
    pub refresh_threshold: Option<u64>,
    /// Preferred external port. The gateway may assign a different one.
    pub external_port: Option<u16>,
    /// Restrict the mapping to packets from this remote host.
    /// Defaults to the wildcard.
    pub remote_host: Option<String>,
    /// `"TCP"` or `"UDP"`, compared case-insensitively. Defaults to TCP.
    pub protocol: Option<String>,
    /// Aborts the operation when cancelled
    pub signal: Option<CancellationToken>,
}

impl MapOptions {
    pub(crate) fn ttl_ms(&self) -> u64 {
        self.ttl.unwrap_or(DEFAULT_TTL)
    }

    pub(crate) fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string())
    }

    pub(crate) fn auto_refresh(&self) -> bool {
        self.auto_refresh.unwrap_or(true)
    }

    pub(crate) fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout.unwrap_or(DEFAULT_REFRESH_TIMEOUT))
    }

    pub(crate) fn refresh_threshold_ms(&self) -> u64 {
        self.refresh_threshold.unwrap_or(DEFAULT_REFRESH_THRESHOLD)
    }

    /// Returns the protocol string as given by the caller together with
    /// its parsed wire representation
    pub(crate) fn protocol(&self) -> Result<(String, Protocol), Error> {
        let raw = self.protocol.clone().unwrap_or_else(|| "TCP".to_string());
        let parsed = Protocol::parse(&raw)?;
        Ok((raw, parsed))
    }
}

/// Options recognized by [`stop`](crate::Gateway::stop)
#[derive(Clone, Debug, Default)]
pub struct StopOptions {
    /// Aborts the wait for the shutdown to complete. The gateway keeps
    /// closing in the background.
    pub signal: Option<CancellationToken>,
}

/// Options recognized by [`pcp_nat`](crate::pcp_nat)
#[derive(Clone, Debug, Default)]
pub struct PcpNatOptions {
    /// Aborts the initial announce probe
    pub signal: Option<CancellationToken>,
}

/// Options recognized by [`pmp_nat`](crate::pmp_nat)
#[derive(Clone, Debug, Default)]
pub struct PmpNatOptions {
    pub signal: Option<CancellationToken>,
}

/// Options recognized by [`upnp_nat`](crate::upnp_nat)
#[derive(Clone, Debug, Default)]
pub struct UpnpNatOptions {
    /// How long a single SSDP search round listens for responses,
    /// in milliseconds. Defaults to 5000.
    pub search_timeout: Option<u64>,
}

/// A transport protocol as it appears on the wire.
///
/// Mapping rows keep the caller's original spelling; this type is what the
/// codecs and SOAP actions work with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else {
            Err(Error::InvalidProtocol(s.to_string()))
        }
    }

    /// IANA protocol number, as used in PCP MAP payloads
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    /// Canonical upper-case name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
