//! Map ports on NAT gateways from behind them.
//!
//! > The Port Control Protocol allows an IPv6 or IPv4 host to control how
//! incoming IPv6 or IPv4 packets are translated and forwarded by a
//! Network Address Translator (NAT) or simple firewall.
//! >
//! >~ *from [RFC 6887](https://tools.ietf.org/html/rfc6887)*
//!
//! This crate speaks three interoperable protocols to whatever device sits
//! between a host and the internet: **PCP** (RFC 6887), its predecessor
//! **NAT-PMP** (RFC 6886), and **UPnP IGD** v1/v2 (SOAP over HTTP,
//! discovered with SSDP). All three expose the same [`Gateway`] surface:
//! map a port, map it on every interface, unmap it, report the external
//! address, and stop.
//!
//! # Getting started
//!
//! PCP and NAT-PMP gateways are constructed from the router's IP address,
//! usually the default gateway of the host:
//!
//! ```no_run
//! use nat_port_mapper::{pcp_nat, Gateway, MapOptions, PcpNatOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = pcp_nat("192.168.1.1".parse()?, PcpNatOptions::default()).await?;
//!
//! let mapping = gateway
//!     .map(8080, "192.168.1.101".parse()?, MapOptions::default())
//!     .await?;
//! println!(
//!     "reachable at {}:{}",
//!     mapping.external_host, mapping.external_port
//! );
//! # Ok(())
//! # }
//! ```
//!
//! UPnP gateways are found on the local network instead:
//!
//! ```no_run
//! use futures::StreamExt;
//! use nat_port_mapper::{upnp_nat, Gateway, MapOptions, UpnpNatOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = upnp_nat(UpnpNatOptions::default());
//! let mut gateways = client.find_gateways(UpnpNatOptions::default());
//! while let Some(gateway) = gateways.next().await {
//!     let gateway = gateway?;
//!     gateway
//!         .map(8080, "192.168.1.101".parse()?, MapOptions::default())
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Mappings are leased, not permanent. By default (`auto_refresh`) each
//! gateway renews its mappings before the lease runs out: the PCP gateway
//! scans for mappings past half their lifetime, the NAT-PMP and UPnP
//! gateways arm a one-shot timer per mapping. Gateways also notice when a
//! PCP server reboots (its epoch jumps) and transparently re-request every
//! mapping they own.

mod error;
mod gateway;
mod mapping;
mod natpmp;
mod options;
mod pcp;
mod queue;
mod upnp;
mod wire;

pub use error::{Error, Result};
pub use gateway::{Family, Gateway, PortMapping};
pub use mapping::{Mapping, Nonce};
pub use natpmp::{pmp_nat, NatPmpGateway};
pub use options::{
    MapOptions, PcpNatOptions, PmpNatOptions, Protocol, StopOptions, UpnpNatOptions,
    DEFAULT_DESCRIPTION, DEFAULT_REFRESH_THRESHOLD, DEFAULT_REFRESH_TIMEOUT, DEFAULT_TTL,
};
pub use pcp::{pcp_nat, PcpGateway};
pub use upnp::{device, upnp_nat, DiscoveredService, IgdGateway, UpnpNat};
pub use wire::ParseError;
