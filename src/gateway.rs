//! The gateway abstraction shared by the three protocol variants.
//!
//! A [`Gateway`] maps ports on one NAT device. PCP and NAT-PMP gateways own
//! a UDP socket and a request queue; the UPnP gateway speaks SOAP over
//! HTTP. All of them maintain a table of live mappings and renew them
//! before they expire.

use std::net::IpAddr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::error::{Error, Result};
use crate::mapping::Mapping;
use crate::options::{MapOptions, StopOptions};

/// Address family a gateway operates on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn matches(self, addr: IpAddr) -> bool {
        Family::of(addr) == self
    }
}

/// A successfully created port mapping, as reported back to the caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMapping {
    /// Upper-case protocol name
    pub protocol: String,
    pub internal_host: IpAddr,
    pub internal_port: u16,
    pub external_host: IpAddr,
    pub external_port: u16,
}

/// One NAT gateway, able to map ports for hosts behind it
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Maps `internal_port` on `internal_host` through the gateway and
    /// returns the externally visible endpoint
    async fn map(
        &self,
        internal_port: u16,
        internal_host: IpAddr,
        opts: MapOptions,
    ) -> Result<PortMapping>;

    /// Maps `internal_port` on every eligible local interface, yielding
    /// each successful mapping. When no interface succeeds the stream ends
    /// with a single aggregate error.
    async fn map_all(
        &self,
        internal_port: u16,
        opts: MapOptions,
    ) -> BoxStream<'static, Result<PortMapping>>;

    /// Removes the mapping(s) for `internal_port`
    async fn unmap(&self, internal_port: u16, opts: MapOptions) -> Result<()>;

    /// Reports the externally visible address of this gateway
    async fn external_ip(&self, opts: MapOptions) -> Result<IpAddr>;

    /// Unmaps everything (best effort), stops the refresher and releases
    /// the transport. Further operations fail with the closed error.
    async fn stop(&self, opts: StopOptions) -> Result<()>;

    /// Snapshot of the mappings this gateway currently tracks
    async fn mappings(&self) -> Vec<Mapping>;
}

/// Addresses assigned to local interfaces in the given family, excluding
/// loopback and link-local ranges
pub(crate) fn local_addresses(family: Family) -> Result<Vec<IpAddr>> {
    let interfaces =
        NetworkInterface::show().map_err(|e| Error::Interfaces(e.to_string()))?;
    let mut addrs: Vec<IpAddr> = interfaces
        .iter()
        .flat_map(|iface| iface.addr.iter())
        .map(|addr| addr.ip())
        .filter(|ip| family.matches(*ip) && is_eligible(*ip))
        .collect();
    addrs.dedup();
    Ok(addrs)
}

fn is_eligible(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
        IpAddr::V6(v6) => {
            // fe80::/10
            let link_local = v6.segments()[0] & 0xffc0 == 0xfe80;
            !v6.is_loopback() && !link_local && !v6.is_unspecified()
        }
    }
}

/// Shared `map_all` implementation: tries every local address of the
/// gateway's family in turn, yielding successes as they happen. Failures
/// are logged per interface; only a total failure surfaces, as one
/// aggregate error at the end of the stream.
pub(crate) fn fan_out<G>(
    gateway: G,
    family: Family,
    internal_port: u16,
    opts: MapOptions,
) -> BoxStream<'static, Result<PortMapping>>
where
    G: Gateway + Clone + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(async move {
        let addrs = match local_addresses(family) {
            Ok(addrs) if !addrs.is_empty() => addrs,
            Ok(_) => {
                tx.send(Err(Error::NoLocalAddresses)).await.ok();
                return;
            }
            Err(e) => {
                tx.send(Err(e)).await.ok();
                return;
            }
        };
        let mut mapped = 0usize;
        for addr in addrs {
            match gateway.map(internal_port, addr, opts.clone()).await {
                Ok(mapping) => {
                    mapped += 1;
                    if tx.send(Ok(mapping)).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!(%addr, port = internal_port, "mapping attempt failed: {e}"),
            }
        }
        if mapped == 0 {
            tx.send(Err(Error::AllMappingsFailed(internal_port)))
                .await
                .ok();
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

/// An ephemeral port from the IANA dynamic range, for throwaway mappings
pub(crate) fn ephemeral_port() -> u16 {
    use rand::Rng;
    rand::thread_rng().gen_range(49152..=65535)
}
