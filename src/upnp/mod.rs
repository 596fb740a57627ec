//! UPnP IGD gateway (v1/v2).
//!
//! Unlike the UDP gateways there is no socket to own: every operation is a
//! SOAP action POSTed to the control URL found in the device descriptor.
//! The gateway keeps its mapping table and per-mapping bookkeeping behind
//! one async mutex, which also serializes the actions the way the UDP
//! queue serializes packets.
//!
//! IPv4 mappings go through `AddAnyPortMapping` on IGDv2 gateways, which
//! may hand back a different external port than requested, and fall back
//! to plain `AddPortMapping` on v1 devices. IPv6 uses the firewall-control
//! service: `AddPinhole` returns a `UniqueID` which later refreshes
//! (`UpdatePinhole`) and deletes (`DeletePinhole`) must present.
//!
//! Descriptors discovered over SSDP expire with their `CACHE-CONTROL`
//! budget; an expired descriptor is re-discovered, constrained to the
//! device's unique service name, before the next action is sent.

pub mod device;
mod discovery;
pub(crate) mod soap;

pub use discovery::DiscoveredService;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use reqwest::Client;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::gateway::{fan_out, local_addresses, Family, Gateway, PortMapping};
use crate::mapping::{unix_ms, Mapping, MappingTable, Nonce};
use crate::options::{MapOptions, Protocol, StopOptions, UpnpNatOptions};

use device::{resolve_service, IgdVersion, ResolvedService};
use discovery::Discovery;

/// Smallest lease an IPv6 pinhole may ask for, in seconds
const MIN_PINHOLE_LEASE: u32 = 3600;

/// Default SSDP search window, in milliseconds
const DEFAULT_SEARCH_TIMEOUT: u64 = 5000;

/// Creates the UPnP client used to discover and drive IGD gateways
pub fn upnp_nat(opts: UpnpNatOptions) -> UpnpNat {
    let http = Client::new();
    let timeout = Duration::from_millis(opts.search_timeout.unwrap_or(DEFAULT_SEARCH_TIMEOUT));
    UpnpNat {
        discovery: Discovery::new(http.clone(), timeout),
        http,
    }
}

/// Discovers IGD gateways over SSDP and constructs them from descriptors
pub struct UpnpNat {
    http: Client,
    discovery: Discovery,
}

impl UpnpNat {
    /// Searches the local network and yields one gateway per discovered
    /// IGDv2 device, deduplicated by descriptor location
    pub fn find_gateways(&self, opts: UpnpNatOptions) -> BoxStream<'static, Result<IgdGateway>> {
        let discovery = match opts.search_timeout {
            Some(ms) => Discovery::new(self.http.clone(), Duration::from_millis(ms)),
            None => self.discovery.clone(),
        };
        let mut found = discovery.search(None);
        let http = self.http.clone();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let mut seen: HashSet<Url> = HashSet::new();
            while let Some(service) = found.recv().await {
                if !service
                    .service_type
                    .ends_with(":InternetGatewayDevice:2")
                {
                    debug!(st = %service.service_type, "skipping non-IGDv2 device");
                    continue;
                }
                if !seen.insert(service.location.clone()) {
                    continue;
                }
                let gateway =
                    IgdGateway::from_service(http.clone(), Some(discovery.clone()), service);
                if tx.send(gateway).await.is_err() {
                    return;
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    /// Fetches a descriptor directly, bypassing SSDP, and constructs the
    /// matching gateway variant
    pub async fn get_gateway(&self, location: Url) -> Result<IgdGateway> {
        let xml = self
            .http
            .get(location.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let details = device::parse_descriptor(&xml)?;
        let unique_service_name = details.device.udn.clone();
        let service = DiscoveredService {
            location,
            details,
            service_type: discovery::IGD_DEVICE_2.to_string(),
            unique_service_name,
            // not advertised over SSDP, so there is nothing to renew from
            expires: u64::MAX,
        };
        IgdGateway::from_service(self.http.clone(), None, service)
    }
}

/// Per-mapping data the protocol needs again on refresh and delete
#[derive(Clone)]
struct RowExtra {
    description: String,
    remote_host: String,
    /// Lease asked for on the last successful action, in seconds
    lease: u32,
    refresh_threshold: u64,
    /// `UniqueID` of the IPv6 pinhole backing this row
    pinhole_id: Option<String>,
}

struct State {
    location: Url,
    service: ResolvedService,
    unique_service_name: String,
    /// Unix milliseconds the descriptor stays valid for
    expires: u64,
    table: MappingTable,
    extras: HashMap<Nonce, RowExtra>,
    refreshers: HashMap<Nonce, CancellationToken>,
    closed: bool,
}

struct Inner {
    http: Client,
    family: Family,
    discovery: Option<Discovery>,
    cancel: CancellationToken,
    state: Mutex<State>,
}

/// Handle to one UPnP Internet Gateway Device
#[derive(Clone)]
pub struct IgdGateway {
    inner: Arc<Inner>,
}

fn family_of_url(url: &Url) -> Family {
    match url.host() {
        Some(url::Host::Ipv6(_)) => Family::V6,
        _ => Family::V4,
    }
}

impl IgdGateway {
    /// Builds a gateway from a discovered (or directly fetched) descriptor
    pub(crate) fn from_service(
        http: Client,
        discovery: Option<Discovery>,
        service: DiscoveredService,
    ) -> Result<Self> {
        let family = family_of_url(&service.location);
        let resolved = resolve_service(&service.details, &service.location, family)?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                family,
                discovery,
                cancel: CancellationToken::new(),
                state: Mutex::new(State {
                    location: service.location,
                    service: resolved,
                    unique_service_name: service.unique_service_name,
                    expires: service.expires,
                    table: MappingTable::new(),
                    extras: HashMap::new(),
                    refreshers: HashMap::new(),
                    closed: false,
                }),
            }),
        })
    }

    /// URL of the device descriptor this gateway was built from
    pub async fn location(&self) -> Url {
        self.inner.state.lock().await.location.clone()
    }

    /// Re-resolves the descriptor when its advertisement has lapsed
    async fn renew(&self, state: &mut MutexGuard<'_, State>) -> Result<()> {
        if state.expires > unix_ms() {
            return Ok(());
        }
        let Some(discovery) = &self.inner.discovery else {
            return Err(Error::GatewayNotResolved);
        };
        let found = discovery
            .rediscover(&state.unique_service_name, self.inner.family)
            .await
            .ok_or(Error::GatewayNotResolved)?;
        let resolved = resolve_service(&found.details, &found.location, self.inner.family)?;
        state.location = found.location;
        state.service = resolved;
        state.expires = found.expires;
        Ok(())
    }

    async fn call(
        &self,
        state: &MutexGuard<'_, State>,
        action: &str,
        args: &[(&str, String)],
    ) -> Result<HashMap<String, String>> {
        soap::call(
            &self.inner.http,
            &state.service.control_url,
            &state.service.service_type,
            action,
            args,
        )
        .await
    }

    async fn map_inner(
        &self,
        internal_port: u16,
        internal_host: IpAddr,
        opts: &MapOptions,
    ) -> Result<PortMapping> {
        let (protocol_raw, protocol) = opts.protocol()?;
        if !self.inner.family.matches(internal_host) {
            return Err(Error::UnsupportedFamily);
        }
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }
        self.renew(&mut state).await?;

        let auto_refresh = opts.auto_refresh();
        let row = state
            .table
            .get_or_create(internal_host, internal_port, &protocol_raw, auto_refresh);
        let nonce = row.nonce;
        let preferred = opts
            .external_port
            .or(row.external_port)
            .unwrap_or(internal_port);
        let remote_host = opts.remote_host.clone().unwrap_or_default();
        let description = opts.description();

        let granted = match self.inner.family {
            Family::V4 => {
                let lease = (opts.ttl_ms() / 1000) as u32;
                self.add_port_mapping(
                    &state,
                    &remote_host,
                    preferred,
                    protocol,
                    internal_port,
                    internal_host,
                    &description,
                    lease,
                )
                .await
            }
            Family::V6 => {
                let lease = ((opts.ttl_ms() / 1000) as u32).max(MIN_PINHOLE_LEASE);
                self.add_pinhole(
                    &state,
                    &remote_host,
                    internal_host,
                    internal_port,
                    protocol,
                    lease,
                )
                .await
            }
        };
        let granted = match granted {
            Ok(granted) => granted,
            Err(e) => {
                state.table.delete_by_nonce(&nonce);
                state.extras.remove(&nonce);
                return Err(e);
            }
        };

        let expires_at = unix_ms() + u64::from(granted.lease) * 1000;
        state.table.update(
            internal_port,
            &protocol_raw,
            &nonce,
            granted.external_host,
            granted.external_port,
            expires_at,
            granted.lease,
        );
        let threshold = opts.refresh_threshold_ms();
        state.extras.insert(
            nonce,
            RowExtra {
                description,
                remote_host,
                lease: granted.lease,
                refresh_threshold: threshold,
                pinhole_id: granted.pinhole_id,
            },
        );
        if auto_refresh {
            self.arm_refresh(&mut state, nonce, granted.lease, threshold);
        }

        Ok(PortMapping {
            protocol: protocol_raw.to_uppercase(),
            internal_host,
            internal_port,
            external_host: granted.external_host,
            external_port: granted.external_port,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn add_port_mapping(
        &self,
        state: &MutexGuard<'_, State>,
        remote_host: &str,
        external_port: u16,
        protocol: Protocol,
        internal_port: u16,
        internal_host: IpAddr,
        description: &str,
        lease: u32,
    ) -> Result<Granted> {
        let args = [
            ("NewRemoteHost", remote_host.to_string()),
            ("NewExternalPort", external_port.to_string()),
            ("NewProtocol", protocol.as_str().to_string()),
            ("NewInternalPort", internal_port.to_string()),
            ("NewInternalClient", internal_host.to_string()),
            ("NewEnabled", "1".to_string()),
            ("NewPortMappingDescription", description.to_string()),
            ("NewLeaseDuration", lease.to_string()),
        ];
        let assigned = match state.service.version {
            IgdVersion::V2 => {
                let values = self.call(state, "AddAnyPortMapping", &args).await?;
                // v2 gateways are free to reserve a different port
                values
                    .get("NewReservedPort")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(external_port)
            }
            IgdVersion::V1 => {
                self.call(state, "AddPortMapping", &args).await?;
                external_port
            }
        };
        let external_host = self.fetch_external_ip(state).await?;
        Ok(Granted {
            external_host,
            external_port: assigned,
            lease,
            pinhole_id: None,
        })
    }

    async fn add_pinhole(
        &self,
        state: &MutexGuard<'_, State>,
        remote_host: &str,
        internal_host: IpAddr,
        internal_port: u16,
        protocol: Protocol,
        lease: u32,
    ) -> Result<Granted> {
        let args = [
            ("RemoteHost", remote_host.to_string()),
            ("RemotePort", "0".to_string()),
            ("InternalClient", internal_host.to_string()),
            ("InternalPort", internal_port.to_string()),
            // the firewall service takes IANA protocol numbers
            ("Protocol", protocol.number().to_string()),
            ("LeaseTime", lease.to_string()),
        ];
        let values = self.call(state, "AddPinhole", &args).await?;
        let unique_id = values
            .get("UniqueID")
            .cloned()
            .ok_or_else(|| Error::Soap("AddPinhole response lacks a UniqueID".into()))?;
        // a pinhole translates nothing; the internal endpoint is the
        // external one
        Ok(Granted {
            external_host: internal_host,
            external_port: internal_port,
            lease,
            pinhole_id: Some(unique_id),
        })
    }

    async fn fetch_external_ip(&self, state: &MutexGuard<'_, State>) -> Result<IpAddr> {
        let values = self.call(state, "GetExternalIPAddress", &[]).await?;
        values
            .get("NewExternalIPAddress")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Soap("no usable NewExternalIPAddress".into()))
    }

    fn arm_refresh(
        &self,
        state: &mut MutexGuard<'_, State>,
        nonce: Nonce,
        lease: u32,
        threshold: u64,
    ) {
        if let Some(previous) = state.refreshers.remove(&nonce) {
            previous.cancel();
        }
        let token = self.inner.cancel.child_token();
        state.refreshers.insert(nonce, token.clone());
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut delay = refresh_delay(lease, threshold);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match gateway.refresh(nonce).await {
                    Ok(next) => delay = next,
                    Err(e) => {
                        // the row stays; only the timer gives up
                        warn!("mapping refresh failed: {e}");
                        return;
                    }
                }
            }
        });
    }

    /// Re-issues the mapping action for one row; IPv4 re-adds the port
    /// mapping, IPv6 updates the pinhole lease
    async fn refresh(&self, nonce: Nonce) -> Result<Duration> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }
        self.renew(&mut state).await?;
        let row = state
            .table
            .get_by_nonce(&nonce)
            .cloned()
            .ok_or(Error::UnknownMapping)?;
        let extra = state
            .extras
            .get(&nonce)
            .cloned()
            .ok_or(Error::UnknownMapping)?;
        let protocol = Protocol::parse(&row.protocol).unwrap_or(Protocol::Tcp);

        let granted = match self.inner.family {
            Family::V4 => {
                self.add_port_mapping(
                    &state,
                    &extra.remote_host,
                    row.external_port.unwrap_or(row.internal_port),
                    protocol,
                    row.internal_port,
                    row.internal_host,
                    &extra.description,
                    extra.lease,
                )
                .await?
            }
            Family::V6 => {
                let id = extra
                    .pinhole_id
                    .clone()
                    .ok_or(Error::UnknownMapping)?;
                let args = [
                    ("UniqueID", id.clone()),
                    ("NewLeaseTime", extra.lease.to_string()),
                ];
                self.call(&state, "UpdatePinhole", &args).await?;
                Granted {
                    external_host: row.internal_host,
                    external_port: row.internal_port,
                    lease: extra.lease,
                    pinhole_id: Some(id),
                }
            }
        };

        let expires_at = unix_ms() + u64::from(granted.lease) * 1000;
        state.table.update(
            row.internal_port,
            &row.protocol,
            &nonce,
            granted.external_host,
            granted.external_port,
            expires_at,
            granted.lease,
        );
        debug!(port = row.internal_port, "mapping refreshed");
        Ok(refresh_delay(granted.lease, extra.refresh_threshold))
    }

    /// Deletes the gateway-side state for one row; the table row itself is
    /// removed by the caller
    async fn release_row(
        &self,
        state: &MutexGuard<'_, State>,
        row: &Mapping,
        extra: Option<&RowExtra>,
    ) -> Result<()> {
        match self.inner.family {
            Family::V4 => {
                let protocol = Protocol::parse(&row.protocol).unwrap_or(Protocol::Tcp);
                let args = [
                    (
                        "NewRemoteHost",
                        extra.map(|e| e.remote_host.clone()).unwrap_or_default(),
                    ),
                    (
                        "NewExternalPort",
                        row.external_port.unwrap_or(row.internal_port).to_string(),
                    ),
                    ("NewProtocol", protocol.as_str().to_string()),
                ];
                self.call(state, "DeletePortMapping", &args).await?;
            }
            Family::V6 => {
                if let Some(id) = extra.and_then(|e| e.pinhole_id.clone()) {
                    self.call(state, "DeletePinhole", &[("UniqueID", id)]).await?;
                }
            }
        }
        Ok(())
    }

    async fn unmap_inner(&self, internal_port: u16, opts: &MapOptions) -> Result<()> {
        let (protocol_raw, _) = opts.protocol()?;
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }
        self.renew(&mut state).await?;

        let rows: Vec<Mapping> = state
            .table
            .iter()
            .filter(|m| {
                m.internal_port == internal_port && m.protocol.eq_ignore_ascii_case(&protocol_raw)
            })
            .cloned()
            .collect();
        let mut first_error = None;
        for row in rows {
            if let Some(token) = state.refreshers.remove(&row.nonce) {
                token.cancel();
            }
            let extra = state.extras.remove(&row.nonce);
            if let Err(e) = self.release_row(&state, &row, extra.as_ref()).await {
                warn!(port = row.internal_port, "failed to remove mapping: {e}");
                first_error.get_or_insert(e);
            }
            state.table.delete_by_nonce(&row.nonce);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn external_ip_inner(&self) -> Result<IpAddr> {
        match self.inner.family {
            Family::V4 => {
                let mut state = self.inner.state.lock().await;
                if state.closed {
                    return Err(Error::Closed);
                }
                self.renew(&mut state).await?;
                self.fetch_external_ip(&state).await
            }
            // No translation happens for IPv6; any global address of this
            // host is directly reachable once pinholed
            Family::V6 => local_addresses(Family::V6)?
                .into_iter()
                .next()
                .ok_or(Error::NoLocalAddresses),
        }
    }

    async fn stop_inner(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }
        state.closed = true;
        self.inner.cancel.cancel();
        state.refreshers.clear();

        let rows = state.table.snapshot();
        for row in rows {
            let extra = state.extras.remove(&row.nonce);
            if let Err(e) = self.release_row(&state, &row, extra.as_ref()).await {
                warn!(port = row.internal_port, "failed to remove mapping: {e}");
            }
        }
        state.table.delete_all();
        state.extras.clear();
        Ok(())
    }
}

/// Outcome of a successful add action
struct Granted {
    external_host: IpAddr,
    external_port: u16,
    lease: u32,
    pinhole_id: Option<String>,
}

fn refresh_delay(lease: u32, threshold_ms: u64) -> Duration {
    let lease_ms = u64::from(lease) * 1000;
    // renew `threshold` before expiry, but never later than half-life
    Duration::from_millis(lease_ms.saturating_sub(threshold_ms).max(lease_ms / 2))
}

#[async_trait::async_trait]
impl Gateway for IgdGateway {
    async fn map(
        &self,
        internal_port: u16,
        internal_host: IpAddr,
        opts: MapOptions,
    ) -> Result<PortMapping> {
        match opts.signal.clone() {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => Err(Error::Aborted),
                result = self.map_inner(internal_port, internal_host, &opts) => result,
            },
            None => self.map_inner(internal_port, internal_host, &opts).await,
        }
    }

    async fn map_all(
        &self,
        internal_port: u16,
        opts: MapOptions,
    ) -> BoxStream<'static, Result<PortMapping>> {
        fan_out(self.clone(), self.inner.family, internal_port, opts)
    }

    async fn unmap(&self, internal_port: u16, opts: MapOptions) -> Result<()> {
        match opts.signal.clone() {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => Err(Error::Aborted),
                result = self.unmap_inner(internal_port, &opts) => result,
            },
            None => self.unmap_inner(internal_port, &opts).await,
        }
    }

    async fn external_ip(&self, opts: MapOptions) -> Result<IpAddr> {
        match opts.signal.clone() {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => Err(Error::Aborted),
                result = self.external_ip_inner() => result,
            },
            None => self.external_ip_inner().await,
        }
    }

    async fn stop(&self, opts: StopOptions) -> Result<()> {
        match opts.signal.clone() {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => Err(Error::Aborted),
                result = self.stop_inner() => result,
            },
            None => self.stop_inner().await,
        }
    }

    async fn mappings(&self) -> Vec<Mapping> {
        self.inner.state.lock().await.table.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    type Requests = Arc<StdMutex<Vec<(String, String)>>>;

    /// Minimal HTTP server: descriptor on GET, SOAP dispatch on POST
    async fn fake_igd<F>(bind: &str, handler: F) -> (std::net::SocketAddr, Requests)
    where
        F: Fn(&str, &str, &str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(bind).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Requests = Arc::new(StdMutex::new(Vec::new()));
        let log = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let parsed = loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        break None;
                    };
                    if n == 0 {
                        break None;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let mut headers = [httparse::EMPTY_HEADER; 32];
                    let mut request = httparse::Request::new(&mut headers);
                    match request.parse(&buf) {
                        Ok(httparse::Status::Complete(offset)) => {
                            let method = request.method.unwrap_or("").to_string();
                            let path = request.path.unwrap_or("").to_string();
                            let length = headers
                                .iter()
                                .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                                .and_then(|h| std::str::from_utf8(h.value).ok())
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            break Some((method, path, offset, length));
                        }
                        Ok(httparse::Status::Partial) => continue,
                        Err(_) => break None,
                    }
                };
                let Some((method, path, offset, length)) = parsed else {
                    continue;
                };
                while buf.len() < offset + length {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        break;
                    };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let body = String::from_utf8_lossy(&buf[offset..offset + length]).into_owned();
                log.lock().unwrap().push((path.clone(), body.clone()));
                let (status, response_body) = handler(&method, &path, &body);
                let reason = if status == 200 { "OK" } else { "Error" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\ncontent-type: text/xml\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{response_body}",
                    response_body.len()
                );
                stream.write_all(response.as_bytes()).await.ok();
            }
        });
        (addr, requests)
    }

    fn descriptor_xml() -> String {
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:2</deviceType>
    <friendlyName>Fake IGD</friendlyName>
    <UDN>uuid:fake-igd</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:WANIPConnection:2</serviceType>
        <controlURL>/ctl/ip</controlURL>
        <SCPDURL>/scpd/ip.xml</SCPDURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:WANIPv6FirewallControl:1</serviceType>
        <controlURL>/ctl/fw6</controlURL>
        <SCPDURL>/scpd/fw6.xml</SCPDURL>
      </service>
    </serviceList>
  </device>
</root>"#
            .to_string()
    }

    fn soap_ok(action: &str, inner: &str) -> (u16, String) {
        (
            200,
            format!(
                r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:{action}Response xmlns:u="urn:example">{inner}</u:{action}Response>
  </s:Body>
</s:Envelope>"#
            ),
        )
    }

    fn soap_fault(code: u16, description: &str) -> (u16, String) {
        (
            500,
            format!(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body><s:Fault><detail><UPnPError>
    <errorCode>{code}</errorCode>
    <errorDescription>{description}</errorDescription>
  </UPnPError></detail></s:Fault></s:Body>
</s:Envelope>"#
            ),
        )
    }

    fn v4_handler(method: &str, path: &str, body: &str) -> (u16, String) {
        match (method, path) {
            ("GET", "/rootDesc.xml") => (200, descriptor_xml()),
            ("POST", "/ctl/ip") if body.contains("AddAnyPortMapping") => {
                soap_ok("AddAnyPortMapping", "<NewReservedPort>51234</NewReservedPort>")
            }
            ("POST", "/ctl/ip") if body.contains("GetExternalIPAddress") => soap_ok(
                "GetExternalIPAddress",
                "<NewExternalIPAddress>81.2.3.4</NewExternalIPAddress>",
            ),
            ("POST", "/ctl/ip") if body.contains("DeletePortMapping") => {
                soap_ok("DeletePortMapping", "")
            }
            _ => (404, String::new()),
        }
    }

    async fn gateway_at(addr: std::net::SocketAddr) -> IgdGateway {
        let nat = upnp_nat(UpnpNatOptions::default());
        let location: Url = format!("http://{addr}/rootDesc.xml").parse().unwrap();
        nat.get_gateway(location).await.unwrap()
    }

    #[tokio::test]
    async fn v4_map_reserves_a_port_and_reports_the_external_ip() {
        let (addr, requests) = fake_igd("127.0.0.1:0", v4_handler).await;
        let gateway = gateway_at(addr).await;

        let mapping = gateway
            .map(
                5000,
                "192.168.1.10".parse().unwrap(),
                MapOptions {
                    description: Some("test mapping".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(mapping.external_port, 51234);
        assert_eq!(
            mapping.external_host,
            "81.2.3.4".parse::<IpAddr>().unwrap()
        );

        let rows = gateway.mappings().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].external_port, Some(51234));
        assert_eq!(rows[0].lifetime, Some(3600));

        let log = requests.lock().unwrap();
        let add = log
            .iter()
            .find(|(_, body)| body.contains("AddAnyPortMapping"))
            .unwrap();
        assert!(add.1.contains("<NewInternalPort>5000</NewInternalPort>"));
        assert!(add.1.contains("<NewInternalClient>192.168.1.10</NewInternalClient>"));
        assert!(add.1.contains("<NewLeaseDuration>3600</NewLeaseDuration>"));
        assert!(add.1.contains("<NewPortMappingDescription>test mapping</NewPortMappingDescription>"));
    }

    #[tokio::test]
    async fn v4_unmap_deletes_by_external_port() {
        let (addr, requests) = fake_igd("127.0.0.1:0", v4_handler).await;
        let gateway = gateway_at(addr).await;

        gateway
            .map(5000, "192.168.1.10".parse().unwrap(), MapOptions::default())
            .await
            .unwrap();
        gateway.unmap(5000, MapOptions::default()).await.unwrap();
        assert!(gateway.mappings().await.is_empty());

        let log = requests.lock().unwrap();
        let delete = log
            .iter()
            .find(|(_, body)| body.contains("DeletePortMapping"))
            .unwrap();
        assert!(delete.1.contains("<NewExternalPort>51234</NewExternalPort>"));
        assert!(delete.1.contains("<NewProtocol>TCP</NewProtocol>"));
    }

    #[tokio::test]
    async fn soap_faults_surface_as_gateway_errors() {
        let (addr, _) = fake_igd("127.0.0.1:0", |method, path, body| {
            match (method, path) {
                ("GET", "/rootDesc.xml") => (200, descriptor_xml()),
                ("POST", _) if body.contains("AddAnyPortMapping") => {
                    soap_fault(718, "ConflictInMappingEntry")
                }
                _ => (404, String::new()),
            }
        })
        .await;
        let gateway = gateway_at(addr).await;

        let err = gateway
            .map(5000, "192.168.1.10".parse().unwrap(), MapOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::Gateway { code, message } => {
                assert_eq!(code, 718);
                assert_eq!(message, "ConflictInMappingEntry");
            }
            other => panic!("unexpected error: {other}"),
        }
        // the failed row does not linger
        assert!(gateway.mappings().await.is_empty());
    }

    #[tokio::test]
    async fn short_leases_are_refreshed() {
        let (addr, requests) = fake_igd("127.0.0.1:0", v4_handler).await;
        let gateway = gateway_at(addr).await;

        gateway
            .map(
                5000,
                "192.168.1.10".parse().unwrap(),
                MapOptions {
                    // four second lease; renewal due at the half-life
                    ttl: Some(4000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3000)).await;

        let log = requests.lock().unwrap();
        let adds = log
            .iter()
            .filter(|(_, body)| body.contains("AddAnyPortMapping"))
            .count();
        assert!(adds >= 2, "expected a renewal, saw {adds} add actions");
    }

    #[tokio::test]
    async fn stop_releases_mappings_and_refuses_further_work() {
        let (addr, requests) = fake_igd("127.0.0.1:0", v4_handler).await;
        let gateway = gateway_at(addr).await;

        gateway
            .map(5000, "192.168.1.10".parse().unwrap(), MapOptions::default())
            .await
            .unwrap();
        gateway.stop(StopOptions::default()).await.unwrap();

        {
            let log = requests.lock().unwrap();
            assert!(log.iter().any(|(_, body)| body.contains("DeletePortMapping")));
        }

        let err = gateway
            .map(5001, "192.168.1.10".parse().unwrap(), MapOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
        let err = gateway.stop(StopOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn v6_pinholes_roundtrip_their_unique_id() {
        let (addr, requests) = fake_igd("[::1]:0", |method, path, body| match (method, path) {
            ("GET", "/rootDesc.xml") => (200, descriptor_xml()),
            ("POST", "/ctl/fw6") if body.contains("AddPinhole") => {
                soap_ok("AddPinhole", "<UniqueID>7</UniqueID>")
            }
            ("POST", "/ctl/fw6") if body.contains("DeletePinhole") => soap_ok("DeletePinhole", ""),
            _ => (404, String::new()),
        })
        .await;
        let gateway = gateway_at(addr).await;

        let host: IpAddr = "2001:db8::5".parse().unwrap();
        let mapping = gateway
            .map(
                5000,
                host,
                MapOptions {
                    protocol: Some("udp".to_string()),
                    // below the pinhole minimum; must be clamped up
                    ttl: Some(60_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // pinholes do not translate
        assert_eq!(mapping.external_host, host);
        assert_eq!(mapping.external_port, 5000);

        gateway
            .unmap(
                5000,
                MapOptions {
                    protocol: Some("udp".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let log = requests.lock().unwrap();
        let add = log
            .iter()
            .find(|(_, body)| body.contains("AddPinhole"))
            .unwrap();
        assert!(add.1.contains("<Protocol>17</Protocol>"));
        assert!(add.1.contains("<LeaseTime>3600</LeaseTime>"));
        let delete = log
            .iter()
            .find(|(_, body)| body.contains("DeletePinhole"))
            .unwrap();
        assert!(delete.1.contains("<UniqueID>7</UniqueID>"));
    }

    #[tokio::test]
    async fn ipv4_hosts_cannot_be_pinholed_through_a_v6_gateway() {
        let (addr, _) = fake_igd("[::1]:0", |method, path, _| match (method, path) {
            ("GET", "/rootDesc.xml") => (200, descriptor_xml()),
            _ => (404, String::new()),
        })
        .await;
        let gateway = gateway_at(addr).await;
        let err = gateway
            .map(5000, "192.168.1.10".parse().unwrap(), MapOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFamily));
    }

    #[test]
    fn refresh_delay_clamps_to_half_life() {
        assert_eq!(
            refresh_delay(3600, 60_000),
            Duration::from_millis(3_540_000)
        );
        // tiny lease: the threshold would fire immediately, half-life wins
        assert_eq!(refresh_delay(4, 60_000), Duration::from_millis(2000));
    }
}
