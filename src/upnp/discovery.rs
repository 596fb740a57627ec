//! SSDP discovery of Internet Gateway Devices.
//!
//! One search round multicasts an `M-SEARCH` for the IGDv2 device type and
//! listens for unicast `200 OK` answers until the timeout. Each distinct
//! `LOCATION` is fetched and parsed into a device descriptor, and the
//! result is handed to the consumer as a [`DiscoveredService`]. The
//! gateway adapter in the parent module treats that type as opaque input,
//! so any other producer of discovery events can stand in for SSDP.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use reqwest::Client;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::gateway::Family;
use crate::mapping::unix_ms;

use super::device::{parse_descriptor, RootDescriptor};

/// The IPv4 SSDP multicast group
const SSDP_V4: &str = "239.255.255.250:1900";

/// The link-local IPv6 SSDP multicast group
const SSDP_V6: &str = "[ff02::c]:1900";

/// Device type searched for; v2 gateways also answer for their embedded
/// v1 services
pub const IGD_DEVICE_2: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:2";

/// Descriptor validity when the gateway sends no `CACHE-CONTROL` header,
/// in seconds
const DEFAULT_MAX_AGE: u64 = 1800;

/// One gateway device found over SSDP (or supplied by any other
/// discovery source)
#[derive(Clone, Debug)]
pub struct DiscoveredService {
    /// Where the device descriptor was fetched from
    pub location: Url,
    /// The parsed device tree
    pub details: RootDescriptor,
    /// The `ST` value the device answered with
    pub service_type: String,
    /// The `USN` value identifying this device instance
    pub unique_service_name: String,
    /// Unix milliseconds after which the descriptor must be re-discovered
    pub expires: u64,
}

pub(crate) fn search_request(target: &str, host: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         Host: {host}\r\n\
         Man: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {target}\r\n\
         \r\n"
    )
}

/// Headers extracted from one SSDP search answer
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SearchResponse {
    pub location: Url,
    pub service_type: String,
    pub unique_service_name: String,
    /// Seconds the advertisement stays valid
    pub max_age: u64,
}

pub(crate) fn parse_search_response(buf: &[u8]) -> Result<SearchResponse> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(buf)
        .map_err(|e| Error::Discovery(format!("bad SSDP response: {e}")))?;
    if response.code != Some(200) {
        return Err(Error::Discovery(format!(
            "bad SSDP response code {:?}",
            response.code
        )));
    }

    let mut location = None;
    let mut service_type = String::new();
    let mut unique_service_name = String::new();
    let mut max_age = DEFAULT_MAX_AGE;
    for header in response.headers.iter() {
        let value = std::str::from_utf8(header.value).unwrap_or_default();
        if header.name.eq_ignore_ascii_case("location") {
            location = Some(value.to_string());
        } else if header.name.eq_ignore_ascii_case("st") {
            service_type = value.to_string();
        } else if header.name.eq_ignore_ascii_case("usn") {
            unique_service_name = value.to_string();
        } else if header.name.eq_ignore_ascii_case("cache-control") {
            // e.g. "max-age=1800"
            if let Some(age) = value
                .split(',')
                .filter_map(|part| part.trim().strip_prefix("max-age="))
                .find_map(|age| age.trim().parse().ok())
            {
                max_age = age;
            }
        }
    }
    let location = location.ok_or_else(|| Error::Discovery("missing LOCATION header".into()))?;
    Ok(SearchResponse {
        location: Url::parse(&location)?,
        service_type,
        unique_service_name,
        max_age,
    })
}

/// Runs SSDP search rounds and fetches the descriptors they point at
#[derive(Clone)]
pub(crate) struct Discovery {
    http: Client,
    timeout: Duration,
}

impl Discovery {
    pub fn new(http: Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    /// One search round; discovered devices arrive on the returned channel
    /// as their descriptors resolve
    pub fn search(&self, family: Option<Family>) -> mpsc::Receiver<DiscoveredService> {
        let (tx, rx) = mpsc::channel(4);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.search_round(family, tx).await {
                warn!("SSDP search failed: {e}");
            }
        });
        rx
    }

    async fn search_round(
        &self,
        family: Option<Family>,
        tx: mpsc::Sender<DiscoveredService>,
    ) -> Result<()> {
        let mut sockets = Vec::new();
        if family != Some(Family::V6) {
            match open_search_socket("0.0.0.0:0", SSDP_V4).await {
                Ok(socket) => sockets.push(socket),
                Err(e) => debug!("IPv4 SSDP socket unavailable: {e}"),
            }
        }
        if family != Some(Family::V4) {
            match open_search_socket("[::]:0", SSDP_V6).await {
                Ok(socket) => sockets.push(socket),
                Err(e) => debug!("IPv6 SSDP socket unavailable: {e}"),
            }
        }
        if sockets.is_empty() {
            return Err(Error::GatewayNotResolved);
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut seen: HashSet<Url> = HashSet::new();
        let mut buf = [0u8; 2048];
        'outer: loop {
            // all sockets share one deadline; poll them in turn
            for socket in &sockets {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break 'outer;
                }
                let per_socket = remaining.min(Duration::from_millis(250));
                let Ok(Ok((n, from))) =
                    tokio::time::timeout(per_socket, socket.recv_from(&mut buf)).await
                else {
                    continue;
                };
                let answer = match parse_search_response(&buf[..n]) {
                    Ok(answer) => answer,
                    Err(e) => {
                        debug!(%from, "ignoring SSDP answer: {e}");
                        continue;
                    }
                };
                if !seen.insert(answer.location.clone()) {
                    continue;
                }
                match self.fetch(answer).await {
                    Ok(service) => {
                        if tx.send(service).await.is_err() {
                            break 'outer;
                        }
                    }
                    Err(e) => warn!("failed to fetch device descriptor: {e}"),
                }
            }
        }
        Ok(())
    }

    async fn fetch(&self, answer: SearchResponse) -> Result<DiscoveredService> {
        let xml = self
            .http
            .get(answer.location.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let details = parse_descriptor(&xml)?;
        Ok(DiscoveredService {
            location: answer.location,
            details,
            service_type: answer.service_type,
            unique_service_name: answer.unique_service_name,
            expires: unix_ms() + answer.max_age * 1000,
        })
    }

    /// Searches again for a previously seen device, constrained to its
    /// unique service name and address family
    pub async fn rediscover(&self, usn: &str, family: Family) -> Option<DiscoveredService> {
        let mut rx = self.search(Some(family));
        while let Some(service) = rx.recv().await {
            let matches_family = match service.location.host() {
                Some(url::Host::Ipv6(_)) => family == Family::V6,
                Some(_) => family == Family::V4,
                None => false,
            };
            if matches_family && service.unique_service_name == usn {
                return Some(service);
            }
        }
        None
    }
}

async fn open_search_socket(bind: &str, group: &str) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(bind).await?;
    let group: SocketAddr = group
        .parse()
        .map_err(|_| Error::Discovery("bad multicast group".into()))?;
    socket
        .send_to(search_request(IGD_DEVICE_2, &group.to_string()).as_bytes(), group)
        .await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_request_is_a_valid_msearch() {
        let request = search_request(IGD_DEVICE_2, "239.255.255.250:1900");
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("Man: \"ssdp:discover\"\r\n"));
        assert!(request.contains("ST: urn:schemas-upnp-org:device:InternetGatewayDevice:2\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn parses_a_search_answer() {
        let raw = b"HTTP/1.1 200 OK\r\n\
            CACHE-CONTROL: max-age=120\r\n\
            LOCATION: http://192.168.1.1:5000/rootDesc.xml\r\n\
            ST: urn:schemas-upnp-org:device:InternetGatewayDevice:2\r\n\
            USN: uuid:1234::urn:schemas-upnp-org:device:InternetGatewayDevice:2\r\n\
            \r\n";
        let answer = parse_search_response(raw).unwrap();
        assert_eq!(
            answer.location.as_str(),
            "http://192.168.1.1:5000/rootDesc.xml"
        );
        assert_eq!(answer.max_age, 120);
        assert!(answer.unique_service_name.starts_with("uuid:1234"));
    }

    #[test]
    fn missing_location_or_bad_status_is_rejected() {
        assert!(parse_search_response(b"HTTP/1.1 404 Not Found\r\n\r\n").is_err());
        assert!(parse_search_response(b"HTTP/1.1 200 OK\r\nST: x\r\n\r\n").is_err());
    }

    #[test]
    fn max_age_defaults_when_absent() {
        let raw = b"HTTP/1.1 200 OK\r\n\
            LOCATION: http://192.168.1.1:5000/rootDesc.xml\r\n\
            \r\n";
        let answer = parse_search_response(raw).unwrap();
        assert_eq!(answer.max_age, DEFAULT_MAX_AGE);
    }
}
