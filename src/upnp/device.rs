//! UPnP device descriptor model.
//!
//! An IGD advertises a tree of embedded devices, each with its own service
//! list. The mapping services live a couple of levels down (root →
//! WANDevice → WANConnectionDevice), so service lookup walks the whole
//! tree. Control URLs in descriptors are frequently relative and are
//! absolutised against the descriptor's own URL.

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};
use crate::gateway::Family;

/// Service type for IPv4 port mappings, IGD version 2
pub const WAN_IP_CONNECTION_2: &str = "urn:schemas-upnp-org:service:WANIPConnection:2";

/// Service type for IPv4 port mappings, IGD version 1
pub const WAN_IP_CONNECTION_1: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// Service type for IPv6 firewall pinholes
pub const WAN_IPV6_FIREWALL: &str = "urn:schemas-upnp-org:service:WANIPv6FirewallControl:1";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RootDescriptor {
    #[serde(rename = "device")]
    pub device: Device,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Device {
    #[serde(rename = "deviceType", default)]
    pub device_type: String,
    #[serde(rename = "friendlyName", default)]
    pub friendly_name: String,
    #[serde(rename = "UDN", default)]
    pub udn: String,
    #[serde(rename = "serviceList", default)]
    pub service_list: ServiceList,
    #[serde(rename = "deviceList", default)]
    pub device_list: DeviceList,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct DeviceList {
    #[serde(rename = "device", default)]
    pub devices: Vec<Device>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ServiceList {
    #[serde(rename = "service", default)]
    pub services: Vec<Service>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Service {
    #[serde(rename = "serviceType")]
    pub service_type: String,
    #[serde(rename = "controlURL")]
    pub control_url: String,
    #[serde(rename = "SCPDURL", default)]
    pub scpd_url: String,
}

impl Device {
    /// All services of this device and its embedded devices
    pub fn iter_services(&self) -> Box<dyn Iterator<Item = &Service> + '_> {
        Box::new(
            self.service_list.services.iter().chain(
                self.device_list
                    .devices
                    .iter()
                    .flat_map(|d| d.iter_services()),
            ),
        )
    }
}

pub fn parse_descriptor(xml: &str) -> Result<RootDescriptor> {
    Ok(quick_xml::de::from_str(xml)?)
}

/// Which generation of the IGD spec the resolved service belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgdVersion {
    V1,
    V2,
}

/// The mapping service this gateway drives, with its absolute control URL
#[derive(Clone, Debug)]
pub struct ResolvedService {
    pub service_type: String,
    pub control_url: Url,
    pub version: IgdVersion,
}

/// Picks the mapping service for the family out of a parsed descriptor,
/// preferring IGDv2 over IGDv1 for IPv4
pub fn resolve_service(
    root: &RootDescriptor,
    base: &Url,
    family: Family,
) -> Result<ResolvedService> {
    let wanted: &[(&str, IgdVersion)] = match family {
        Family::V4 => &[
            (WAN_IP_CONNECTION_2, IgdVersion::V2),
            (WAN_IP_CONNECTION_1, IgdVersion::V1),
        ],
        Family::V6 => &[(WAN_IPV6_FIREWALL, IgdVersion::V2)],
    };
    for (service_type, version) in wanted {
        if let Some(service) = root
            .device
            .iter_services()
            .find(|s| s.service_type == *service_type)
        {
            return Ok(ResolvedService {
                service_type: service_type.to_string(),
                control_url: base.join(&service.control_url)?,
                version: *version,
            });
        }
    }
    Err(Error::NoService)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const DESCRIPTOR: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:2</deviceType>
    <friendlyName>Test Router</friendlyName>
    <UDN>uuid:11111111-2222-3333-4444-555555555555</UDN>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:2</deviceType>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:2</deviceType>
            <serviceList>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPConnection:2</serviceType>
                <controlURL>/upnp/control/WANIPConn1</controlURL>
                <SCPDURL>/WANIPConnection.xml</SCPDURL>
              </service>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPv6FirewallControl:1</serviceType>
                <controlURL>http://192.168.1.1:49000/upnp/control/WANIPv6Fw1</controlURL>
                <SCPDURL>/WANIPv6FirewallControl.xml</SCPDURL>
              </service>
            </serviceList>
          </device>
        </deviceList>
      </device>
    </deviceList>
  </device>
</root>"#;

    #[test]
    fn parses_a_nested_descriptor() {
        let root = parse_descriptor(DESCRIPTOR).unwrap();
        assert_eq!(root.device.friendly_name, "Test Router");
        assert_eq!(
            root.device.udn,
            "uuid:11111111-2222-3333-4444-555555555555"
        );
        let types: Vec<_> = root
            .device
            .iter_services()
            .map(|s| s.service_type.as_str())
            .collect();
        assert_eq!(types, vec![WAN_IP_CONNECTION_2, WAN_IPV6_FIREWALL]);
    }

    #[test]
    fn resolves_relative_and_absolute_control_urls() {
        let root = parse_descriptor(DESCRIPTOR).unwrap();
        let base: Url = "http://192.168.1.1:5000/rootDesc.xml".parse().unwrap();

        let v4 = resolve_service(&root, &base, Family::V4).unwrap();
        assert_eq!(v4.version, IgdVersion::V2);
        assert_eq!(
            v4.control_url.as_str(),
            "http://192.168.1.1:5000/upnp/control/WANIPConn1"
        );

        let v6 = resolve_service(&root, &base, Family::V6).unwrap();
        assert_eq!(
            v6.control_url.as_str(),
            "http://192.168.1.1:49000/upnp/control/WANIPv6Fw1"
        );
    }

    #[test]
    fn falls_back_to_igdv1() {
        let v1_only = DESCRIPTOR.replace("WANIPConnection:2", "WANIPConnection:1");
        let root = parse_descriptor(&v1_only).unwrap();
        let base: Url = "http://192.168.1.1:5000/rootDesc.xml".parse().unwrap();
        let service = resolve_service(&root, &base, Family::V4).unwrap();
        assert_eq!(service.version, IgdVersion::V1);
        assert_eq!(service.service_type, WAN_IP_CONNECTION_1);
    }

    #[test]
    fn missing_service_is_an_error() {
        let none = DESCRIPTOR
            .replace("WANIPConnection:2", "WANEthernetLinkConfig:1")
            .replace("WANIPv6FirewallControl:1", "WANEthernetLinkConfig:1");
        let root = parse_descriptor(&none).unwrap();
        let base: Url = "http://192.168.1.1:5000/".parse().unwrap();
        assert!(matches!(
            resolve_service(&root, &base, Family::V4),
            Err(Error::NoService)
        ));
    }
}
