//! SOAP envelopes for IGD control points.
//!
//! Requests are HTTP POSTs of a small envelope to the service's control
//! URL; argument order inside the action element is significant and is
//! taken from the IGD spec. Responses are parsed as XML and the action's
//! response element is located by local-name suffix match, so namespace
//! prefixes chosen by the gateway do not matter. Error responses carry a
//! `UPnPError` fragment with a numeric code and a description.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use url::Url;

use crate::error::{Error, Result};

pub(crate) fn envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let mut arguments = String::new();
    for (name, value) in args {
        let value = quick_xml::escape::escape(value.as_str());
        arguments.push_str(&format!("<{name}>{value}</{name}>"));
    }
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <u:{action} xmlns:u="{service_type}">{arguments}</u:{action}>
  </s:Body>
</s:Envelope>"#
    )
}

/// Invokes one action and returns the response values keyed by their
/// local element names
pub(crate) async fn call(
    http: &Client,
    control_url: &Url,
    service_type: &str,
    action: &str,
    args: &[(&str, String)],
) -> Result<HashMap<String, String>> {
    let body = envelope(service_type, action, args);
    let response = http
        .post(control_url.clone())
        .header("content-type", "text/xml")
        .header("soapaction", format!("\"{service_type}#{action}\""))
        .body(body)
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        if let Some((code, message)) = parse_fault(&text) {
            return Err(Error::Gateway { code, message });
        }
        return Err(Error::Soap(format!("{action} failed with HTTP {status}")));
    }
    parse_response(&text, action)
}

/// Extracts the children of the `<X:{action}Response>` element. The
/// element is matched on its local name so `m:`, `u:` or any other prefix
/// works.
pub(crate) fn parse_response(xml: &str, action: &str) -> Result<HashMap<String, String>> {
    let wanted = format!("{action}Response");
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut current: Option<String> = None;
    let mut values = HashMap::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if inside {
                    current = Some(local);
                } else if local == wanted {
                    inside = true;
                }
            }
            Ok(Event::Empty(e)) => {
                if inside {
                    let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    values.insert(local, String::new());
                }
            }
            Ok(Event::Text(t)) => {
                if let (true, Some(name)) = (inside, current.as_ref()) {
                    let value = t
                        .unescape()
                        .map_err(|e| Error::Soap(e.to_string()))?
                        .into_owned();
                    values.insert(name.clone(), value);
                }
            }
            Ok(Event::End(e)) => {
                if inside && e.local_name().as_ref() == wanted.as_bytes() {
                    return Ok(values);
                }
                current = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Soap(e.to_string())),
            Ok(_) => {}
        }
    }
    Err(Error::Soap(format!("missing {wanted} element")))
}

/// Looks for a `UPnPError` fragment in a fault response
pub(crate) fn parse_fault(xml: &str) -> Option<(u16, String)> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut current: Option<String> = None;
    let mut code: Option<u16> = None;
    let mut description = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Text(t)) => {
                let value = t.unescape().ok()?;
                match current.as_deref() {
                    Some("errorCode") => code = value.parse().ok(),
                    Some("errorDescription") => description = value.into_owned(),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(_) => return None,
            Ok(_) => {}
        }
    }
    code.map(|code| (code, description))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_preserves_argument_order_and_escapes_values() {
        let body = envelope(
            "urn:schemas-upnp-org:service:WANIPConnection:2",
            "AddPortMapping",
            &[
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", "8080".to_string()),
                ("NewPortMappingDescription", "a <b> & c".to_string()),
            ],
        );
        let remote = body.find("<NewRemoteHost>").unwrap();
        let port = body.find("<NewExternalPort>").unwrap();
        let desc = body.find("<NewPortMappingDescription>").unwrap();
        assert!(remote < port && port < desc);
        assert!(body.contains("a &lt;b&gt; &amp; c"));
        assert!(body.contains(
            r#"<u:AddPortMapping xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:2">"#
        ));
    }

    #[test]
    fn response_lookup_tolerates_namespace_prefixes() {
        let xml = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <m:AddAnyPortMappingResponse xmlns:m="urn:schemas-upnp-org:service:WANIPConnection:2">
      <NewReservedPort>51234</NewReservedPort>
    </m:AddAnyPortMappingResponse>
  </s:Body>
</s:Envelope>"#;
        let values = parse_response(xml, "AddAnyPortMapping").unwrap();
        assert_eq!(values["NewReservedPort"], "51234");
    }

    #[test]
    fn empty_elements_become_empty_values() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetExternalIPAddressResponse xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:1">
      <NewExternalIPAddress/>
    </u:GetExternalIPAddressResponse>
  </s:Body>
</s:Envelope>"#;
        let values = parse_response(xml, "GetExternalIPAddress").unwrap();
        assert_eq!(values["NewExternalIPAddress"], "");
    }

    #[test]
    fn the_wrong_response_element_is_an_error() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body><u:DeletePortMappingResponse xmlns:u="x"/></s:Body>
</s:Envelope>"#;
        assert!(parse_response(xml, "AddPortMapping").is_err());
    }

    #[test]
    fn faults_carry_code_and_description() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>718</errorCode>
          <errorDescription>ConflictInMappingEntry</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;
        assert_eq!(
            parse_fault(xml),
            Some((718, "ConflictInMappingEntry".to_string()))
        );
        assert_eq!(parse_fault("<no-fault/>"), None);
    }
}
