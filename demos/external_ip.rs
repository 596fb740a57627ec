use std::net::IpAddr;

use futures::StreamExt;
use nat_port_mapper::{upnp_nat, Gateway, MapOptions, UpnpNatOptions};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Ask every IGD on the local network for its external address
    let client = upnp_nat(UpnpNatOptions::default());
    let mut gateways = client.find_gateways(UpnpNatOptions::default());
    while let Some(gateway) = gateways.next().await {
        match gateway {
            Ok(gateway) => {
                let ip: IpAddr = gateway.external_ip(MapOptions::default()).await?;
                println!("external address: {ip}");
            }
            Err(e) => eprintln!("discovery failed: {e}"),
        }
    }
    Ok(())
}
