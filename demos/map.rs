use std::net::IpAddr;

use nat_port_mapper::{pcp_nat, Gateway, MapOptions, PcpNatOptions, StopOptions};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let gateway_ip: IpAddr = args
        .next()
        .unwrap_or_else(|| "192.168.1.1".to_string())
        .parse()?;
    let host: IpAddr = args
        .next()
        .unwrap_or_else(|| "192.168.1.101".to_string())
        .parse()?;

    let gateway = pcp_nat(gateway_ip, PcpNatOptions::default()).await?;

    // Map any incoming request on TCP port 6000 to this host
    let mapping = gateway.map(6000, host, MapOptions::default()).await?;
    println!(
        "mapped {}:{} -> {}:{} ({})",
        mapping.external_host,
        mapping.external_port,
        mapping.internal_host,
        mapping.internal_port,
        mapping.protocol,
    );

    // Hold the mapping for a while; the gateway renews it on its own
    tokio::time::sleep(std::time::Duration::from_secs(120)).await;

    gateway.stop(StopOptions::default()).await?;
    Ok(())
}
