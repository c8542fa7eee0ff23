use anyhow::Result;
use get_if_addrs::get_if_addrs;
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, info};

pub fn get_first_non_loopback_interface() -> Result<IpAddr> {
    get_if_addrs()?
        .iter()
        .find(|i| !i.is_loopback())
        .map(|i| match i.addr {
            get_if_addrs::IfAddr::V4(ref addr) => Ok(std::net::IpAddr::V4(addr.ip)),
            _ => Err(anyhow::anyhow!("No IPv4 address found")),
        })
        .unwrap_or(Err(anyhow::anyhow!("No interface found")))
}

/// Local address the OS would use to reach `host` (`ip`, `ip:port` or a
/// hostname). No packet is sent.
pub async fn local_ip_towards(host: &str) -> Result<IpAddr> {
    let target = resolve_target(host).await?;
    let bind: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    let local = socket.local_addr()?.ip();
    debug!(%host, %local, "local address towards phone");
    Ok(local)
}

async fn resolve_target(host: &str) -> Result<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 80));
    }
    let lookup = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:80", host)
    };
    tokio::net::lookup_host(lookup)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("cannot resolve {}", host))
}

/// Host the phone should use to reach the callback server: the configured
/// one, else the interface routing to the phone, else the first non-loopback
/// interface.
pub async fn advertise_host(configured: Option<&str>, phone_host: &str) -> Result<String> {
    if let Some(host) = configured.filter(|h| !h.trim().is_empty()) {
        return Ok(host.trim().to_string());
    }
    let ip = match local_ip_towards(phone_host).await {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => get_first_non_loopback_interface()?,
    };
    info!(%ip, "advertising callback host");
    Ok(match ip {
        IpAddr::V6(v6) => format!("[{}]", v6),
        IpAddr::V4(v4) => v4.to_string(),
    })
}
