use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Best-effort discovery of the address other hosts on the network can use
/// to reach this machine. Falls back to loopback.
pub fn local_ip() -> IpAddr {
    match discover_local_ip() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            tracing::debug!(error = %e, "Could not determine local IP, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Connecting a UDP socket sends nothing but makes the OS pick the outbound
/// interface, whose address is then readable from the socket.
fn discover_local_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    Ok(socket.local_addr()?.ip())
}

/// URL clients should use for a listener bound to `addr`.
pub fn public_url(addr: SocketAddr) -> String {
    let ip = if addr.ip().is_unspecified() {
        local_ip()
    } else {
        addr.ip()
    };
    format!("http://{}", SocketAddr::new(ip, addr.port()))
}
