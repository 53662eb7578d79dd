//! Socket helpers shared by the ICE agent and the transmitters.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use systemstat::{Platform, System};

/// How long a blocking read waits before checking whether the socket was closed.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Biggest datagram we expect to receive.
pub(crate) const DATAGRAM_MAX: usize = 65_535;

/// Addresses of the local network interfaces, IPv4 first.
///
/// Loopback addresses are only included when there is nothing else.
pub(crate) fn host_addresses() -> io::Result<Vec<IpAddr>> {
    let system = System::new();
    let networks = system.networks()?;

    let mut v4 = vec![];
    let mut v6 = vec![];
    let mut loopback = vec![];

    for net in networks.values() {
        for n in &net.addrs {
            let ip = match n.addr {
                systemstat::IpAddr::V4(v) => IpAddr::V4(v),
                systemstat::IpAddr::V6(v) => IpAddr::V6(v),
                _ => continue,
            };
            if !is_usable(ip) {
                continue;
            }
            if ip.is_loopback() {
                loopback.push(ip);
            } else if ip.is_ipv4() {
                v4.push(ip);
            } else {
                v6.push(ip);
            }
        }
    }

    v4.append(&mut v6);
    if v4.is_empty() {
        loopback.sort_by_key(|ip| !ip.is_ipv4());
        return Ok(loopback);
    }
    v4.dedup();
    Ok(v4)
}

fn is_usable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v) => !v.is_unspecified() && !v.is_broadcast() && !v.is_link_local(),
        // Link local IPv6 needs a scope id to be bound.
        IpAddr::V6(v) => !v.is_unspecified() && (v.segments()[0] & 0xffc0) != 0xfe80,
    }
}

/// Bind a UDP socket to the given address.
///
/// With `reuse`, several sockets can be bound to the same address (multicast).
pub(crate) fn bind_udp(addr: SocketAddr, reuse: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    if reuse {
        socket.set_reuse_address(true)?;
        set_reuse_port(&socket)?;
    }
    socket.bind(&addr.into())?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    Ok(socket)
}

/// Bind a UDP socket on `ip` to the first free port in `min..=max`.
pub(crate) fn bind_udp_in_range(ip: IpAddr, min: u16, max: u16) -> io::Result<UdpSocket> {
    let mut last_err = None;
    for port in min..=max {
        match bind_udp(SocketAddr::new(ip, port), false) {
            Ok(v) => return Ok(v),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "empty port range")))
}

/// Apply the type of service to a socket.
///
/// Failing to do so is not fatal, it is only logged.
pub(crate) fn set_tos(socket: &UdpSocket, tos: u8) {
    let sock = SockRef::from(socket);
    let is_v6 = socket.local_addr().map(|a| a.is_ipv6()).unwrap_or(false);

    if is_v6 {
        set_tclass(&sock, tos);
    } else if let Err(e) = sock.set_tos(tos as u32) {
        warn!("Could not set TOS on socket: {}", e);
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_tclass(sock: &SockRef<'_>, tos: u8) {
    if let Err(e) = sock.set_tclass_v6(tos as u32) {
        warn!("Could not set TCLASS on socket: {}", e);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_tclass(_sock: &SockRef<'_>, _tos: u8) {
    warn!("TCLASS is not supported on this platform");
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

/// Join the multicast group `group` on the interface `local`.
pub(crate) fn join_multicast(socket: &UdpSocket, group: IpAddr, local: IpAddr) -> io::Result<()> {
    match (group, local) {
        (IpAddr::V4(g), IpAddr::V4(l)) => socket.join_multicast_v4(&g, &l),
        (IpAddr::V4(g), _) => socket.join_multicast_v4(&g, &Ipv4Addr::UNSPECIFIED),
        (IpAddr::V6(g), _) => socket.join_multicast_v6(&g, 0),
    }
}

/// Leave the multicast group `group` on the interface `local`.
pub(crate) fn leave_multicast(socket: &UdpSocket, group: IpAddr, local: IpAddr) -> io::Result<()> {
    match (group, local) {
        (IpAddr::V4(g), IpAddr::V4(l)) => socket.leave_multicast_v4(&g, &l),
        (IpAddr::V4(g), _) => socket.leave_multicast_v4(&g, &Ipv4Addr::UNSPECIFIED),
        (IpAddr::V6(g), _) => socket.leave_multicast_v6(&g, 0),
    }
}

/// Set the multicast time to live (hop limit for IPv6) and turn on loopback.
pub(crate) fn set_multicast_ttl(socket: &UdpSocket, group: IpAddr, ttl: u8) -> io::Result<()> {
    match group {
        IpAddr::V4(_) => {
            socket.set_multicast_ttl_v4(ttl as u32)?;
            socket.set_multicast_loop_v4(true)
        }
        IpAddr::V6(_) => {
            SockRef::from(socket).set_multicast_hops_v6(ttl as u32)?;
            socket.set_multicast_loop_v6(true)
        }
    }
}

/// Tells if a receive error is just the read timeout.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bind_in_range_skips_taken() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let a = bind_udp(SocketAddr::new(ip, 0), false).unwrap();
        let taken = a.local_addr().unwrap().port();

        // A range of a single taken port fails.
        assert!(bind_udp_in_range(ip, taken, taken).is_err());
    }

    #[test]
    fn link_local_is_not_usable() {
        assert!(!is_usable("fe80::1".parse().unwrap()));
        assert!(!is_usable("169.254.1.1".parse().unwrap()));
        assert!(is_usable("127.0.0.1".parse().unwrap()));
        assert!(is_usable("2001:db8::1".parse().unwrap()));
    }
}
