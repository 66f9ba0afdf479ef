//! UDP data plane: one socket per device.
//!
//! Packet forwarding is not implemented here. The data plane owns the bound
//! sockets so the control plane can rebind them, and sends keepalives to
//! peer endpoints.

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};

use veil_control::{DataPlane, Device, NetnsRef, Peer};

pub struct UdpDataPlane {
    /// Namespace the daemon's sockets live in.
    home: u64,
    sockets: DashMap<String, Socket>,
}

impl UdpDataPlane {
    pub fn new(home: NetnsRef) -> Self {
        Self {
            home: home.id,
            sockets: DashMap::new(),
        }
    }

    /// Close every socket.
    pub fn close_all(&self) {
        self.sockets.clear();
    }
}

impl DataPlane for UdpDataPlane {
    fn rebind(&self, device: &Device, netns: NetnsRef, port: u16) -> io::Result<u16> {
        if netns.id != self.home {
            // Sockets can only be opened in the namespace the daemon runs in.
            return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP));
        }
        let socket = make_socket(port)?;
        let bound = socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.port())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EAFNOSUPPORT))?;
        // The previous socket closes when replaced.
        self.sockets.insert(device.name().to_string(), socket);
        tracing::debug!(device = %device.name(), port = bound, "udp socket bound");
        Ok(bound)
    }

    fn send_keepalive(&self, peer: &Peer) {
        let (Some(device), Some(addr)) = (peer.device(), peer.endpoint().addr) else {
            return;
        };
        let Some(socket) = self.sockets.get(device.name()) else {
            return;
        };
        let dest = match addr {
            SocketAddr::V4(v4) => SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0)),
            v6 => v6,
        };
        match socket.send_to(&[], &dest.into()) {
            Ok(_) => tracing::trace!(peer = %hex::encode(peer.public_key()), %addr, "keepalive sent"),
            Err(e) => tracing::warn!(peer = %hex::encode(peer.public_key()), %addr, error = %e, "keepalive failed"),
        }
    }

    fn send_staged(&self, peer: &Peer) {
        tracing::trace!(peer = %hex::encode(peer.public_key()), "no staged packets");
    }
}

/// Dual-stack UDP socket on `port` (0 = ephemeral).
fn make_socket(port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)).into())?;
    Ok(socket)
}
