//! Network readiness probing for gated autostart.
use std::net::{IpAddr, SocketAddr, UdpSocket};
use tracing::debug;

/// Answers whether outbound networking looks usable.
pub trait NetworkProbe: Send {
    fn is_ready(&self) -> bool;
}

/// Asks the kernel which local address would route to a public host.
///
/// Connecting a UDP socket sends nothing; it only selects a route. A loopback or
/// link-local choice means no real interface is up yet. Unexpected failures report ready.
#[derive(Debug, Clone)]
pub struct RouteProbe {
    target: SocketAddr,
}

impl Default for RouteProbe {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([8, 8, 8, 8], 53)),
        }
    }
}

impl RouteProbe {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl NetworkProbe for RouteProbe {
    fn is_ready(&self) -> bool {
        let bind: SocketAddr = if self.target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = match UdpSocket::bind(bind) {
            Ok(socket) => socket,
            Err(err) => {
                debug!("Network probe could not bind: {err}; assuming ready");
                return true;
            }
        };

        if let Err(err) = socket.connect(self.target) {
            // ENETUNREACH and friends: there is no route yet.
            debug!("Network probe found no route to {}: {err}", self.target);
            return false;
        }

        match socket.local_addr() {
            Ok(local) => is_routable(local.ip()),
            Err(err) => {
                debug!("Network probe could not read local address: {err}; assuming ready");
                true
            }
        }
    }
}

fn is_routable(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => !v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

/// Probe with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

impl NetworkProbe for StaticProbe {
    fn is_ready(&self) -> bool {
        self.0
    }
}
