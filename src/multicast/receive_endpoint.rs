use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{bail, Context};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::multicast::DatagramReceiver;

/// A UDP socket bound to a port on all local interfaces and joined to a multicast group on a
///  specific interface.
pub struct ReceiveEndpoint {
    socket: UdpSocket,
    group: Ipv4Addr,
    interface: Ipv4Addr,
}

impl ReceiveEndpoint {
    /// Creates the socket and joins the group. `interface` is the address of the local interface
    ///  to join on, `0.0.0.0` leaves the choice to the OS.
    ///
    /// `multicast_loop` enables delivery of multicast traffic that originates on this host, which
    ///  is typically required when sender and relay run on the same machine.
    ///
    /// NB: This must be called from inside a Tokio runtime
    pub fn open(group: Ipv4Addr, port: u16, interface: Ipv4Addr, multicast_loop: bool) -> anyhow::Result<ReceiveEndpoint> {
        if !group.is_multicast() {
            bail!("{} is not a multicast group address", group);
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // several relays (or a relay and a local consumer) may listen on the same group / port
        socket.set_reuse_address(true)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&bind_addr.into())
            .with_context(|| format!("cannot bind multicast receive socket to {}", bind_addr))?;
        socket.join_multicast_v4(&group, &interface)
            .with_context(|| format!("cannot join multicast group {} on interface {}", group, interface))?;
        socket.set_multicast_loop_v4(multicast_loop)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!("joined multicast group {}:{} on interface {}", group, port, interface);

        Ok(ReceiveEndpoint {
            socket,
            group,
            interface,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl DatagramReceiver for ReceiveEndpoint {
    async fn receive(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

impl Drop for ReceiveEndpoint {
    fn drop(&mut self) {
        // the OS leaves the group when the socket is closed anyway, this is for the log
        match self.socket.leave_multicast_v4(self.group, self.interface) {
            Ok(()) => debug!("left multicast group {} on interface {}", self.group, self.interface),
            Err(e) => warn!("error leaving multicast group {} on interface {}: {}", self.group, self.interface, e),
        }
    }
}
