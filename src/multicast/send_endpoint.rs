use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{bail, Context};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, trace};

use crate::multicast::DatagramSender;

/// A UDP socket for sending to multicast groups, optionally pinned to an outbound interface.
pub struct SendEndpoint {
    socket: UdpSocket,
}

impl SendEndpoint {
    pub const DEFAULT_TTL: u32 = 16;

    /// `interface` is the local address of the outbound interface, `0.0.0.0` uses the OS's
    ///  default. `ttl` limits the number of hops so traffic stays inside the intended network.
    ///
    /// NB: This must be called from inside a Tokio runtime
    pub fn open(interface: Ipv4Addr, ttl: u32) -> anyhow::Result<SendEndpoint> {
        if ttl == 0 || ttl > 255 {
            bail!("multicast TTL must be between 1 and 255, was {}", ttl);
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if !interface.is_unspecified() {
            socket.set_multicast_if_v4(&interface)
                .with_context(|| format!("cannot use interface {} for sending multicast", interface))?;
        }
        socket.set_multicast_ttl_v4(ttl)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        socket.bind(&bind_addr.into())
            .context("cannot bind multicast send socket")?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!("opened multicast send socket on interface {} with TTL {}", interface, ttl);

        Ok(SendEndpoint { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl DatagramSender for SendEndpoint {
    async fn send(&self, payload: &[u8], destination: SocketAddrV4) -> io::Result<()> {
        trace!("sending {} bytes to {}", payload.len(), destination);

        let num_sent = self.socket.send_to(payload, destination).await?;
        if num_sent != payload.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, format!("datagram truncated: sent {} of {} bytes", num_sent, payload.len())));
        }
        Ok(())
    }
}
