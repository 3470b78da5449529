//! Multicast sockets: a receive endpoint joined to a group, and a send endpoint with a bounded
//!  multicast TTL. The relay logic only sees the [DatagramReceiver] and [DatagramSender] traits,
//!  which allows testing it without real network I/O.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

pub mod receive_endpoint;
pub mod send_endpoint;

/// Receiving side of a relay direction.
#[async_trait]
pub trait DatagramReceiver: Send + Sync + 'static {
    /// Waits for the next datagram and copies it into `buf`, returning its length and sender.
    ///  Datagrams longer than `buf` are truncated.
    async fn receive(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Sending side of a relay direction. This is an abstraction for sending a datagram to a
///  multicast group, introduced to facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSender: Send + Sync + 'static {
    async fn send(&self, payload: &[u8], destination: SocketAddrV4) -> io::Result<()>;
}
