use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::multicast::{DatagramReceiver, DatagramSender};

/// The sender address reported for injected datagrams
pub const TEST_PEER_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 40_000);

enum Injected {
    Datagram(Vec<u8>),
    Error(io::ErrorKind),
    Panic,
}

/// Creates a [DatagramReceiver] that returns whatever is injected through the returned
///  [DatagramInjector]. When the injector is dropped, the receiver waits forever like an idle
///  socket would.
pub fn channel_receiver() -> (DatagramInjector, ChannelReceiver) {
    let (send, recv) = mpsc::unbounded_channel();
    (
        DatagramInjector { send },
        ChannelReceiver { recv: tokio::sync::Mutex::new(recv) },
    )
}

#[derive(Clone)]
pub struct DatagramInjector {
    send: mpsc::UnboundedSender<Injected>,
}
impl DatagramInjector {
    pub fn inject(&self, payload: &[u8]) {
        let _ = self.send.send(Injected::Datagram(payload.to_vec()));
    }

    /// the next call to `receive()` fails with an error of this kind
    pub fn inject_error(&self, kind: io::ErrorKind) {
        let _ = self.send.send(Injected::Error(kind));
    }

    /// the next call to `receive()` panics, simulating a bug in the receive path
    pub fn inject_panic(&self) {
        let _ = self.send.send(Injected::Panic);
    }
}

pub struct ChannelReceiver {
    recv: tokio::sync::Mutex<mpsc::UnboundedReceiver<Injected>>,
}

#[async_trait]
impl DatagramReceiver for ChannelReceiver {
    async fn receive(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut recv = self.recv.lock().await;
        match recv.recv().await {
            Some(Injected::Datagram(payload)) => {
                // truncate like a UDP socket does
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                Ok((len, TEST_PEER_ADDR.into()))
            }
            Some(Injected::Error(kind)) => Err(io::Error::new(kind, "injected receive error")),
            Some(Injected::Panic) => panic!("injected receive panic"),
            None => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub at: Instant,
    pub destination: SocketAddrV4,
    pub payload: Vec<u8>,
}

/// A [DatagramSender] that records every datagram it is asked to send, together with the
///  (Tokio) time of sending
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentDatagram>>,
    num_pending_failures: AtomicUsize,
    on_sent: Notify,
}

impl RecordingSender {
    pub fn new() -> RecordingSender {
        Default::default()
    }

    /// the next `n` sends fail without recording anything
    pub fn fail_next(&self, n: usize) {
        self.num_pending_failures.store(n, Ordering::SeqCst);
    }

    fn lock_sent(&self) -> MutexGuard<'_, Vec<SentDatagram>> {
        self.sent.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sent(&self) -> Vec<SentDatagram> {
        self.lock_sent().clone()
    }

    pub fn num_sent(&self) -> usize {
        self.lock_sent().len()
    }

    /// Waits until at least `n` datagrams were sent, returning all datagrams sent so far
    pub async fn wait_for_sent(&self, n: usize) -> Vec<SentDatagram> {
        loop {
            // NB: register before checking so a send in between is not missed
            let notified = self.on_sent.notified();
            if self.num_sent() >= n {
                return self.sent();
            }
            notified.await;
        }
    }
}

#[async_trait]
impl DatagramSender for RecordingSender {
    async fn send(&self, payload: &[u8], destination: SocketAddrV4) -> io::Result<()> {
        let should_fail = self.num_pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(io::Error::new(io::ErrorKind::Other, "injected send error"));
        }

        self.lock_sent().push(SentDatagram {
            at: Instant::now(),
            destination,
            payload: payload.to_vec(),
        });
        self.on_sent.notify_waiters();
        Ok(())
    }
}
