use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use crate::relay::relay_config::OverflowPolicy;

/// A datagram waiting for its emission time. `sequence` is assigned on admission, it keeps
///  datagrams with identical emission times in arrival order.
#[derive(Debug, Clone)]
pub struct ScheduledPacket {
    pub scheduled_at: Instant,
    pub sequence: u64,
    pub payload: Bytes,
}

impl PartialEq for ScheduledPacket {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for ScheduledPacket {}

impl PartialOrd for ScheduledPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scheduled_at.cmp(&other.scheduled_at)
            .then(self.sequence.cmp(&other.sequence))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// the queue was full, and the incoming datagram was discarded
    Rejected,
    /// the queue was full, and the datagram due first was discarded to make room
    DisplacedOldest,
}

/// A per-direction queue of datagrams ordered by emission time (earliest first).
///
/// The delay can change while datagrams are waiting, so a datagram admitted later may be due
///  earlier than the datagrams already in the queue. [ScheduleQueue::next_due] therefore wakes
///  up on every admission and re-checks which datagram is due first.
pub struct ScheduleQueue {
    inner: Mutex<QueueInner>,
    admitted: Notify,
    capacity: Option<usize>,
    overflow_policy: OverflowPolicy,
}

struct QueueInner {
    heap: BinaryHeap<Reverse<ScheduledPacket>>,
    next_sequence: u64,
}

impl ScheduleQueue {
    pub fn new(capacity: Option<usize>, overflow_policy: OverflowPolicy) -> ScheduleQueue {
        ScheduleQueue {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_sequence: 0,
            }),
            admitted: Notify::new(),
            capacity,
            overflow_policy,
        }
    }

    pub fn unbounded() -> ScheduleQueue {
        Self::new(None, OverflowPolicy::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, scheduled_at: Instant, payload: Bytes) -> Admission {
        let admission = {
            let mut inner = self.lock();

            let admission = match self.capacity {
                Some(capacity) if inner.heap.len() >= capacity => match self.overflow_policy {
                    OverflowPolicy::DropNewest => return Admission::Rejected,
                    OverflowPolicy::DropOldest => {
                        inner.heap.pop();
                        Admission::DisplacedOldest
                    }
                },
                _ => Admission::Queued,
            };

            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.heap.push(Reverse(ScheduledPacket {
                scheduled_at,
                sequence,
                payload,
            }));
            admission
        };

        // NB: notify_one stores a permit if the dispatcher is not currently waiting, so an
        //      admission between its check and its wait is not lost
        self.admitted.notify_one();
        admission
    }

    /// Waits until the earliest datagram is due, and removes it from the queue.
    ///
    /// This is cancel safe: a datagram is only removed when it is returned.
    pub async fn next_due(&self) -> ScheduledPacket {
        loop {
            let earliest = self.lock().heap.peek()
                .map(|Reverse(p)| p.scheduled_at);

            match earliest {
                None => self.admitted.notified().await,
                Some(scheduled_at) if scheduled_at <= Instant::now() => {
                    let popped = self.lock().heap.pop();
                    if let Some(Reverse(packet)) = popped {
                        return packet;
                    }
                }
                Some(scheduled_at) => {
                    tokio::select! {
                        _ = sleep_until(scheduled_at) => {}
                        _ = self.admitted.notified() => {}
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards all waiting datagrams, returning their number
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let num_discarded = inner.heap.len();
        inner.heap.clear();
        num_discarded
    }
}
