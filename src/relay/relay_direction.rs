use std::fmt::{Display, Formatter};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::delay::delay_source::DelaySource;
use crate::multicast::{DatagramReceiver, DatagramSender};
use crate::relay::endpoint_factory::DirectionEndpoints;
use crate::relay::relay_config::RelayConfig;
use crate::relay::route_mapping::RouteMapping;
use crate::relay::schedule_queue::{Admission, ScheduleQueue};

/// Per-direction counters. They are owned by the orchestrator and outlive restarts of the
///  direction.
#[derive(Debug, Default)]
pub struct DirectionStats {
    received: AtomicU64,
    sent: AtomicU64,
    dropped_send_failure: AtomicU64,
    dropped_overflow: AtomicU64,
    receive_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectionStatsSnapshot {
    pub received: u64,
    pub sent: u64,
    pub dropped_send_failure: u64,
    pub dropped_overflow: u64,
    pub receive_errors: u64,
}

impl DirectionStats {
    pub fn snapshot(&self) -> DirectionStatsSnapshot {
        DirectionStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped_send_failure: self.dropped_send_failure.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Display for DirectionStatsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "received={} sent={} dropped(send failure)={} dropped(overflow)={} receive errors={}",
               self.received, self.sent, self.dropped_send_failure, self.dropped_overflow, self.receive_errors)
    }
}

/// One relay direction: an intake loop receiving datagrams from the source group and admitting
///  them to the schedule queue, and a dispatch loop sending each datagram to the destination
///  group once it is due. The two loops run concurrently and never wait for each other.
pub struct RelayDirection {
    name: String,
    destination: SocketAddrV4,
    receiver: Arc<dyn DatagramReceiver>,
    sender: Arc<dyn DatagramSender>,
    delay_source: Arc<DelaySource>,
    queue: Arc<ScheduleQueue>,
    stats: Arc<DirectionStats>,
    max_datagram_size: usize,
    receive_error_backoff: Duration,
    send_error_backoff: Duration,
}

impl RelayDirection {
    pub fn new(mapping: &RouteMapping, config: &RelayConfig, endpoints: DirectionEndpoints, delay_source: Arc<DelaySource>, queue: Arc<ScheduleQueue>, stats: Arc<DirectionStats>) -> RelayDirection {
        RelayDirection {
            name: mapping.name.clone(),
            destination: mapping.destination,
            receiver: endpoints.receiver,
            sender: endpoints.sender,
            delay_source,
            queue,
            stats,
            max_datagram_size: config.max_datagram_size,
            receive_error_backoff: config.receive_error_backoff,
            send_error_backoff: config.send_error_backoff,
        }
    }

    /// Runs the direction until `shutdown` becomes `true` (or its sender is dropped). Datagrams
    ///  that are still waiting in the queue at that point stay there, the caller decides what
    ///  to do with them.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        async {
            info!("starting relay direction -> {}", self.destination);
            select! {
                _ = self.intake_loop() => {}
                _ = self.dispatch_loop() => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    debug!("shutting down relay direction");
                }
            }
        }
            .instrument(info_span!("relay_direction", name = %self.name))
            .await
    }

    async fn intake_loop(&self) {
        let mut buf = vec![0u8; self.max_datagram_size];
        loop {
            match self.receiver.receive(&mut buf).await {
                Ok((len, from)) => {
                    DirectionStats::inc(&self.stats.received);
                    self.admit(Bytes::copy_from_slice(&buf[..len]), from);
                }
                Err(e) => {
                    DirectionStats::inc(&self.stats.receive_errors);
                    warn!(error = ?e, "error receiving datagram - pausing for {:?}", self.receive_error_backoff);
                    sleep(self.receive_error_backoff).await;
                }
            }
        }
    }

    fn admit(&self, payload: Bytes, from: SocketAddr) {
        let delay = self.delay_source.current();
        let now = Instant::now();
        let scheduled_at = now.checked_add(delay.as_duration())
            .unwrap_or_else(|| far_future(now));

        let len = payload.len();
        match self.queue.push(scheduled_at, payload) {
            Admission::Queued => {
                trace!("received {} bytes from {}, scheduled for emission in {}", len, from, delay);
            }
            Admission::Rejected => {
                DirectionStats::inc(&self.stats.dropped_overflow);
                warn!("schedule queue is full - dropping datagram from {}", from);
            }
            Admission::DisplacedOldest => {
                DirectionStats::inc(&self.stats.dropped_overflow);
                warn!("schedule queue is full - dropped the datagram due first to admit a datagram from {}", from);
            }
        }
    }

    async fn dispatch_loop(&self) {
        loop {
            let packet = self.queue.next_due().await;

            match self.sender.send(&packet.payload, self.destination).await {
                Ok(()) => {
                    DirectionStats::inc(&self.stats.sent);
                    trace!("sent {} bytes to {}, {:?} after schedule", packet.payload.len(), self.destination, Instant::now().saturating_duration_since(packet.scheduled_at));
                }
                Err(e) => {
                    // NB: no retry - a datagram re-sent after the backoff would be stale
                    DirectionStats::inc(&self.stats.dropped_send_failure);
                    warn!(error = ?e, "error sending {} bytes to {} - dropping the datagram", packet.payload.len(), self.destination);
                    sleep(self.send_error_backoff).await;
                }
            }
        }
    }
}

pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // an error means the sender was dropped, which is a shutdown as well
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// roughly 30 years, for delays too big to be represented as an [Instant]
fn far_future(now: Instant) -> Instant {
    now + Duration::from_secs(86_400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::Ipv4Addr;
    use mockall::Sequence;
    use crate::delay::delay_config::DelayConfig;
    use crate::delay::delay_value::DelayValue;
    use crate::delay::ephemeris::MockLightTimeSource;
    use crate::multicast::MockDatagramSender;
    use crate::relay::relay_config::OverflowPolicy;
    use crate::test_util::datagram::{channel_receiver, DatagramInjector, RecordingSender};
    use super::*;

    fn mapping() -> RouteMapping {
        RouteMapping::default_loop_mappings().remove(0)
    }

    fn config() -> RelayConfig {
        let mut config = RelayConfig::new(vec![mapping()]);
        config.delay.set_dev_delay_seconds(3.0);
        config
    }

    struct TestDirection {
        injector: DatagramInjector,
        sender: Arc<RecordingSender>,
        queue: Arc<ScheduleQueue>,
        stats: Arc<DirectionStats>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(config: &RelayConfig, delay_source: Arc<DelaySource>) -> TestDirection {
        let (injector, receiver) = channel_receiver();
        let sender = Arc::new(RecordingSender::new());
        let queue = Arc::new(ScheduleQueue::new(config.queue_capacity, config.overflow_policy));
        let stats = Arc::new(DirectionStats::default());

        let endpoints = DirectionEndpoints {
            receiver: Arc::new(receiver),
            sender: sender.clone(),
        };
        let direction = RelayDirection::new(&config.routes[0], config, endpoints, delay_source, queue.clone(), stats.clone());

        let (shutdown, shutdown_recv) = watch::channel(false);
        let handle = tokio::spawn(async move { direction.run(shutdown_recv).await });

        TestDirection { injector, sender, queue, stats, shutdown, handle }
    }

    fn fixed(secs: f64) -> Arc<DelaySource> {
        Arc::new(DelaySource::fixed(DelayValue::new(secs).unwrap()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_delay_is_applied() {
        let direction = start(&config(), fixed(3.0));
        let t0 = Instant::now();

        direction.injector.inject(b"hello mars");
        let sent = direction.sender.wait_for_sent(1).await;

        assert_eq!(sent[0].payload, b"hello mars");
        assert_eq!(sent[0].destination, mapping().destination);
        let elapsed = sent[0].at - t0;
        assert!(elapsed >= Duration::from_secs(3), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(3050), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_is_sent_early() {
        let direction = start(&config(), fixed(3.0));

        direction.injector.inject(b"a");
        sleep(Duration::from_millis(2999)).await;
        assert_eq!(direction.sender.num_sent(), 0);
        assert_eq!(direction.queue.len(), 1);

        sleep(Duration::from_millis(1)).await;
        direction.sender.wait_for_sent(1).await;
        assert!(direction.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_keeps_order_and_spacing() {
        let direction = start(&config(), fixed(3.0));

        let mut admitted_at = Vec::new();
        for i in 0..10u8 {
            admitted_at.push(Instant::now());
            direction.injector.inject(&[i]);
            sleep(Duration::from_millis(10)).await;
        }

        let sent = direction.sender.wait_for_sent(10).await;
        let payloads = sent.iter().map(|d| d.payload[0]).collect::<Vec<_>>();
        assert_eq!(payloads, (0..10).collect::<Vec<_>>());

        for i in 0..10 {
            assert_eq!(sent[i].at - admitted_at[i], Duration::from_secs(3));
        }
        for w in sent.windows(2) {
            assert!(w[1].at - w[0].at >= Duration::from_millis(10));
        }

        let stats = direction.stats.snapshot();
        assert_eq!(stats.received, 10);
        assert_eq!(stats.sent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_datagrams_keep_admission_order() {
        let direction = start(&config(), fixed(3.0));
        for i in 0..5u8 {
            direction.injector.inject(&[i]);
        }

        let sent = direction.sender.wait_for_sent(5).await;
        let payloads = sent.iter().map(|d| d.payload[0]).collect::<Vec<_>>();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
        assert!(sent.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[tokio::test(start_paused = true)]
    async fn test_directions_share_the_delay() {
        let delay_source = fixed(754.0);
        let config = config();
        let a = start(&config, delay_source.clone());
        let b = start(&config, delay_source);
        let t0 = Instant::now();

        a.injector.inject(b"a");
        b.injector.inject(b"b");

        let sent_a = a.sender.wait_for_sent(1).await;
        let sent_b = b.sender.wait_for_sent(1).await;
        assert_eq!(sent_a[0].at - t0, Duration::from_secs(754));
        assert_eq!(sent_b[0].at - t0, Duration::from_secs(754));
    }

    #[tokio::test]
    async fn test_directions_share_the_computed_delay() {
        let mut light_time = MockLightTimeSource::new();
        light_time.expect_compute_light_time()
            .times(1)
            .returning(|_, _, _| Ok(754.0));
        let delay_source = Arc::new(DelaySource::new(&DelayConfig::new(), Arc::new(light_time)));
        assert!(delay_source.refresh().await);

        tokio::time::pause();
        let config = RelayConfig::new(vec![mapping()]);
        let a = start(&config, delay_source.clone());
        let b = start(&config, delay_source);
        let t0 = Instant::now();

        a.injector.inject(b"a");
        b.injector.inject(b"b");

        let sent_a = a.sender.wait_for_sent(1).await;
        let sent_b = b.sender.wait_for_sent(1).await;
        assert_eq!(sent_a[0].at - t0, Duration::from_secs(754));
        assert_eq!(sent_b[0].at - t0, Duration::from_secs(754));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_drops_datagram() {
        let mut config = config();
        config.send_error_backoff = Duration::from_millis(100);
        let direction = start(&config, fixed(1.0));
        direction.sender.fail_next(1);

        direction.injector.inject(b"lost");
        sleep(Duration::from_millis(500)).await;
        direction.injector.inject(b"delivered");

        let sent = direction.sender.wait_for_sent(1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"delivered");

        let stats = direction.stats.snapshot();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.dropped_send_failure, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_is_not_retried() {
        let mut sender = MockDatagramSender::new();
        let mut seq = Sequence::new();
        sender.expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "no route")));
        sender.expect_send()
            .withf(|payload, destination| payload == b"second" && destination.port() == 20013)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let config = config();
        let (injector, receiver) = channel_receiver();
        let queue = Arc::new(ScheduleQueue::unbounded());
        let stats = Arc::new(DirectionStats::default());
        let endpoints = DirectionEndpoints {
            receiver: Arc::new(receiver),
            sender: Arc::new(sender),
        };
        let direction = RelayDirection::new(&config.routes[0], &config, endpoints, fixed(1.0), queue, stats.clone());
        let (shutdown, shutdown_recv) = watch::channel(false);
        let handle = tokio::spawn(async move { direction.run(shutdown_recv).await });

        injector.inject(b"first");
        sleep(Duration::from_secs(2)).await;
        injector.inject(b"second");
        sleep(Duration::from_secs(2)).await;

        shutdown.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(stats.snapshot().sent, 1);
        assert_eq!(stats.snapshot().dropped_send_failure, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_backs_off() {
        let mut config = config();
        config.receive_error_backoff = Duration::from_secs(1);
        let direction = start(&config, fixed(3.0));
        let t0 = Instant::now();

        direction.injector.inject_error(io::ErrorKind::ConnectionReset);
        direction.injector.inject(b"after error");

        let sent = direction.sender.wait_for_sent(1).await;
        // received after the 1s backoff, then delayed by 3s
        assert_eq!(sent[0].at - t0, Duration::from_secs(4));
        assert_eq!(direction.stats.snapshot().receive_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_is_counted() {
        let mut config = config();
        config.queue_capacity = Some(2);
        config.overflow_policy = OverflowPolicy::DropNewest;
        let direction = start(&config, fixed(3.0));

        for payload in [b"a", b"b", b"c"] {
            direction.injector.inject(payload);
        }
        let sent = direction.sender.wait_for_sent(2).await;
        sleep(Duration::from_secs(10)).await;

        assert_eq!(sent.iter().map(|d| d.payload.clone()).collect::<Vec<_>>(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(direction.sender.num_sent(), 2);
        assert_eq!(direction.stats.snapshot().dropped_overflow, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_datagram_is_truncated() {
        let mut config = config();
        config.max_datagram_size = 4;
        let direction = start(&config, fixed(1.0));

        direction.injector.inject(b"0123456789");
        let sent = direction.sender.wait_for_sent(1).await;
        assert_eq!(sent[0].payload, b"0123");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_waiting_datagrams() {
        let direction = start(&config(), fixed(600.0));
        direction.injector.inject(b"a");
        direction.injector.inject(b"b");
        sleep(Duration::from_secs(1)).await;

        direction.shutdown.send(true).unwrap();
        direction.handle.await.unwrap();

        assert_eq!(direction.sender.num_sent(), 0);
        assert_eq!(direction.queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_is_used_verbatim() {
        let mut config = config();
        config.routes[0].destination = SocketAddrV4::new(Ipv4Addr::new(239, 1, 2, 3), 5555);
        let direction = start(&config, fixed(0.5));

        direction.injector.inject(b"x");
        let sent = direction.sender.wait_for_sent(1).await;
        assert_eq!(sent[0].destination, SocketAddrV4::new(Ipv4Addr::new(239, 1, 2, 3), 5555));
    }
}
