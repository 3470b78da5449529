use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;

use crate::delay::delay_config::DelayConfig;
use crate::multicast::send_endpoint::SendEndpoint;
use crate::relay::route_mapping::RouteMapping;

/// What to do with an incoming datagram when a direction's schedule queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// discard the incoming datagram
    #[default]
    DropNewest,
    /// discard the datagram that is due first to make room for the incoming one
    DropOldest,
}

impl FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop-newest" => Ok(OverflowPolicy::DropNewest),
            "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            other => bail!("invalid overflow policy {:?}, expected 'drop-newest' or 'drop-oldest'", other),
        }
    }
}

impl Display for OverflowPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::DropNewest => write!(f, "drop-newest"),
            OverflowPolicy::DropOldest => write!(f, "drop-oldest"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub routes: Vec<RouteMapping>,
    pub delay: DelayConfig,

    pub multicast_ttl: u32,
    /// deliver multicast traffic originating on this host to the relay's own receive sockets
    pub multicast_loop: bool,
    /// datagrams longer than this are truncated on receipt
    pub max_datagram_size: usize,

    /// `None` means unbounded: a direction holds every datagram received during one delay period
    pub queue_capacity: Option<usize>,
    pub overflow_policy: OverflowPolicy,

    /// pause after a failed receive, so a persistent socket error does not turn into a busy loop
    pub receive_error_backoff: Duration,
    pub send_error_backoff: Duration,
    /// pause before a direction that terminated abnormally is started again
    pub restart_backoff: Duration,

    pub status_interval: Duration,
}

impl RelayConfig {
    pub fn new(routes: Vec<RouteMapping>) -> RelayConfig {
        RelayConfig {
            routes,
            delay: DelayConfig::new(),
            multicast_ttl: SendEndpoint::DEFAULT_TTL,
            multicast_loop: true,
            max_datagram_size: 2048,
            queue_capacity: None,
            overflow_policy: OverflowPolicy::default(),
            receive_error_backoff: Duration::from_secs(1),
            send_error_backoff: Duration::from_millis(100),
            restart_backoff: Duration::from_secs(1),
            status_interval: Duration::from_secs(60),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        RouteMapping::validate_table(&self.routes)?;
        self.delay.validate()?;

        if self.multicast_ttl == 0 || self.multicast_ttl > 255 {
            bail!("multicast TTL must be between 1 and 255, was {}", self.multicast_ttl);
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > 65_535 {
            bail!("maximum datagram size must be between 1 and 65535, was {}", self.max_datagram_size);
        }
        if self.queue_capacity == Some(0) {
            bail!("queue capacity must be positive");
        }
        if self.status_interval.is_zero() {
            bail!("status interval must be positive");
        }
        Ok(())
    }
}
