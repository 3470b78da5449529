//! Relays UDP multicast traffic between two sites while holding every datagram back for the
//!  one-way light time between two celestial bodies, e.g. Earth and Mars. This allows
//!  operational procedures (voice loops, telemetry) to be rehearsed under realistic signal
//!  latency.
//!
//! The crate is layered leaf-first:
//! * [delay] provides the current delay, cached and refreshed from an ephemeris, or fixed for
//!    development
//! * [multicast] wraps the platform's multicast sockets
//! * [relay] contains the per-direction pipeline (receive, schedule, emit) and the orchestrator
//!    that runs all configured directions

pub mod delay;
pub mod multicast;
pub mod relay;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
