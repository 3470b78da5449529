use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use clap_derive::Parser;
use lighttime_relay::delay::delay_value::DelayValue;
use lighttime_relay::delay::ephemeris_table::TabulatedEphemeris;
use lighttime_relay::relay::orchestrator::RelayOrchestrator;
use lighttime_relay::relay::relay_config::{OverflowPolicy, RelayConfig};
use lighttime_relay::relay::route_mapping::RouteMapping;
use tracing::{error, info, Level};

/// Relays UDP multicast traffic, delaying every datagram by the current Earth / Mars light time
#[derive(Parser)]
struct Args {
    /// NAME=SRC_GROUP:SRC_PORT->DST_GROUP:DST_PORT[@INTERFACE], repeatable. The habitat / mission
    ///  control loops are relayed if no route is given.
    #[clap(long)]
    route: Vec<String>,

    /// fixed delay for development and testing, values <= 0 use the computed light time
    #[clap(long, env = "DEV_DELAY_SECONDS", default_value_t = 0.0, allow_negative_numbers = true)]
    dev_delay_seconds: f64,

    /// ephemeris data file, repeatable
    #[clap(long)]
    ephemeris: Vec<PathBuf>,

    #[clap(long, default_value_t = 60)]
    refresh_interval_secs: u64,

    /// delay used until the light time was computed successfully
    #[clap(long)]
    fallback_delay_secs: Option<f64>,

    #[clap(long, default_value_t = 16)]
    ttl: u32,

    #[clap(long, default_value_t = 2048)]
    max_datagram_size: usize,

    /// maximum number of datagrams waiting per direction, unbounded if not set
    #[clap(long)]
    queue_capacity: Option<usize>,

    /// 'drop-newest' or 'drop-oldest'
    #[clap(long, default_value = "drop-newest")]
    overflow_policy: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

/// Time the runtime waits for blocking work on shutdown. A light time computation that timed out
///  cannot be cancelled and may still be running.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(1);

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = relay_config(args)?;
    let orchestrator = RelayOrchestrator::new(config, Arc::new(TabulatedEphemeris::new()))?;

    run_relay(orchestrator, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received interrupt"),
            Err(e) => error!("cannot listen for interrupt signals, shutting down: {}", e),
        }
    })
}

fn run_relay(orchestrator: RelayOrchestrator, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;

    let result = runtime.block_on(orchestrator.run(shutdown));

    // NB: dropping the runtime would wait for all blocking work to finish
    runtime.shutdown_timeout(SHUTDOWN_GRACE_PERIOD);
    result
}

fn relay_config(args: Args) -> anyhow::Result<RelayConfig> {
    let mut routes = Vec::new();
    for s in &args.route {
        routes.push(s.parse::<RouteMapping>()?);
    }
    if routes.is_empty() {
        routes = RouteMapping::default_loop_mappings();
    }

    let mut config = RelayConfig::new(routes);
    config.delay.set_dev_delay_seconds(args.dev_delay_seconds);
    if !args.ephemeris.is_empty() {
        config.delay.ephemeris_files = args.ephemeris;
    }
    config.delay.refresh_interval = Duration::from_secs(args.refresh_interval_secs);
    if let Some(fallback) = args.fallback_delay_secs {
        config.delay.fallback = DelayValue::new(fallback)
            .ok_or_else(|| anyhow!("fallback delay must be a non-negative number of seconds, was {}", fallback))?;
    }

    config.multicast_ttl = args.ttl;
    config.max_datagram_size = args.max_datagram_size;
    config.queue_capacity = args.queue_capacity;
    config.overflow_policy = args.overflow_policy.parse::<OverflowPolicy>()
        .context("invalid --overflow-policy")?;

    Ok(config)
}
