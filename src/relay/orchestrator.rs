use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio::{pin, select};
use tracing::{debug, error, info, warn};

use crate::delay::delay_source::DelaySource;
use crate::delay::ephemeris::Ephemeris;
use crate::relay::endpoint_factory::{DirectionEndpoints, EndpointFactory, MulticastEndpointFactory};
use crate::relay::relay_config::RelayConfig;
use crate::relay::relay_direction::{wait_for_shutdown, DirectionStats, RelayDirection};
use crate::relay::route_mapping::RouteMapping;
use crate::relay::schedule_queue::ScheduleQueue;

/// Runs one [RelayDirection] per configured route, all sharing a single [DelaySource].
///
/// The orchestrator owns the ephemeris lifecycle: it is loaded before any direction starts, and
///  released after all directions stopped. In fixed override mode, the ephemeris is not touched
///  at all.
pub struct RelayOrchestrator {
    config: Arc<RelayConfig>,
    ephemeris: Arc<dyn Ephemeris>,
    delay_source: Arc<DelaySource>,
    endpoint_factory: Arc<dyn EndpointFactory>,
}

/// The part of a direction that survives restarts
struct DirectionState {
    mapping: RouteMapping,
    queue: Arc<ScheduleQueue>,
    stats: Arc<DirectionStats>,
}

impl RelayOrchestrator {
    /// Validates the configuration, failing before any resource is acquired
    pub fn new<E: Ephemeris>(config: RelayConfig, ephemeris: Arc<E>) -> anyhow::Result<RelayOrchestrator> {
        config.validate()?;

        let delay_source = Arc::new(DelaySource::new(&config.delay, ephemeris.clone()));
        Ok(RelayOrchestrator {
            config: Arc::new(config),
            ephemeris,
            delay_source,
            endpoint_factory: Arc::new(MulticastEndpointFactory),
        })
    }

    pub fn with_endpoint_factory(self, endpoint_factory: Arc<dyn EndpointFactory>) -> RelayOrchestrator {
        RelayOrchestrator {
            endpoint_factory,
            ..self
        }
    }

    pub fn delay_source(&self) -> &Arc<DelaySource> {
        &self.delay_source
    }

    /// Runs all directions until `shutdown` completes. An error is returned only for failures
    ///  during startup; once running, errors are handled inside the directions.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let uses_ephemeris = !self.config.delay.is_override_active();

        if uses_ephemeris {
            self.ephemeris.load(&self.config.delay.ephemeris_files)
                .context("cannot load ephemeris data")?;

            if !self.delay_source.refresh().await {
                warn!("initial light time computation failed - starting with a delay of {}", self.delay_source.current());
            }
        }

        let result = self.run_directions(shutdown).await;

        if uses_ephemeris {
            self.ephemeris.release();
        }
        result
    }

    async fn run_directions(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        // all endpoints are opened before the first direction starts, so a problem with any of
        //  them aborts startup without relaying anything
        let mut directions = Vec::new();
        for mapping in &self.config.routes {
            let endpoints = self.endpoint_factory.open(mapping, &self.config)?;
            let state = Arc::new(DirectionState {
                mapping: mapping.clone(),
                queue: Arc::new(ScheduleQueue::new(self.config.queue_capacity, self.config.overflow_policy)),
                stats: Arc::new(DirectionStats::default()),
            });
            directions.push((state, endpoints));
        }

        let (shutdown_send, shutdown_recv) = watch::channel(false);
        let mut supervisors = Vec::new();
        let mut states = Vec::new();
        for (state, endpoints) in directions {
            info!("relaying {}", state.mapping);
            supervisors.push(tokio::spawn(supervise(
                state.clone(),
                endpoints,
                self.config.clone(),
                self.delay_source.clone(),
                self.endpoint_factory.clone(),
                shutdown_recv.clone(),
            )));
            states.push(state);
        }
        info!("relay started with {} directions, delay is {}", states.len(), self.delay_source.current());

        let mut status_ticks = interval(self.config.status_interval);
        status_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        status_ticks.tick().await;

        pin!(shutdown);
        loop {
            select! {
                _ = &mut shutdown => break,
                _ = status_ticks.tick() => self.log_status(&states),
            }
        }

        info!("shutting down relay");
        shutdown_send.send_replace(true);
        for supervisor in supervisors {
            if let Err(e) = supervisor.await {
                error!("relay direction supervisor terminated abnormally: {}", e);
            }
        }

        for state in &states {
            let num_discarded = state.queue.clear();
            if num_discarded > 0 {
                info!("{}: discarded {} datagrams waiting for emission", state.mapping.name, num_discarded);
            }
            info!("{}: {}", state.mapping.name, state.stats.snapshot());
        }
        info!("relay stopped");
        Ok(())
    }

    fn log_status(&self, states: &[Arc<DirectionState>]) {
        match self.delay_source.cache_state() {
            None => info!("delay is {} (fixed)", self.delay_source.current()),
            Some(cache) => info!("delay is {}, last successful refresh {:?} ago",
                cache.value,
                cache.last_refresh.map(|t| t.elapsed()),
            ),
        }
        for state in states {
            info!("{}: {} queued={}", state.mapping.name, state.stats.snapshot(), state.queue.len());
        }
    }
}

/// Runs a direction, restarting it with freshly opened endpoints if it terminates abnormally.
///  Queue and statistics are kept across restarts.
async fn supervise(
    state: Arc<DirectionState>,
    mut endpoints: DirectionEndpoints,
    config: Arc<RelayConfig>,
    delay_source: Arc<DelaySource>,
    endpoint_factory: Arc<dyn EndpointFactory>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let direction = RelayDirection::new(&state.mapping, &config, endpoints, delay_source.clone(), state.queue.clone(), state.stats.clone());
        let direction_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move { direction.run(direction_shutdown).await });

        match handle.await {
            Ok(()) => return,
            Err(e) => error!("relay direction {} terminated abnormally, restarting in {:?}: {}", state.mapping.name, config.restart_backoff, e),
        }

        // NB: the old endpoints were dropped with the terminated task, so their ports are free
        endpoints = loop {
            select! {
                _ = sleep(config.restart_backoff) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    debug!("shutdown while waiting to restart relay direction {}", state.mapping.name);
                    return;
                }
            }

            match endpoint_factory.open(&state.mapping, &config) {
                Ok(endpoints) => break endpoints,
                Err(e) => warn!("cannot reopen endpoints for relay direction {}, retrying in {:?}: {:#}", state.mapping.name, config.restart_backoff, e),
            }
        };
        info!("restarting relay direction {}", state.mapping.name);
    }
}
