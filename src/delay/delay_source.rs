use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::delay::delay_config::DelayConfig;
use crate::delay::delay_value::DelayValue;
use crate::delay::ephemeris::{BodyId, LightTimeError, LightTimeSource};

/// [DelaySource] provides the current one-way delay. There is one instance per process, shared
///  by all relay directions (which approximate the same physical light time).
///
/// [DelaySource::current] is called for every packet, so it never computes anything itself: it
///  returns the cached value, and if that value is older than the refresh interval, it
///  triggers a refresh in the background. Until the first refresh succeeds, the configured
///  fallback is returned. Failed refreshes are logged and leave the cached value untouched; the
///  next attempt happens after another refresh interval.
pub struct DelaySource {
    mode: DelayMode,
}

enum DelayMode {
    Fixed(DelayValue),
    Computed(Arc<LightTimeCache>),
}

#[derive(Debug, Clone, Copy)]
pub struct DelayCacheState {
    pub value: DelayValue,
    /// time of the most recent *successful* refresh
    pub last_refresh: Option<Instant>,
    pub last_attempt: Option<Instant>,
}

struct LightTimeCache {
    light_time: Arc<dyn LightTimeSource>,
    body_a: BodyId,
    body_b: BodyId,
    refresh_interval: Duration,
    refresh_timeout: Duration,
    state: RwLock<DelayCacheState>,
    refresh_in_flight: AtomicBool,
}

impl DelaySource {
    pub fn new(config: &DelayConfig, light_time: Arc<dyn LightTimeSource>) -> DelaySource {
        match config.fixed_override {
            Some(fixed) => Self::fixed(fixed),
            None => DelaySource {
                mode: DelayMode::Computed(Arc::new(LightTimeCache {
                    light_time,
                    body_a: config.body_a,
                    body_b: config.body_b,
                    refresh_interval: config.refresh_interval,
                    refresh_timeout: config.refresh_timeout,
                    state: RwLock::new(DelayCacheState {
                        value: config.fallback,
                        last_refresh: None,
                        last_attempt: None,
                    }),
                    refresh_in_flight: AtomicBool::new(false),
                })),
            },
        }
    }

    pub fn fixed(delay: DelayValue) -> DelaySource {
        info!("fixed delay override active - delay is {}, ephemeris data is not used", delay);
        DelaySource {
            mode: DelayMode::Fixed(delay),
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.mode, DelayMode::Fixed(_))
    }

    /// The delay to apply to a packet received now. This must be called from inside a Tokio
    ///  runtime since it may spawn a background refresh.
    pub fn current(&self) -> DelayValue {
        match &self.mode {
            DelayMode::Fixed(delay) => *delay,
            DelayMode::Computed(cache) => {
                let state = cache.snapshot();
                if cache.is_refresh_due(&state, Instant::now()) && cache.try_start_refresh() {
                    let cache = cache.clone();
                    tokio::spawn(async move {
                        cache.refresh().await;
                    });
                }
                state.value
            }
        }
    }

    /// Does a single refresh right away and waits for it, returning `true` if a new value was
    ///  computed. This is a no-op in fixed override mode, and if another refresh is already in
    ///  progress.
    pub async fn refresh(&self) -> bool {
        match &self.mode {
            DelayMode::Fixed(_) => false,
            DelayMode::Computed(cache) => {
                if !cache.try_start_refresh() {
                    debug!("light time refresh is already in progress");
                    return false;
                }
                cache.refresh().await
            }
        }
    }

    /// The cache state for diagnostics, `None` in fixed override mode
    pub fn cache_state(&self) -> Option<DelayCacheState> {
        match &self.mode {
            DelayMode::Fixed(_) => None,
            DelayMode::Computed(cache) => Some(cache.snapshot()),
        }
    }
}

impl LightTimeCache {
    fn snapshot(&self) -> DelayCacheState {
        *self.state.read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_refresh_due(&self, state: &DelayCacheState, now: Instant) -> bool {
        match state.last_attempt {
            None => true,
            Some(last_attempt) => now.saturating_duration_since(last_attempt) > self.refresh_interval,
        }
    }

    fn try_start_refresh(&self) -> bool {
        self.refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish_refresh(&self) {
        self.refresh_in_flight.store(false, Ordering::Release);
    }

    /// NB: This never propagates a failure - errors, panics and timeouts of the computation are
    ///      logged, and the cached value is kept
    ///
    /// The caller must have acquired the refresh flag. It is released when the computation
    ///  finishes, which is after this returns if the computation timed out.
    async fn refresh(self: &Arc<Self>) -> bool {
        let started = Instant::now();
        self.state.write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_attempt = Some(started);

        let result = match self.compute().await {
            Computation::Finished(result) => result,
            Computation::TimedOut => {
                warn!("light time computation did not finish within {:?}, keeping delay of {} - no new computation is started until it finished", self.refresh_timeout, self.snapshot().value);
                return false;
            }
        };

        let success = match result {
            Ok(value) => {
                let mut state = self.state.write()
                    .unwrap_or_else(PoisonError::into_inner);
                state.value = value;
                state.last_refresh = Some(started);
                info!("light time updated: {} between {} and {}", value, self.body_a, self.body_b);
                true
            }
            Err(e) => {
                warn!("light time update failed, keeping delay of {} until the next attempt in {:?}: {:#}", self.snapshot().value, self.refresh_interval, e);
                false
            }
        };
        self.finish_refresh();
        success
    }

    async fn compute(self: &Arc<Self>) -> Computation {
        let light_time = self.light_time.clone();
        let (body_a, body_b) = (self.body_a, self.body_b);
        let timestamp = Utc::now();

        let mut computation = tokio::task::spawn_blocking(move || light_time.compute_light_time(timestamp, body_a, body_b));
        let seconds = match timeout(self.refresh_timeout, &mut computation).await {
            Err(_) => {
                // a blocking computation cannot be cancelled: it keeps running on the blocking
                //  pool, and the refresh flag stays set until it is done
                let cache = self.clone();
                tokio::spawn(async move {
                    let _ = computation.await;
                    debug!("timed out light time computation finished, its result is discarded");
                    cache.finish_refresh();
                });
                return Computation::TimedOut;
            }
            Ok(Err(join_error)) => return Computation::Finished(Err(anyhow!("computation aborted: {}", join_error))),
            Ok(Ok(Err(e))) => return Computation::Finished(Err(e.into())),
            Ok(Ok(Ok(seconds))) => seconds,
        };

        Computation::Finished(DelayValue::new(seconds)
            .ok_or_else(|| LightTimeError::InvalidValue(seconds).into()))
    }
}

enum Computation {
    Finished(anyhow::Result<DelayValue>),
    TimedOut,
}
