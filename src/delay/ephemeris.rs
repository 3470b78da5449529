use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
#[cfg(test)] use mockall::automock;

/// Speed of light in vacuum, km/s
pub const SPEED_OF_LIGHT_KM_PER_S: f64 = 299_792.458;

/// Identifies a celestial body using NAIF integer codes
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BodyId(pub i32);

impl BodyId {
    pub const EARTH_BARYCENTER: BodyId = BodyId(3);
    pub const MARS_BARYCENTER: BodyId = BodyId(4);
}

impl Display for BodyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "body {}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LightTimeError {
    #[error("no ephemeris data is loaded")]
    NotLoaded,
    #[error("no ephemeris data for {0} and {1}")]
    UnknownBodies(BodyId, BodyId),
    #[error("ephemeris data for {body_a} and {body_b} does not cover {timestamp}")]
    NoCoverage {
        timestamp: DateTime<Utc>,
        body_a: BodyId,
        body_b: BodyId,
    },
    #[error("ephemeris computation returned an invalid light time: {0}")]
    InvalidValue(f64),
}

/// This is the narrow interface to the astrodynamics part of the system: given an instant and two
///  bodies, it returns the one-way light time between them in seconds.
///
/// Implementations may do file access or non-trivial numerical work, so callers on the async
///  runtime should run this on the blocking pool.
#[cfg_attr(test, automock)]
pub trait LightTimeSource: Send + Sync + 'static {
    fn compute_light_time(&self, timestamp: DateTime<Utc>, body_a: BodyId, body_b: BodyId) -> Result<f64, LightTimeError>;
}

/// A [LightTimeSource] backed by data files that are loaded once at startup and released on
///  shutdown.
pub trait Ephemeris: LightTimeSource {
    fn load(&self, paths: &[PathBuf]) -> anyhow::Result<()>;

    fn release(&self);
}
