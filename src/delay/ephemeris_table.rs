use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::delay::ephemeris::{BodyId, Ephemeris, LightTimeError, LightTimeSource, SPEED_OF_LIGHT_KM_PER_S};

/// An [Ephemeris] that interpolates tabulated distances between pairs of bodies.
///
/// Data files are plain text, one sample per line:
///
/// ```ascii
/// # UTC timestamp (RFC 3339)  body_a  body_b  distance_km
/// 2026-10-19T00:00:00Z        3       4       2.9862e8
/// 2026-10-20T00:00:00Z        3       4       2.9871e8
/// ```
///
/// Empty lines and lines starting with `#` are ignored. The order of the two bodies does not
///  matter. Light time is the linearly interpolated distance divided by the speed of light;
///  instants outside the tabulated range are not extrapolated.
#[derive(Default)]
pub struct TabulatedEphemeris {
    tables: RwLock<Option<BTreeMap<(BodyId, BodyId), Vec<Sample>>>>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    distance_km: f64,
}

fn body_pair(a: BodyId, b: BodyId) -> (BodyId, BodyId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl TabulatedEphemeris {
    pub fn new() -> TabulatedEphemeris {
        Default::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.tables.read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn parse_file(path: &Path, tables: &mut BTreeMap<(BodyId, BodyId), Vec<Sample>>) -> anyhow::Result<usize> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read ephemeris data file {}", path.display()))?;

        let mut num_samples = 0;
        for (line_idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (pair, sample) = Self::parse_line(line)
                .with_context(|| format!("{}:{}: invalid ephemeris sample", path.display(), line_idx + 1))?;
            tables.entry(pair).or_default().push(sample);
            num_samples += 1;
        }
        Ok(num_samples)
    }

    fn parse_line(line: &str) -> anyhow::Result<((BodyId, BodyId), Sample)> {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.len() != 4 {
            bail!("expected 'TIMESTAMP BODY_A BODY_B DISTANCE_KM', found {} fields", fields.len());
        }

        let at = DateTime::parse_from_rfc3339(fields[0])
            .with_context(|| format!("invalid timestamp {:?}", fields[0]))?
            .with_timezone(&Utc);
        let body_a = BodyId(fields[1].parse().with_context(|| format!("invalid body id {:?}", fields[1]))?);
        let body_b = BodyId(fields[2].parse().with_context(|| format!("invalid body id {:?}", fields[2]))?);
        let distance_km: f64 = fields[3].parse()
            .with_context(|| format!("invalid distance {:?}", fields[3]))?;

        if body_a == body_b {
            bail!("distance of {} to itself", body_a);
        }
        if !distance_km.is_finite() || distance_km < 0.0 {
            return Err(anyhow!("distance must be a non-negative number, was {}", distance_km));
        }

        Ok((body_pair(body_a, body_b), Sample { at, distance_km }))
    }

    fn interpolate_distance(samples: &[Sample], timestamp: DateTime<Utc>) -> Option<f64> {
        // index of the first sample *after* the timestamp
        let idx = samples.partition_point(|s| s.at <= timestamp);
        if idx == 0 {
            return None;
        }

        let before = &samples[idx - 1];
        if before.at == timestamp {
            return Some(before.distance_km);
        }

        let after = samples.get(idx)?;
        let span = (after.at - before.at).num_milliseconds() as f64;
        let fraction = if span > 0.0 {
            (timestamp - before.at).num_milliseconds() as f64 / span
        }
        else {
            0.0
        };
        Some(before.distance_km + fraction * (after.distance_km - before.distance_km))
    }
}

impl LightTimeSource for TabulatedEphemeris {
    fn compute_light_time(&self, timestamp: DateTime<Utc>, body_a: BodyId, body_b: BodyId) -> Result<f64, LightTimeError> {
        let tables = self.tables.read()
            .unwrap_or_else(PoisonError::into_inner);
        let tables = tables.as_ref()
            .ok_or(LightTimeError::NotLoaded)?;

        let samples = tables.get(&body_pair(body_a, body_b))
            .ok_or(LightTimeError::UnknownBodies(body_a, body_b))?;

        let distance_km = Self::interpolate_distance(samples, timestamp)
            .ok_or(LightTimeError::NoCoverage { timestamp, body_a, body_b })?;

        let light_time = distance_km / SPEED_OF_LIGHT_KM_PER_S;
        debug!("light time between {} and {} at {}: {:.3}s", body_a, body_b, timestamp, light_time);
        Ok(light_time)
    }
}

impl Ephemeris for TabulatedEphemeris {
    fn load(&self, paths: &[PathBuf]) -> anyhow::Result<()> {
        let mut tables = BTreeMap::new();
        for path in paths {
            if !path.is_file() {
                bail!("ephemeris data file not found: {}", path.display());
            }
            let num_samples = Self::parse_file(path, &mut tables)?;
            info!("loaded {} samples from ephemeris data file {}", num_samples, path.display());
        }

        for samples in tables.values_mut() {
            samples.sort_by_key(|s: &Sample| s.at);
        }

        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = Some(tables);
        Ok(())
    }

    fn release(&self) {
        if self.tables.write().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            info!("released ephemeris data");
        }
    }
}
