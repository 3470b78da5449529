use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

use crate::delay::delay_value::DelayValue;
use crate::delay::ephemeris::BodyId;

#[derive(Debug, Clone)]
pub struct DelayConfig {
    /// If this is set, the delay is fixed at this value and no ephemeris data is loaded or
    ///  computed. This is meant for development and testing.
    pub fixed_override: Option<DelayValue>,

    /// The minimum time between two recomputations of the light time. Light time changes
    ///  slowly (on the order of seconds per day for Earth / Mars), so recomputing it for every
    ///  packet would be wasteful.
    pub refresh_interval: Duration,

    /// Upper bound for a single light time computation; a computation that takes longer is
    ///  treated as a failure.
    pub refresh_timeout: Duration,

    /// The delay used before the first successful computation, and for as long as all
    ///  computations fail. This should be a conservative, realistic value rather than zero.
    pub fallback: DelayValue,

    pub ephemeris_files: Vec<PathBuf>,
    pub body_a: BodyId,
    pub body_b: BodyId,
}

impl DelayConfig {
    pub const DEFAULT_FALLBACK_SECONDS: f64 = 600.0;

    pub fn new() -> DelayConfig {
        DelayConfig {
            fixed_override: None,
            refresh_interval: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(10),
            fallback: DelayValue::new(Self::DEFAULT_FALLBACK_SECONDS).unwrap_or(DelayValue::ZERO),
            ephemeris_files: vec![PathBuf::from("/opt/lighttime-relay/ephemeris/earth_mars.tab")],
            body_a: BodyId::EARTH_BARYCENTER,
            body_b: BodyId::MARS_BARYCENTER,
        }
    }

    /// Sets the development override, following the convention that values <= 0 disable it
    pub fn set_dev_delay_seconds(&mut self, seconds: f64) {
        self.fixed_override = DelayValue::from_override(seconds);
    }

    pub fn is_override_active(&self) -> bool {
        self.fixed_override.is_some()
    }

    /// Checks the configuration including the presence of ephemeris data files, so that
    ///  missing data is detected before any other resource is acquired.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.refresh_interval.is_zero() {
            bail!("light time refresh interval must be positive");
        }
        if self.refresh_timeout.is_zero() {
            bail!("light time refresh timeout must be positive");
        }

        if self.is_override_active() {
            return Ok(());
        }

        if self.ephemeris_files.is_empty() {
            bail!("no ephemeris data files configured - configure ephemeris data or set a fixed delay override");
        }
        for path in &self.ephemeris_files {
            if !path.is_file() {
                bail!("ephemeris data file not found: {}", path.display());
            }
        }
        if self.body_a == self.body_b {
            bail!("light time must be computed between two different bodies, both are {}", self.body_a);
        }
        Ok(())
    }
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;
    use super::*;

    #[test]
    fn test_override_skips_ephemeris_checks() {
        let mut config = DelayConfig::new();
        config.ephemeris_files = vec![PathBuf::from("/does/not/exist.tab")];
        config.set_dev_delay_seconds(3.0);

        assert!(config.is_override_active());
        config.validate().unwrap();
    }

    #[test]
    fn test_disabled_override() {
        let mut config = DelayConfig::new();
        config.set_dev_delay_seconds(3.0);
        config.set_dev_delay_seconds(0.0);
        assert!(!config.is_override_active());
        assert_eq!(config.fixed_override, None);
    }

    #[test]
    fn test_missing_ephemeris_file_is_named() {
        let mut config = DelayConfig::new();
        config.ephemeris_files = vec![PathBuf::from("/does/not/exist.tab")];

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("/does/not/exist.tab"), "{}", err);
    }

    #[test]
    fn test_no_ephemeris_files() {
        let mut config = DelayConfig::new();
        config.ephemeris_files.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_production_config() {
        let file = NamedTempFile::new().unwrap();
        let mut config = DelayConfig::new();
        config.ephemeris_files = vec![file.path().to_path_buf()];
        config.validate().unwrap();

        config.body_b = config.body_a;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_refresh_interval() {
        let mut config = DelayConfig::new();
        config.set_dev_delay_seconds(1.0);
        config.refresh_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = DelayConfig::new();
        assert_eq!(config.fallback.as_secs_f64(), 600.0);
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert!(!config.is_override_active());
    }
}
