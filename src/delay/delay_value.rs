use std::fmt::{Display, Formatter};
use std::time::Duration;

/// A one-way signal delay in seconds. It is always finite and non-negative.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd)]
pub struct DelayValue(f64);

impl DelayValue {
    pub const ZERO: DelayValue = DelayValue(0.0);

    /// Returns `None` for negative or non-finite values
    pub fn new(seconds: f64) -> Option<DelayValue> {
        if seconds.is_finite() && seconds >= 0.0 {
            Some(DelayValue(seconds))
        }
        else {
            None
        }
    }

    /// Interprets a fixed-override setting: only strictly positive values activate the override,
    ///  zero and negative values mean 'no override'.
    pub fn from_override(seconds: f64) -> Option<DelayValue> {
        if seconds > 0.0 {
            Self::new(seconds)
        }
        else {
            None
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0
    }

    /// NB: values beyond what a [Duration] can represent saturate
    pub fn as_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.0)
            .unwrap_or(Duration::MAX)
    }
}

impl Display for DelayValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}s", self.0)
    }
}
