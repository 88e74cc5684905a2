//! Fixed-point device units
//!
//! Everything that crosses the wire is a scaled integer so that long jobs do
//! not accumulate floating-point drift. Job descriptions use micrometres and
//! percent as `f64`; the planner converts them once, here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Device position resolution: one tenth of a micrometre
pub const DECIMICRONS_PER_MICRON: f64 = 10.0;

/// Laser power resolution: one hundredth of a percent
pub const POWER_STEPS_PER_PERCENT: f64 = 100.0;

/// Largest coordinate magnitude a job may use on any axis, in micrometres
pub const MAX_COORDINATE_MICRONS: f64 = 1.0e7;

/// Longest a single command may keep the controller busy
pub const MAX_COMMAND_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// A length along one stage axis in tenths of a micrometre
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Decimicron(pub i64);

impl Decimicron {
    pub fn from_microns(microns: f64) -> Self {
        Self((microns * DECIMICRONS_PER_MICRON).round() as i64)
    }

    pub fn as_microns(self) -> f64 {
        self.0 as f64 / DECIMICRONS_PER_MICRON
    }
}

/// Stage coordinates in device units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: Decimicron,
    pub y: Decimicron,
    pub z: Decimicron,
}

impl StagePosition {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self {
            x: Decimicron(x),
            y: Decimicron(y),
            z: Decimicron(z),
        }
    }

    pub fn from_microns(x: f64, y: f64, z: f64) -> Self {
        Self {
            x: Decimicron::from_microns(x),
            y: Decimicron::from_microns(y),
            z: Decimicron::from_microns(z),
        }
    }

    /// Euclidean distance to `other` in micrometres
    pub fn distance_microns(&self, other: &StagePosition) -> f64 {
        let dx = other.x.0 as f64 - self.x.0 as f64;
        let dy = other.y.0 as f64 - self.y.0 as f64;
        let dz = other.z.0 as f64 - self.z.0 as f64;
        (dx * dx + dy * dy + dz * dz).sqrt() / DECIMICRONS_PER_MICRON
    }
}

impl fmt::Display for StagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.1}, {:.1}, {:.1}) µm",
            self.x.as_microns(),
            self.y.as_microns(),
            self.z.as_microns()
        )
    }
}

/// Stage velocity in tenths of a micrometre per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeedRate(pub u64);

impl FeedRate {
    /// Convert from µm/s. Returns `None` for rates that are not strictly
    /// positive once scaled.
    pub fn from_microns_per_second(rate: f64) -> Option<Self> {
        if !rate.is_finite() {
            return None;
        }
        let scaled = (rate * DECIMICRONS_PER_MICRON).round();
        if scaled < 1.0 {
            return None;
        }
        Some(Self(scaled as u64))
    }

    pub fn as_microns_per_second(self) -> f64 {
        self.0 as f64 / DECIMICRONS_PER_MICRON
    }

    /// Time to travel `distance_microns` at this rate, saturating at
    /// `Duration::MAX`
    pub fn travel_time(self, distance_microns: f64) -> Duration {
        if self.0 == 0 {
            return Duration::ZERO;
        }
        let seconds = distance_microns / self.as_microns_per_second();
        if seconds.is_nan() || seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

/// Laser power in hundredths of a percent (0..=10000)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Power(pub u16);

impl Power {
    pub const OFF: Power = Power(0);
    pub const FULL: Power = Power(10_000);

    /// Convert from percent. The caller is responsible for range checking;
    /// values outside 0..=100 saturate.
    pub fn from_percent(percent: f64) -> Self {
        let scaled = (percent * POWER_STEPS_PER_PERCENT).round();
        Self(scaled.clamp(0.0, Self::FULL.0 as f64) as u16)
    }

    pub fn as_percent(self) -> f64 {
        self.0 as f64 / POWER_STEPS_PER_PERCENT
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.as_percent())
    }
}

/// Duration on the wire, in whole microseconds
pub fn duration_to_micros(duration: Duration) -> u64 {
    duration.as_micros().min(u64::MAX as u128) as u64
}
