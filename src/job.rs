//! Job description
//!
//! A job is an already-parsed, ordered list of steps plus the process
//! parameters that fill in whatever a step leaves out. Coordinates are in
//! micrometres, feed rates in µm/s, power in percent and times in seconds.

use crate::{NanofabError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A point in stage coordinates, in micrometres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Defaults applied to steps that do not carry their own values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessParameters {
    /// Default feed rate in µm/s
    pub feed: Option<f64>,
    /// Laser power in percent in effect from the start of the job
    pub power: Option<f64>,
    /// Offset added to every z coordinate, in micrometres
    #[serde(default)]
    pub focus_offset: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExposureSpec {
    /// Expose in place
    Duration { seconds: f64 },
    /// Expose along a straight line to `to`
    Path { to: Point, feed: Option<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Move { to: Point, feed: Option<f64> },
    SetPower { percent: f64 },
    Expose { exposure: ExposureSpec },
    Dwell { seconds: f64 },
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Move { .. } => "move",
            Step::SetPower { .. } => "set_power",
            Step::Expose { .. } => "expose",
            Step::Dwell { .. } => "dwell",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    /// Stage position at job start, if known
    #[serde(default)]
    pub origin: Option<Point>,
    #[serde(default)]
    pub parameters: ProcessParameters,
    pub steps: Vec<Step>,
}

impl Job {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            origin: None,
            parameters: ProcessParameters::default(),
            steps,
        }
    }

    pub fn with_origin(mut self, origin: Point) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_parameters(mut self, parameters: ProcessParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Load a job file; `.json` files are read as JSON, everything else as YAML
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            NanofabError::Config(format!("Failed to read job file {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }
}
