//! Configuration loading for the nanofactory controller link

use crate::{NanofabError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default TCP port of the controller's ASCII command interface
pub const DEFAULT_TCP_PORT: u16 = 8000;

/// Ceiling on how long the session waits for any single command
pub const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub transport: TransportConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which physical link reaches the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    Serial,
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub serial_port: Option<String>,
    pub baud_rate: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionConfig {
    pub handshake_timeout_ms: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
    /// Extra allowance on top of a command's expected run time, in percent
    pub duration_margin_percent: Option<u32>,
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlannerConfig {
    pub power_min_percent: Option<f64>,
    pub power_max_percent: Option<f64>,
    /// How far outside the device range a power value may be before it is
    /// rejected instead of clamped
    pub power_tolerance_percent: Option<f64>,
    pub travel_limits: Option<TravelLimits>,
}

/// Stage travel range in micrometres
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct TravelLimits {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

impl Config {
    pub fn load_from_path(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let contents = fs::read_to_string(config_path).map_err(|e| {
            NanofabError::Config(format!("Failed to read {}: {}", config_path.display(), e))
        })?;

        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a run against the in-process simulated controller
    pub fn simulated() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts() == 0 {
            return Err(NanofabError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.backoff_multiplier() < 1.0 {
            return Err(NanofabError::Config(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.planner.power_min() >= self.planner.power_max() {
            return Err(NanofabError::Config(
                "planner.power_min_percent must be below planner.power_max_percent".to_string(),
            ));
        }
        if self.planner.power_tolerance() < 0.0 {
            return Err(NanofabError::Config(
                "planner.power_tolerance_percent must not be negative".to_string(),
            ));
        }
        if let Some(limits) = &self.planner.travel_limits {
            if (0..3).any(|axis| limits.min[axis] >= limits.max[axis]) {
                return Err(NanofabError::Config(
                    "planner.travel_limits min must be below max on every axis".to_string(),
                ));
            }
        }
        match self.transport.kind {
            TransportKind::Tcp if self.transport.host.is_none() => Err(NanofabError::Config(
                "transport.host is required for tcp transport".to_string(),
            )),
            TransportKind::Serial if self.transport.serial_port.is_none() => Err(
                NanofabError::Config("transport.serial_port is required for serial transport".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl TransportConfig {
    /// Get TCP port with default fallback
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_TCP_PORT)
    }

    /// Get serial baud rate with default fallback
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.unwrap_or(115_200)
    }

    /// Get connect timeout with default fallback
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(5_000))
    }

    /// Human readable link address for logs
    pub fn describe(&self) -> String {
        match self.kind {
            TransportKind::Tcp => format!(
                "tcp://{}:{}",
                self.host.as_deref().unwrap_or("?"),
                self.port()
            ),
            TransportKind::Serial => format!(
                "serial://{}@{}",
                self.serial_port.as_deref().unwrap_or("?"),
                self.baud_rate()
            ),
            TransportKind::Simulated => "simulated".to_string(),
        }
    }
}

impl SessionConfig {
    /// Get handshake timeout with default fallback
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.unwrap_or(2_000))
    }

    /// Get base acknowledgement timeout with default fallback
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms.unwrap_or(1_000))
    }

    /// Get expected-duration margin with default fallback
    pub fn duration_margin_percent(&self) -> u32 {
        self.duration_margin_percent.unwrap_or(50)
    }

    /// Get exchange history length with default fallback
    pub fn history_limit(&self) -> usize {
        self.history_limit.unwrap_or(256)
    }

    /// Timeout for a command expected to keep the controller busy for `expected`
    pub fn command_timeout(&self, expected: Duration) -> Duration {
        let margin = expected.saturating_mul(self.duration_margin_percent()) / 100;
        self.ack_timeout()
            .saturating_add(expected)
            .saturating_add(margin)
            .min(MAX_COMMAND_TIMEOUT)
    }
}

impl RetryConfig {
    /// Get attempts per command with default fallback
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(3)
    }

    /// Get first backoff delay with default fallback
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.unwrap_or(100))
    }

    /// Get backoff growth factor with default fallback
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier.unwrap_or(2.0)
    }

    /// Get backoff ceiling with default fallback
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.unwrap_or(5_000))
    }

    /// Delay before retry number `retry` (1 for the first retry)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let nanos = (self.initial_backoff().as_nanos() as f64
            * self.backoff_multiplier().powi(exponent))
        .round();
        let capped = nanos.min(self.max_backoff().as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }
}

impl PlannerConfig {
    /// Get lowest device power with default fallback
    pub fn power_min(&self) -> f64 {
        self.power_min_percent.unwrap_or(0.0)
    }

    /// Get highest device power with default fallback
    pub fn power_max(&self) -> f64 {
        self.power_max_percent.unwrap_or(100.0)
    }

    /// Get clamp tolerance with default fallback
    pub fn power_tolerance(&self) -> f64 {
        self.power_tolerance_percent.unwrap_or(0.5)
    }
}

impl LoggingConfig {
    /// Get log filter with default fallback
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::load_from_str("transport:\n  kind: simulated\n").unwrap();
        assert_eq!(config.transport.kind, TransportKind::Simulated);
        assert_eq!(config.retry.max_attempts(), 3);
        assert_eq!(config.session.ack_timeout(), Duration::from_secs(1));
        assert_eq!(config.planner.power_max(), 100.0);
        assert_eq!(config.logging.level(), "info");
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
transport:
  kind: tcp
  host: 192.168.1.16
  port: 8001
  connect_timeout_ms: 750
session:
  handshake_timeout_ms: 500
  ack_timeout_ms: 250
retry:
  max_attempts: 5
  initial_backoff_ms: 10
  backoff_multiplier: 3.0
  max_backoff_ms: 50
planner:
  power_tolerance_percent: 1.0
  travel_limits:
    min: [0.0, 0.0, -100.0]
    max: [1000.0, 1000.0, 100.0]
"#;
        let config = Config::load_from_str(yaml).unwrap();
        assert_eq!(config.transport.describe(), "tcp://192.168.1.16:8001");
        assert_eq!(config.transport.connect_timeout(), Duration::from_millis(750));
        assert_eq!(config.retry.max_attempts(), 5);
        assert_eq!(config.planner.power_tolerance(), 1.0);
        assert!(config.planner.travel_limits.is_some());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: Some(5),
            initial_backoff_ms: Some(10),
            backoff_multiplier: Some(2.0),
            max_backoff_ms: Some(35),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(35));
    }

    #[test]
    fn test_command_timeout_scales_with_expected_duration() {
        let session = SessionConfig {
            ack_timeout_ms: Some(100),
            duration_margin_percent: Some(50),
            ..Default::default()
        };
        assert_eq!(session.command_timeout(Duration::ZERO), Duration::from_millis(100));
        assert_eq!(session.command_timeout(Duration::from_secs(2)), Duration::from_millis(3_100));
        assert_eq!(session.command_timeout(Duration::MAX), MAX_COMMAND_TIMEOUT);
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        assert!(Config::load_from_str("transport:\n  kind: tcp\n").is_err());
        assert!(Config::load_from_str("transport:\n  kind: serial\n").is_err());
        assert!(Config::load_from_str("transport: {}\nretry:\n  max_attempts: 0\n").is_err());
        assert!(Config::load_from_str(
            "transport: {}\nplanner:\n  power_min_percent: 50\n  power_max_percent: 10\n"
        )
        .is_err());
    }
}
