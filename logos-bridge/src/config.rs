//! Bridge configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::message::Endpoint;

/// Timing and sizing knobs for a [`Bridge`](crate::bridge::Bridge).
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides:
///
/// ```
/// use logos_bridge::{BridgeConfig, Endpoint};
///
/// let config = BridgeConfig::from_json(r#"{ "role": "consumer", "retryIntervalMs": 250 }"#).unwrap();
/// assert_eq!(config.role, Endpoint::Consumer);
/// assert_eq!(config.retry_interval_ms, 250);
/// assert_eq!(config.sync_interval_ms, 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Which peer this bridge speaks for. Outbound messages target the other one.
    pub role: Endpoint,
    /// Period of the failed-message retry sweep
    pub retry_interval_ms: u64,
    /// Period of the reconciliation tick
    pub sync_interval_ms: u64,
    /// Period of the heartbeat ping
    pub heartbeat_interval_ms: u64,
    /// Retries before a failed message is abandoned. `None` retries forever.
    pub max_retry_attempts: Option<u32>,
    /// Buffered events per subscriber before slow subscribers lag
    pub event_capacity: usize,
    /// Weight of the newest sample in rolling channel latency/reliability.
    pub telemetry_smoothing: f64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            role: Endpoint::Producer,
            retry_interval_ms: 5_000,
            sync_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            max_retry_attempts: None,
            event_capacity: 256,
            telemetry_smoothing: 0.2,
        }
    }
}

impl BridgeConfig {
    /// Default configuration for the given role.
    pub fn for_role(role: Endpoint) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, BridgeError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BridgeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if !matches!(self.role, Endpoint::Producer | Endpoint::Consumer) {
            return Err(BridgeError::InvalidConfig(format!(
                "role must be producer or consumer, got {:?}",
                self.role
            )));
        }
        if self.retry_interval_ms == 0 || self.sync_interval_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(BridgeError::InvalidConfig("intervals must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(BridgeError::InvalidConfig("event_capacity must be non-zero".into()));
        }
        if !(self.telemetry_smoothing > 0.0 && self.telemetry_smoothing <= 1.0) {
            return Err(BridgeError::InvalidConfig(
                "telemetry_smoothing must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
