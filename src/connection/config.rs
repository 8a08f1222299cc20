//! Connection tuning, loadable from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdkError};

/// Timeouts, heartbeat and reconnect policy for one managed connection.
///
/// Every field has a default, so a JSON file only names what it changes:
///
/// ```
/// use printlink::connection::ConnectionConfig;
///
/// let config = ConnectionConfig::from_json_str(
///     r#"{"request_timeout_ms": 1500, "heartbeat_interval_ms": null}"#,
/// ).unwrap();
/// assert_eq!(config.request_timeout_ms, 1500);
/// assert_eq!(config.heartbeat_interval(), None);
/// assert_eq!(config.reconnect.max_attempts, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Deadline for a command without its own timeout
    pub request_timeout_ms: u64,
    /// Per-chunk acknowledgment deadline for wait-next transfers
    pub chunk_timeout_ms: u64,
    /// Heartbeat period; `None` disables the heartbeat
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: u64,
    /// Consecutive heartbeat failures tolerated before the link counts as lost
    pub max_heartbeat_misses: u32,
    /// How long the link loop blocks in `receive` between outbound checks
    pub poll_interval_ms: u64,
    /// Largest inbound payload the decoder accepts
    pub max_frame_payload: usize,
    pub reconnect: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3000,
            chunk_timeout_ms: 3000,
            heartbeat_interval_ms: Some(5000),
            heartbeat_timeout_ms: 2000,
            max_heartbeat_misses: 2,
            poll_interval_ms: 10,
            max_frame_payload: 4096,
            reconnect: BackoffConfig::default(),
        }
    }
}

/// Exponential reconnect schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts after a link drop before settling at `Failed`
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ConnectionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SdkError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("request_timeout_ms", self.request_timeout_ms),
            ("chunk_timeout_ms", self.chunk_timeout_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms.unwrap_or(1)),
            ("reconnect.initial_delay_ms", self.reconnect.initial_delay_ms),
            ("max_frame_payload", self.max_frame_payload as u64),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        if let Some((field, _)) = zero {
            return Err(SdkError::InvalidParameter(format!("{} must be non-zero", field)));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(SdkError::InvalidParameter(
                "reconnect.max_delay_ms is below reconnect.initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
