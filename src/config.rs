use crate::core::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Limits for the admission queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum number of calls executing at once.
    pub max_concurrent: usize,
    /// Maximum number of calls waiting for a slot.
    pub queue_limit: usize,
    /// Deadline applied to every dispatched call. `None` disables it.
    ///
    /// Unlike the timeout guard, this deadline cancels the work: its future is
    /// dropped at the deadline, so nothing after its pending `.await` runs.
    pub request_timeout_ms: Option<u64>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            queue_limit: 50,
            request_timeout_ms: Some(30_000),
        }
    }
}

impl AdmissionConfig {
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn request_timeout_duration(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Settings for the timeout race wrapper and its secondary admission gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    pub max_concurrent_requests: usize,
    /// How often a caller re-checks the gate while it is saturated.
    pub poll_interval_ms: u64,
    /// Deadline used by the safe-request façade.
    pub default_timeout_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            poll_interval_ms: 100,
            default_timeout_ms: 10_000,
        }
    }
}

impl GuardConfig {
    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Thresholds for the passive health monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    /// Age after which a queued call or connection attempt counts as long-running.
    pub stale_connection_threshold_ms: u64,
    /// Age after which a guarded request counts as long-running.
    pub stale_request_threshold_ms: u64,
    /// Failure ratio in `(0, 1]` above which an error-rate alert fires.
    pub error_rate_threshold: f64,
    /// Calls a window must contain before its error rate is judged.
    pub min_sample_size: u64,
    /// Absolute active-call count that signals a cap-bypass leak.
    pub active_ceiling: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            stale_connection_threshold_ms: 15_000,
            stale_request_threshold_ms: 10_000,
            error_rate_threshold: 0.2,
            min_sample_size: 10,
            active_ceiling: 10,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn stale_connection_threshold(mut self, threshold: Duration) -> Self {
        self.stale_connection_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn stale_request_threshold(mut self, threshold: Duration) -> Self {
        self.stale_request_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    pub fn min_sample_size(mut self, size: u64) -> Self {
        self.min_sample_size = size;
        self
    }

    pub fn active_ceiling(mut self, ceiling: usize) -> Self {
        self.active_ceiling = ceiling;
        self
    }
}

/// Settings for the persistent connection client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SocketConfig {
    pub url: String,
    pub max_reconnect_attempts: u32,
    /// Constant delay between reconnection attempts.
    pub reconnect_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_payload: String,
    /// Literal acknowledgement frame that is never delivered to the callback.
    pub ack_sentinel: String,
    /// Inbound messages with this `type` belong to the login handshake and are dropped.
    pub login_message_type: String,
    pub connect_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 3_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_payload: "heartbeat".to_string(),
            ack_sentinel: "success".to_string(),
            login_message_type: "login".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl SocketConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Every recognised option of the resilience layer, grouped by component.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    pub admission: AdmissionConfig,
    pub guard: GuardConfig,
    pub health: HealthConfig,
    pub socket: SocketConfig,
}

impl ResilienceConfig {
    pub fn admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    pub fn guard(mut self, guard: GuardConfig) -> Self {
        self.guard = guard;
        self
    }

    pub fn health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn socket(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }

    /// Parse a JSON document. Missing fields fall back to their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            NetError::Io(format!("Failed to read config '{}': {}", path.display(), err))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.admission.validate()?;
        self.guard.validate()?;
        self.health.validate()?;
        self.socket.validate()
    }
}

fn invalid(msg: &str) -> Result<()> {
    Err(NetError::InvalidConfig(msg.to_string()))
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return invalid("admission.max_concurrent must be > 0");
        }
        if self.queue_limit == 0 {
            return invalid("admission.queue_limit must be > 0");
        }
        if self.request_timeout_ms == Some(0) {
            return invalid("admission.request_timeout_ms must be > 0 when set");
        }
        Ok(())
    }
}

impl GuardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return invalid("guard.max_concurrent_requests must be > 0");
        }
        if self.poll_interval_ms == 0 {
            return invalid("guard.poll_interval_ms must be > 0");
        }
        if self.default_timeout_ms == 0 {
            return invalid("guard.default_timeout_ms must be > 0");
        }
        Ok(())
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_ms == 0 {
            return invalid("health.check_interval_ms must be > 0");
        }
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 1.0) {
            return invalid("health.error_rate_threshold must be in (0, 1]");
        }
        Ok(())
    }
}

impl SocketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return invalid("socket.url cannot be empty");
        }
        if self.heartbeat_interval_ms == 0 {
            return invalid("socket.heartbeat_interval_ms must be > 0");
        }
        if self.connect_timeout_ms == 0 {
            return invalid("socket.connect_timeout_ms must be > 0");
        }
        Ok(())
    }
}
