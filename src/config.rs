use crate::registry::MacAddress;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Link parameters requested for every connection.
///
/// Intervals are in units of 1.25ms and the supervision timeout in units
/// of 10ms, as negotiated by the link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default = "ConnectionParams::default_interval")]
    pub min_interval: u16,
    #[serde(default = "ConnectionParams::default_interval")]
    pub max_interval: u16,
    #[serde(default)]
    pub latency: u16,
    #[serde(default = "ConnectionParams::default_supervision_timeout")]
    pub supervision_timeout: u16,
    #[serde(
        default = "ConnectionParams::default_connect_timeout",
        with = "humantime_serde"
    )]
    pub connect_timeout: Duration,
}

impl ConnectionParams {
    fn default_interval() -> u16 {
        24
    }

    fn default_supervision_timeout() -> u16 {
        400
    }

    fn default_connect_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            min_interval: Self::default_interval(),
            max_interval: Self::default_interval(),
            latency: 0,
            supervision_timeout: Self::default_supervision_timeout(),
            connect_timeout: Self::default_connect_timeout(),
        }
    }
}

/// Pacing of the setup commands sent after subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitTiming {
    #[serde(default = "InitTiming::default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(default = "InitTiming::default_request_gap", with = "humantime_serde")]
    pub request_gap: Duration,
    #[serde(default = "InitTiming::default_enable_gap", with = "humantime_serde")]
    pub enable_gap: Duration,
}

impl InitTiming {
    fn default_initial_delay() -> Duration {
        Duration::from_secs(1)
    }

    fn default_request_gap() -> Duration {
        Duration::from_millis(800)
    }

    fn default_enable_gap() -> Duration {
        Duration::from_millis(500)
    }
}

impl Default for InitTiming {
    fn default() -> Self {
        Self {
            initial_delay: Self::default_initial_delay(),
            request_gap: Self::default_request_gap(),
            enable_gap: Self::default_enable_gap(),
        }
    }
}

/// Connection attempts per arming and the pause after each failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub step: Duration,
}

impl BackoffPolicy {
    /// Pause after `failed` attempts, or `None` once attempts are exhausted.
    pub fn delay_after(&self, failed: u32) -> Option<Duration> {
        if failed >= self.max_attempts {
            return None;
        }
        Some(self.base.saturating_add(self.step.saturating_mul(failed)))
    }
}

/// Engine configuration, usually read from a YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default = "EngineConfig::default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
    #[serde(default = "EngineConfig::default_scan_interval", with = "humantime_serde")]
    pub scan_interval: Duration,
    #[serde(default = "EngineConfig::default_scan_duration", with = "humantime_serde")]
    pub scan_duration: Duration,
    #[serde(default = "EngineConfig::default_scan_holdoff", with = "humantime_serde")]
    pub scan_holdoff: Duration,
    #[serde(default = "EngineConfig::default_connect_spacing", with = "humantime_serde")]
    pub connect_spacing: Duration,
    #[serde(default = "EngineConfig::default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "EngineConfig::default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "EngineConfig::default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(default = "EngineConfig::default_backoff_step", with = "humantime_serde")]
    pub backoff_step: Duration,
    #[serde(default = "EngineConfig::default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    #[serde(default = "EngineConfig::default_service_attempts")]
    pub service_attempts: u32,
    #[serde(
        default = "EngineConfig::default_service_retry_delay",
        with = "humantime_serde"
    )]
    pub service_retry_delay: Duration,
    #[serde(default = "EngineConfig::default_liveness_timeout", with = "humantime_serde")]
    pub liveness_timeout: Duration,
    /// Notifications dropped after each telemetry frame. Tuned for current
    /// firmware; other revisions may echo differently.
    #[serde(default = "EngineConfig::default_echo_suppression_count")]
    pub echo_suppression_count: u32,
    #[serde(default)]
    pub connection: ConnectionParams,
    #[serde(default)]
    pub init: InitTiming,
    #[serde(default = "EngineConfig::default_notification_queue")]
    pub notification_queue: usize,
}

impl EngineConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "jkbms.yaml";

    fn default_tick_interval() -> Duration {
        Duration::from_millis(100)
    }

    fn default_scan_interval() -> Duration {
        Duration::from_secs(20)
    }

    fn default_scan_duration() -> Duration {
        Duration::from_secs(3)
    }

    fn default_scan_holdoff() -> Duration {
        Duration::from_secs(10)
    }

    fn default_connect_spacing() -> Duration {
        Duration::from_secs(5)
    }

    fn default_max_connections() -> usize {
        3
    }

    fn default_connect_attempts() -> u32 {
        3
    }

    fn default_backoff_base() -> Duration {
        Duration::from_secs(2)
    }

    fn default_backoff_step() -> Duration {
        Duration::from_secs(1)
    }

    fn default_settle_delay() -> Duration {
        Duration::from_millis(100)
    }

    fn default_service_attempts() -> u32 {
        3
    }

    fn default_service_retry_delay() -> Duration {
        Duration::from_millis(500)
    }

    fn default_liveness_timeout() -> Duration {
        Duration::from_secs(25)
    }

    fn default_echo_suppression_count() -> u32 {
        10
    }

    fn default_notification_queue() -> usize {
        64
    }

    pub fn with_devices<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.connect_attempts,
            base: self.backoff_base,
            step: self.backoff_step,
        }
    }

    /// Parses the configured device addresses.
    pub fn targets(&self) -> std::result::Result<Vec<MacAddress>, Error> {
        self.devices.iter().map(|device| device.parse()).collect()
    }

    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections must be at least 1".into()));
        }
        if self.connect_attempts == 0 {
            return Err(Error::InvalidConfig("connect_attempts must be at least 1".into()));
        }
        if self.service_attempts == 0 {
            return Err(Error::InvalidConfig("service_attempts must be at least 1".into()));
        }
        if self.notification_queue == 0 {
            return Err(Error::InvalidConfig("notification_queue must be at least 1".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::InvalidConfig("tick_interval must not be zero".into()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            tick_interval: Self::default_tick_interval(),
            scan_interval: Self::default_scan_interval(),
            scan_duration: Self::default_scan_duration(),
            scan_holdoff: Self::default_scan_holdoff(),
            connect_spacing: Self::default_connect_spacing(),
            max_connections: Self::default_max_connections(),
            connect_attempts: Self::default_connect_attempts(),
            backoff_base: Self::default_backoff_base(),
            backoff_step: Self::default_backoff_step(),
            settle_delay: Self::default_settle_delay(),
            service_attempts: Self::default_service_attempts(),
            service_retry_delay: Self::default_service_retry_delay(),
            liveness_timeout: Self::default_liveness_timeout(),
            echo_suppression_count: Self::default_echo_suppression_count(),
            connection: ConnectionParams::default(),
            init: InitTiming::default(),
            notification_queue: Self::default_notification_queue(),
        }
    }
}
