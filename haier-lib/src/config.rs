//! Runtime configuration.
//!
//! Every struct has protocol defaults, (de)serialises with serde and checks
//! itself with `validate()`. Durations are written as integer milliseconds.

use crate::error::HaierError;
use crate::pairer::PairingWindows;
use crate::sync::SyncQuality;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Serde adapter storing a `Duration` as whole milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

/// Bounded exponential backoff for reopening a failed port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
            read_timeout: Duration::from_millis(100),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SerialConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), HaierError> {
        if self.port.trim().is_empty() {
            return Err(HaierError::Configuration("port path cannot be empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(HaierError::Configuration(format!(
                "{}: baud rate must be greater than zero",
                self.port
            )));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(HaierError::Configuration(format!(
                "{}: data bits must be 5, 6, 7 or 8",
                self.port
            )));
        }
        if ![1, 2].contains(&self.stop_bits) {
            return Err(HaierError::Configuration(format!(
                "{}: stop bits must be 1 or 2",
                self.port
            )));
        }
        if self.read_timeout.is_zero() {
            return Err(HaierError::Configuration(format!(
                "{}: read timeout must be greater than zero",
                self.port
            )));
        }
        if self.reconnect.initial_backoff > self.reconnect.max_backoff {
            return Err(HaierError::Configuration(format!(
                "{}: initial backoff exceeds maximum backoff",
                self.port
            )));
        }
        Ok(())
    }

    pub(crate) fn tokio_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    pub(crate) fn tokio_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    pub(crate) fn tokio_parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }

    pub(crate) fn tokio_flow_control(&self) -> tokio_serial::FlowControl {
        match self.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base-time difference above which a sync warning is raised
    #[serde(with = "millis")]
    pub max_base_difference: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_base_difference: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Window used until the synchronizer has rated the clocks
    #[serde(with = "millis")]
    pub default_window: Duration,
    pub queue_capacity: usize,
    pub windows: PairingWindows,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            default_window: Duration::from_secs(5),
            queue_capacity: 64,
            windows: PairingWindows::default(),
        }
    }
}

impl PairingConfig {
    pub fn window_for(&self, quality: Option<SyncQuality>) -> Duration {
        quality.map_or(self.default_window, |q| self.windows.for_quality(q))
    }

    pub fn validate(&self) -> Result<(), HaierError> {
        if self.queue_capacity == 0 {
            return Err(HaierError::Configuration("pairing queue capacity must be at least 1".to_string()));
        }
        let windows = [
            self.default_window,
            self.windows.excellent,
            self.windows.good,
            self.windows.fair,
            self.windows.poor,
        ];
        if windows.iter().any(Duration::is_zero) {
            return Err(HaierError::Configuration("pairing windows must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Silence after which a session-start frame opens a new session
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Error signals in a row that force the ERROR state
    pub error_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            error_threshold: 3,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), HaierError> {
        if self.error_threshold == 0 {
            return Err(HaierError::Configuration("error threshold must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Multiplier applied to every base delay; 0 replays back to back
    pub timing_factor: f64,
    #[serde(with = "millis")]
    pub response_timeout: Duration,
    pub await_responses: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            timing_factor: 1.0,
            response_timeout: Duration::from_secs(5),
            await_responses: true,
        }
    }
}

impl ReplayConfig {
    pub fn validate(&self) -> Result<(), HaierError> {
        if !self.timing_factor.is_finite() || self.timing_factor < 0.0 {
            return Err(HaierError::Configuration(format!(
                "timing factor must be a non-negative number, got {}",
                self.timing_factor
            )));
        }
        if self.await_responses && self.response_timeout.is_zero() {
            return Err(HaierError::Configuration("response timeout must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Everything the dual-stream monitor needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Port carrying controller (machine) traffic
    pub outbound: SerialConfig,
    /// Port carrying modem traffic
    pub inbound: SerialConfig,
    pub sync: SyncConfig,
    pub pairing: PairingConfig,
    pub session: SessionConfig,
    /// Capacity of the reader -> event loop channel
    pub channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            outbound: SerialConfig::default(),
            inbound: SerialConfig::default(),
            sync: SyncConfig::default(),
            pairing: PairingConfig::default(),
            session: SessionConfig::default(),
            channel_capacity: 256,
        }
    }
}

impl MonitorConfig {
    pub fn new(outbound_port: impl Into<String>, inbound_port: impl Into<String>) -> Self {
        Self {
            outbound: SerialConfig::new(outbound_port),
            inbound: SerialConfig::new(inbound_port),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HaierError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Checks that only concern the correlator, not the ports
    pub fn validate_correlation(&self) -> Result<(), HaierError> {
        self.pairing.validate()?;
        self.session.validate()?;
        if self.channel_capacity == 0 {
            return Err(HaierError::Configuration("channel capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), HaierError> {
        self.outbound.validate()?;
        self.inbound.validate()?;
        if self.outbound.port == self.inbound.port {
            return Err(HaierError::Configuration(format!(
                "outbound and inbound streams use the same port {}",
                self.outbound.port
            )));
        }
        self.validate_correlation()
    }
}
