use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Sample rate older emulated hosts are limited to.
pub const EMULATED_SAMPLE_RATE: u32 = 8_000;

/// Top-level configuration structure for the engine controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output: OutputConfig,
    pub host: HostKind,
    /// Number of restart attempts after which `can_restart` refuses.
    pub retry_ceiling: u32,
    /// Delay after the first start before a missing render confirmation is
    /// reported as a thread-start failure.
    pub startup_watchdog_ms: u64,
    /// Pause the render thread observes before parking on the gate.
    pub pause_settle_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            host: HostKind::Native,
            retry_ceiling: 5,
            startup_watchdog_ms: 2_000,
            pause_settle_ms: 20,
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn startup_watchdog(&self) -> Duration {
        Duration::from_millis(self.startup_watchdog_ms)
    }

    /// Returns the output parameters to hand to the native layer, with the
    /// sample rate clamped on emulated hosts.
    pub fn effective_output(&self) -> OutputConfig {
        let mut output = self.output.clone();
        if self.host == HostKind::Emulated {
            output.sample_rate = EMULATED_SAMPLE_RATE;
        }
        output
    }
}

/// Output parameters handed to the native engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub output_channels: u16,
    pub input_channels: u16,
    pub driver: Driver,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            buffer_size: 2_048,
            output_channels: 2,
            input_channels: 0,
            driver: Driver::OpenSl,
        }
    }
}

impl OutputConfig {
    pub fn new(sample_rate: u32, buffer_size: usize, output_channels: u16, driver: Driver) -> Self {
        Self {
            sample_rate,
            buffer_size,
            output_channels,
            input_channels: 0,
            driver,
        }
    }

    pub fn with_input_channels(mut self, input_channels: u16) -> Self {
        self.input_channels = input_channels;
        self
    }

    /// Wall-clock duration of a single rendered buffer.
    pub fn buffer_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.buffer_size as f64 / self.sample_rate as f64)
    }
}

/// Audio output driver the native layer should open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    OpenSl,
    AAudio,
}

/// Kind of host the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    Native,
    /// Virtualised or emulated hardware that only renders reliably at
    /// [`EMULATED_SAMPLE_RATE`].
    Emulated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{ "output": { "sample_rate": 48000 }, "retry_ceiling": 3 }"#)
                .unwrap();

        assert_eq!(config.output.sample_rate, 48_000);
        assert_eq!(config.output.buffer_size, 2_048);
        assert_eq!(config.retry_ceiling, 3);
        assert_eq!(config.startup_watchdog(), Duration::from_secs(2));
    }

    #[test]
    fn emulated_host_clamps_sample_rate() {
        let config = EngineConfig {
            host: HostKind::Emulated,
            ..Default::default()
        };

        assert_eq!(config.effective_output().sample_rate, EMULATED_SAMPLE_RATE);
        assert_eq!(config.output.sample_rate, 44_100);
    }

    #[test]
    fn rejects_unknown_driver() {
        let err = EngineConfig::from_json_str(r#"{ "output": { "driver": "jack" } }"#);
        assert!(err.is_err());
    }

    #[test]
    fn buffer_duration_matches_rate() {
        let output = OutputConfig::new(1_000, 250, 2, Driver::AAudio);
        assert_eq!(output.buffer_duration(), Duration::from_millis(250));
    }
}
