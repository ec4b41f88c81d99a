//! Configuration loading for the PMD daemon

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use crate::{Result, PmdError};

/// Default TCP port of the serial-to-Ethernet bridge
pub const DEFAULT_BRIDGE_PORT: u16 = 4001;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub controller: ControllerConfig,
    pub transport: TransportSettings,
    pub polling: PollingConfig,
    pub motor: MotorConfig,
    pub publishing: PublishingConfig,
}

/// Where the controller's serial bridge lives
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportSettings {
    pub request_timeout_ms: u64,
    /// Socket read timeout; bounds how long the reader takes to notice shutdown
    pub read_poll_ms: u64,
    pub line_terminator: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    pub period_us: u64,
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MotorConfig {
    pub max_step_rate: u32,
    /// Encoder resolution in nm, passed through to monitor output
    pub enc_res_nm: f64,
    pub enc_sign: i32,
    pub jog_steps: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishingConfig {
    pub pub_rate_hz: u32,
    pub only_on_change: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "b-softimax-moxa-0".to_string(),
            port: DEFAULT_BRIDGE_PORT,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 1000,
            read_poll_ms: 10,
            line_terminator: "\n".to_string(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            period_us: 100,
            autostart: true,
        }
    }
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            max_step_rate: 972,
            enc_res_nm: 1.0,
            enc_sign: -1,
            jog_steps: 32,
        }
    }
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            pub_rate_hz: 10,
            only_on_change: true,
        }
    }
}

impl DaemonConfig {
    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| PmdError::Config(format!("Failed to read {}: {}", config_path, e)))?;

        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: DaemonConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.controller.host.is_empty() {
            return Err(PmdError::Config("controller.host must not be empty".to_string()));
        }
        if self.transport.request_timeout_ms == 0 {
            return Err(PmdError::Config("transport.request_timeout_ms must be > 0".to_string()));
        }
        if self.transport.line_terminator.is_empty() {
            return Err(PmdError::Config("transport.line_terminator must not be empty".to_string()));
        }
        if self.publishing.pub_rate_hz == 0 {
            return Err(PmdError::Config("publishing.pub_rate_hz must be > 0".to_string()));
        }
        Ok(())
    }
}

impl TransportSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms.max(1))
    }
}

impl PollingConfig {
    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us)
    }
}

impl PublishingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.pub_rate_hz.max(1) as f64)
    }
}
