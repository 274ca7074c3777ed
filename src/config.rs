use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::handlers::selfcheck;

/// Top-level configuration for the connscope collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Upstream sensor connection configuration.
    #[serde(default)]
    pub sensor: SensorConfig,

    /// Startup self-check configuration.
    #[serde(default)]
    pub selfcheck: SelfCheckConfig,

    /// Connection diff reporting configuration.
    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Event queue capacity between the probe and the drain task.
    /// Default: 65536.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

/// Upstream sensor connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// Sensor gRPC endpoint (e.g. "http://sensor:9090").
    #[serde(default)]
    pub endpoint: String,

    /// Delay between redial attempts. Default: 1s.
    #[serde(default = "default_redial_interval", with = "humantime_serde")]
    pub redial_interval: Duration,

    /// Per-attempt connect timeout. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long startup waits for the first runtime configuration before
    /// proceeding with filtering disabled. Default: 2s.
    #[serde(default = "default_config_wait_timeout", with = "humantime_serde")]
    pub config_wait_timeout: Duration,
}

/// Startup self-check configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SelfCheckConfig {
    /// Run the startup self-check. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Process name of the synthetic self-check binary.
    #[serde(default = "default_selfcheck_name")]
    pub name: String,

    /// Executable path of the synthetic self-check binary.
    #[serde(default = "default_selfcheck_exe_path")]
    pub exe_path: String,

    /// Time allowed for self-check events to arrive. Default: 5s.
    #[serde(default = "default_selfcheck_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Launch the self-check binary at startup. Disable when an external
    /// harness produces the events instead. Default: true.
    #[serde(default = "default_true")]
    pub spawn: bool,
}

/// Connection diff reporting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    /// Interval between snapshot/diff cycles. Default: 30s.
    #[serde(default = "default_reporting_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_redial_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_config_wait_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_selfcheck_name() -> String {
    selfcheck::DEFAULT_NAME.to_string()
}

fn default_selfcheck_exe_path() -> String {
    selfcheck::DEFAULT_EXE_PATH.to_string()
}

fn default_selfcheck_timeout() -> Duration {
    selfcheck::DEFAULT_TIMEOUT
}

fn default_reporting_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_event_channel_capacity() -> usize {
    65536
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sensor: SensorConfig::default(),
            selfcheck: SelfCheckConfig::default(),
            reporting: ReportingConfig::default(),
            health: HealthConfig::default(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            redial_interval: default_redial_interval(),
            connect_timeout: default_connect_timeout(),
            config_wait_timeout: default_config_wait_timeout(),
        }
    }
}

impl Default for SelfCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_selfcheck_name(),
            exe_path: default_selfcheck_exe_path(),
            timeout: default_selfcheck_timeout(),
            spawn: true,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            interval: default_reporting_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.sensor.endpoint.is_empty() {
            bail!("sensor.endpoint is required");
        }

        if self.event_channel_capacity == 0 {
            bail!("event_channel_capacity must be positive");
        }

        if self.reporting.interval.is_zero() {
            bail!("reporting.interval must be positive");
        }

        if self.selfcheck.enabled {
            if self.selfcheck.timeout.is_zero() {
                bail!("selfcheck.timeout must be positive");
            }

            if self.selfcheck.name.is_empty() && self.selfcheck.exe_path.is_empty() {
                bail!("selfcheck requires a name or an exe_path");
            }
        }

        Ok(())
    }
}
