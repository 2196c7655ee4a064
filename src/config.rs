//! Service configuration, read once at startup from a TOML file.
//!
//! Every field has a default, so a missing file or an empty one yields a
//! working monitor-mode configuration. `SHUNT_AGGREGATOR_LOG` overrides the
//! log level.

use crate::aggregator::{ChargeLimits, TemperatureThresholds};
use crate::control::{ControlSettings, ShuntSelector};
use crate::error::AggregatorError;
use crate::publisher::DeviceIdentity;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "SHUNT_AGGREGATOR_CONFIG";
pub const LOG_LEVEL_ENV: &str = "SHUNT_AGGREGATOR_LOG";
pub const DEFAULT_CONFIG_PATH: &str = "/data/shunt_aggregator/config.toml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Pure monitoring, no charge-control paths.
    #[default]
    Monitor,
    /// Also expose charge limits and allow-to-charge/discharge flags.
    VirtualBms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Gateway in front of the member shunts, `host:port`.
    pub gateway: String,
    #[serde(default)]
    pub unit_ids: Vec<u8>,
    /// Where the aggregate's own registers are served. Not served when unset.
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lost_after_failures")]
    pub lost_after_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_device_instance")]
    pub device_instance: u32,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_product_id")]
    pub product_id: i64,
    /// Bus address prefix shared by member shunts.
    #[serde(default = "default_member_prefix")]
    pub member_prefix: String,
    /// Substring a member's product name must contain.
    #[serde(default = "default_product_match")]
    pub product_match: String,
    /// Shunts kept out of the aggregate, by instance or custom name.
    #[serde(default)]
    pub exclude_shunts: Vec<ShuntSelector>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub max_charge_voltage: Option<f64>,
    #[serde(default)]
    pub max_charge_current: Option<f64>,
    #[serde(default)]
    pub max_discharge_current: Option<f64>,
    #[serde(default = "default_temp_cold_danger")]
    pub temp_cold_danger: f64,
    #[serde(default = "default_temp_hot_danger")]
    pub temp_hot_danger: f64,
    #[serde(default = "default_discovery_min_interval_secs")]
    pub discovery_min_interval_secs: u64,
    #[serde(default = "default_discovery_max_interval_secs")]
    pub discovery_max_interval_secs: u64,
    /// Scans without any member before a warning is logged.
    #[serde(default = "default_search_trials")]
    pub search_trials: u32,
    /// Status log period, 0 disables it.
    #[serde(default = "default_log_period_secs")]
    pub log_period_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub modbus: Option<ModbusConfig>,
}

fn default_device_name() -> String {
    "SmartShunt Aggregate".to_string()
}
fn default_device_instance() -> u32 {
    100
}
fn default_service_name() -> String {
    "com.victronenergy.battery.aggregate_shunts".to_string()
}
fn default_product_id() -> i64 {
    0xA389
}
fn default_member_prefix() -> String {
    "com.victronenergy.battery".to_string()
}
fn default_product_match() -> String {
    "SmartShunt".to_string()
}
fn default_temp_cold_danger() -> f64 {
    5.0
}
fn default_temp_hot_danger() -> f64 {
    45.0
}
fn default_discovery_min_interval_secs() -> u64 {
    1
}
fn default_discovery_max_interval_secs() -> u64 {
    1800
}
fn default_search_trials() -> u32 {
    10
}
fn default_log_period_secs() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_lost_after_failures() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            device_instance: default_device_instance(),
            service_name: default_service_name(),
            product_id: default_product_id(),
            member_prefix: default_member_prefix(),
            product_match: default_product_match(),
            exclude_shunts: Vec::new(),
            mode: Mode::default(),
            max_charge_voltage: None,
            max_charge_current: None,
            max_discharge_current: None,
            temp_cold_danger: default_temp_cold_danger(),
            temp_hot_danger: default_temp_hot_danger(),
            discovery_min_interval_secs: default_discovery_min_interval_secs(),
            discovery_max_interval_secs: default_discovery_max_interval_secs(),
            search_trials: default_search_trials(),
            log_period_secs: default_log_period_secs(),
            log_level: default_log_level(),
            modbus: None,
        }
    }
}

/// Path of the configuration file, from the environment or the default.
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Loads, applies environment overrides and validates the configuration.
pub fn load() -> anyhow::Result<Config> {
    let mut config = load_from(&config_path())?;
    config.apply_log_override(std::env::var(LOG_LEVEL_ENV).ok());
    config.validate()?;
    Ok(config)
}

/// Reads the configuration at `path`. A missing file yields the defaults.
pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    Config::from_toml(&raw).with_context(|| format!("Failed to parse config at {}", path.display()))
}

impl Config {
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn apply_log_override(&mut self, level: Option<String>) {
        if let Some(level) = level.filter(|l| !l.trim().is_empty()) {
            self.log_level = level;
        }
    }

    /// Checks the whole configuration and reports every problem at once.
    pub fn validate(&self) -> Result<(), AggregatorError> {
        let mut problems = Vec::new();

        if self.mode == Mode::VirtualBms
            && ![
                self.max_charge_voltage,
                self.max_charge_current,
                self.max_discharge_current,
            ]
            .iter()
            .any(|limit| limit.is_some_and(|v| v > 0.0))
        {
            problems
                .push("virtual-bms mode needs at least one charge limit above zero".to_string());
        }
        if self.discovery_min_interval_secs < 1 {
            problems.push("discovery_min_interval_secs must be at least 1".to_string());
        }
        if self.discovery_min_interval_secs > self.discovery_max_interval_secs {
            problems.push(format!(
                "discovery_min_interval_secs ({}) exceeds discovery_max_interval_secs ({})",
                self.discovery_min_interval_secs, self.discovery_max_interval_secs
            ));
        }
        if self.temp_cold_danger >= self.temp_hot_danger {
            problems.push(format!(
                "temp_cold_danger ({}) must be below temp_hot_danger ({})",
                self.temp_cold_danger, self.temp_hot_danger
            ));
        }
        if self.member_prefix.is_empty() {
            problems.push("member_prefix must not be empty".to_string());
        }
        if let Some(modbus) = &self.modbus {
            if modbus.unit_ids.is_empty() {
                problems.push("modbus.unit_ids needs at least one unit id".to_string());
            }
            if modbus.gateway.parse::<SocketAddr>().is_err() {
                problems.push(format!(
                    "modbus.gateway `{}` is not a socket address",
                    modbus.gateway
                ));
            }
            if let Some(listen) = &modbus.listen {
                if listen.parse::<SocketAddr>().is_err() {
                    problems.push(format!("modbus.listen `{listen}` is not a socket address"));
                }
            }
            if modbus.poll_interval_ms == 0 {
                problems.push("modbus.poll_interval_ms must be above zero".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AggregatorError::Config(problems.join("; ")))
        }
    }

    pub fn thresholds(&self) -> TemperatureThresholds {
        TemperatureThresholds {
            cold_danger: self.temp_cold_danger,
            hot_danger: self.temp_hot_danger,
        }
    }

    /// Charge ceilings, only in virtual-bms mode.
    pub fn charge_limits(&self) -> Option<ChargeLimits> {
        (self.mode == Mode::VirtualBms).then_some(ChargeLimits {
            max_charge_voltage: self.max_charge_voltage,
            max_charge_current: self.max_charge_current,
            max_discharge_current: self.max_discharge_current,
        })
    }

    /// Control settings the service starts with.
    pub fn control_settings(&self) -> ControlSettings {
        ControlSettings {
            excluded: self.exclude_shunts.clone(),
            thresholds: self.thresholds(),
            ..Default::default()
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            service_name: self.service_name.clone(),
            device_instance: self.device_instance,
            product_id: self.product_id,
            product_name: "SmartShunt Aggregate".to_string(),
            custom_name: self.device_name.clone(),
            firmware_version: None,
            serial: "AGGREGATE01".to_string(),
            connection: "Virtual".to_string(),
        }
    }

    pub fn discovery_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.discovery_min_interval_secs),
            Duration::from_secs(self.discovery_max_interval_secs),
        )
    }

    pub fn log_period(&self) -> Option<Duration> {
        (self.log_period_secs > 0).then(|| Duration::from_secs(self.log_period_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.charge_limits(), None);
        assert_eq!(config.log_period(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_from(Path::new("/nonexistent/shunt_aggregator.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_full_file() {
        let config = Config::from_toml(
            r#"
            device_name = "House bank"
            exclude_shunts = [278, "Starter"]
            mode = "virtual-bms"
            max_charge_voltage = 14.2
            max_charge_current = 100.0
            temp_cold_danger = 2.0
            discovery_max_interval_secs = 60
            log_period_secs = 0

            [modbus]
            gateway = "192.168.1.20:502"
            unit_ids = [1, 2]
            listen = "0.0.0.0:5502"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, Mode::VirtualBms);
        assert_eq!(
            config.exclude_shunts,
            vec![ShuntSelector::Instance(278), ShuntSelector::Name("Starter".into())]
        );
        let limits = config.charge_limits().unwrap();
        assert_eq!(limits.max_charge_voltage, Some(14.2));
        assert_eq!(limits.max_discharge_current, None);
        assert_eq!(config.thresholds().cold_danger, 2.0);
        assert_eq!(config.log_period(), None);
        let modbus = config.modbus.unwrap();
        assert_eq!(modbus.poll_interval_ms, 1000);
        assert_eq!(modbus.lost_after_failures, 5);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let config = Config {
            mode: Mode::VirtualBms,
            discovery_min_interval_secs: 0,
            temp_cold_danger: 50.0,
            modbus: Some(ModbusConfig {
                gateway: "not-an-address".to_string(),
                unit_ids: Vec::new(),
                listen: None,
                poll_interval_ms: 1000,
                lost_after_failures: 5,
            }),
            ..Default::default()
        };
        let Err(AggregatorError::Config(message)) = config.validate() else {
            panic!("expected a configuration error");
        };
        assert!(message.contains("charge limit"));
        assert!(message.contains("discovery_min_interval_secs must be at least 1"));
        assert!(message.contains("temp_cold_danger"));
        assert!(message.contains("unit_ids"));
        assert!(message.contains("not-an-address"));
    }

    #[test]
    fn test_min_interval_above_max_is_rejected() {
        let config = Config {
            discovery_min_interval_secs: 120,
            discovery_max_interval_secs: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_override() {
        let mut config = Config::default();
        config.apply_log_override(Some("debug".to_string()));
        assert_eq!(config.log_level, "debug");
        config.apply_log_override(Some("  ".to_string()));
        config.apply_log_override(None);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_unknown_mode_fails_to_parse() {
        assert!(Config::from_toml(r#"mode = "bms""#).is_err());
    }
}
