//! Configuration management for Heatwatch
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files.

use crate::error::{HeatwatchError, Result};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

mod defaults;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Devices registered at startup
    pub devices: Vec<DeviceSeed>,

    /// Periodic collection job
    pub collector: CollectorConfig,

    /// Day-ahead price service
    pub prices: PricesConfig,

    /// Weather forecast service
    pub weather: WeatherConfig,

    /// Hourly history store
    pub store: StoreConfig,

    /// Heuristic constants for the savings estimator
    pub savings: SavingsConfig,

    /// MQTT broker connection
    pub mqtt: MqttConfig,

    /// HTTP client timeouts and identity
    pub network: NetworkConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Web server binding configuration
    pub web: WebConfig,

    /// Timezone used for hour buckets and price dates
    pub timezone: String,
}

/// Kind of a device in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    /// Plain MQTT switch
    Switch,
    /// Shelly cover used as an on/off heat source
    ShellyCover,
    /// Indoor temperature/humidity sensor
    Sensor,
    /// Three phase energy meter
    Meter,
}

/// Initial registry entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeviceSeed {
    /// Unique device id
    pub id: String,

    /// Display name
    pub name: String,

    /// Device kind
    #[serde(rename = "type")]
    pub kind: DeviceType,

    /// Device address (host or host:port); required for all but switches
    #[serde(default)]
    pub ip: Option<String>,

    /// MQTT base topic; required for switches and covers
    #[serde(default)]
    pub mqtt_topic: Option<String>,

    /// Switch threshold value
    #[serde(default)]
    pub threshold: Option<f64>,

    /// Free text description
    #[serde(default)]
    pub description: String,

    /// Whether the device is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Periodic collection job configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CollectorConfig {
    /// Seconds between collection cycles
    pub interval_secs: u64,

    /// Registry id of the energy meter
    pub meter_id: String,

    /// Registry id of the indoor sensor
    pub sensor_id: String,

    /// Registry id of the cover acting as heat source
    pub heat_source_id: String,

    /// Total power step (W) that is treated as the heat source switching
    pub power_step_threshold_w: f64,
}

/// Day-ahead price service configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PricesConfig {
    /// Base URL up to and including `/prices`
    pub base_url: String,

    /// Bidding area suffix (SE1..SE4)
    pub area: String,

    /// Timezone that defines "today" for the price service
    pub timezone: String,
}

/// Weather forecast service configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WeatherConfig {
    /// Base URL of the forecast API (up to `/api`)
    pub base_url: String,

    /// Longitude of the forecast point
    pub lon: f64,

    /// Latitude of the forecast point
    pub lat: f64,

    /// Display name of the configured location
    pub location_name: String,

    /// Forecast cache lifetime in seconds
    pub cache_secs: u64,

    /// Forecast parameter holding the air temperature
    pub temperature_parameter: String,
}

/// Hourly history store configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the JSON store file
    pub path: String,

    /// Number of days of hourly records to retain
    pub max_days: u32,
}

/// Savings estimator constants
///
/// These are policy values, not measured physical constants. Defaults keep
/// the estimates comparable with earlier data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SavingsConfig {
    /// Target indoor temperature without solar excess
    pub base_target_temp: f64,

    /// Solar excess (kW) above which the medium target applies
    pub solar_medium_excess_kw: f64,

    /// Target indoor temperature with medium solar excess
    pub solar_medium_target_temp: f64,

    /// Solar excess (kW) above which the high target applies
    pub solar_high_excess_kw: f64,

    /// Target indoor temperature with high solar excess
    pub solar_high_target_temp: f64,

    /// Indoor temperature below which the house counts as cold
    pub cold_indoor_below: f64,

    /// Upper bound of the comfort band
    pub comfort_indoor_max: f64,

    /// Price above which heating is not worth it in a cold house
    pub cold_price_limit: f64,

    /// Price above which heating is not worth it in the comfort band
    pub comfort_price_limit: f64,

    /// Share of exported energy value credited when heating on solar
    pub solar_benefit_factor: f64,

    /// Credit per degree stored above the bonus base temperature
    pub thermal_bonus_factor: f64,

    /// Temperature above which stored heat earns a bonus
    pub thermal_bonus_base_temp: f64,

    /// Energy (kWh) assumed saved per hour when correctly off
    pub off_saving_kwh: f64,

    /// Fixed saving credited when correctly on while warmer outside
    pub on_saving: f64,
}

/// MQTT broker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MqttConfig {
    /// Whether to connect to a broker at all
    pub enabled: bool,

    /// Broker host name
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Optional user name
    pub username: Option<String>,

    /// Optional password
    #[schemars(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Use TLS for the broker connection
    pub tls: bool,

    /// Keep alive interval in seconds
    pub keep_alive_secs: u64,
}

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout for meter, sensor and device requests
    pub device_timeout_secs: u64,

    /// Timeout for price and weather services
    pub service_timeout_secs: u64,

    /// Source id sent with device RPC calls
    pub app_id: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional override for the console layer
    pub console_level: Option<String>,

    /// Optional override for the file layer
    pub file_level: Option<String>,

    /// Path to log file (its directory receives the rotated files)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,

    /// Directory with dashboard assets served under /ui
    pub static_dir: Option<String>,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// First configuration file that exists, `$HEATWATCH_CONFIG` first
    pub fn locate() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var("HEATWATCH_CONFIG")
            && !explicit.is_empty()
        {
            return Some(PathBuf::from(explicit));
        }

        let default_paths = [
            "heatwatch.yaml",
            "/data/heatwatch.yaml",
            "/etc/heatwatch/config.yaml",
        ];

        default_paths
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Load configuration from the first location that exists
    pub fn load() -> Result<Self> {
        match Self::locate() {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parsed timezone for hour buckets
    pub fn tz(&self) -> Result<Tz> {
        parse_tz("timezone", &self.timezone)
    }

    /// Look up a seeded device by id
    pub fn device(&self, id: &str) -> Option<&DeviceSeed> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(HeatwatchError::validation(
                    "devices.id",
                    "Device id cannot be empty",
                ));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(HeatwatchError::validation(
                    "devices.id".to_string(),
                    format!("Duplicate device id '{}'", device.id),
                ));
            }
            let needs_ip = device.kind != DeviceType::Switch;
            if needs_ip && device.ip.as_deref().is_none_or(|ip| ip.trim().is_empty()) {
                return Err(HeatwatchError::validation(
                    format!("devices.{}.ip", device.id),
                    "IP address cannot be empty".to_string(),
                ));
            }
            let needs_topic = matches!(device.kind, DeviceType::Switch | DeviceType::ShellyCover);
            if needs_topic
                && device
                    .mqtt_topic
                    .as_deref()
                    .is_none_or(|t| t.trim().is_empty())
            {
                return Err(HeatwatchError::validation(
                    format!("devices.{}.mqtt_topic", device.id),
                    "MQTT topic cannot be empty".to_string(),
                ));
            }
        }

        self.check_collector_device("collector.meter_id", &self.collector.meter_id, DeviceType::Meter)?;
        self.check_collector_device(
            "collector.sensor_id",
            &self.collector.sensor_id,
            DeviceType::Sensor,
        )?;
        self.check_collector_device(
            "collector.heat_source_id",
            &self.collector.heat_source_id,
            DeviceType::ShellyCover,
        )?;

        if self.collector.interval_secs == 0 {
            return Err(HeatwatchError::validation(
                "collector.interval_secs",
                "Must be greater than 0",
            ));
        }

        if !(self.collector.power_step_threshold_w > 0.0) {
            return Err(HeatwatchError::validation(
                "collector.power_step_threshold_w",
                "Must be positive",
            ));
        }

        if self.store.max_days == 0 {
            return Err(HeatwatchError::validation(
                "store.max_days",
                "Must be greater than 0",
            ));
        }

        if self.store.path.trim().is_empty() {
            return Err(HeatwatchError::validation(
                "store.path",
                "Store path cannot be empty",
            ));
        }

        if self.network.device_timeout_secs == 0 || self.network.service_timeout_secs == 0 {
            return Err(HeatwatchError::validation(
                "network",
                "Timeouts must be greater than 0",
            ));
        }

        if self.mqtt.enabled && (self.mqtt.host.is_empty() || self.mqtt.port == 0) {
            return Err(HeatwatchError::validation(
                "mqtt",
                "Broker host and port are required when MQTT is enabled",
            ));
        }

        self.tz()?;
        parse_tz("prices.timezone", &self.prices.timezone)?;
        Ok(())
    }

    fn check_collector_device(&self, field: &str, id: &str, expected: DeviceType) -> Result<()> {
        match self.device(id) {
            Some(seed) if seed.kind == expected => Ok(()),
            Some(_) => Err(HeatwatchError::validation(
                field.to_string(),
                format!("Device '{}' is not of type {:?}", id, expected),
            )),
            None => Err(HeatwatchError::validation(
                field.to_string(),
                format!("Unknown device '{}'", id),
            )),
        }
    }
}

fn parse_tz(field: &str, name: &str) -> Result<Tz> {
    name.parse::<Tz>().map_err(|_| {
        HeatwatchError::validation(field.to_string(), format!("Unknown timezone '{}'", name))
    })
}
