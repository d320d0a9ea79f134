//! In-process device registry
//!
//! Every device the service knows about lives here. Fetch routines, the
//! collector, the MQTT subscriber and the web API share one registry handle
//! and mutate entries under its lock.

use crate::config::{DeviceSeed, DeviceType};
use crate::error::{HeatwatchError, Result};
use crate::meter::{MeterReading, PowerHistory, RollingPowerWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

fn default_true() -> bool {
    true
}

/// Desired or observed on/off state of a controllable device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeatState {
    On,
    #[default]
    Off,
}

impl HeatState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for HeatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeatState {
    type Err = HeatwatchError;

    /// Accepts switch style (`on`/`off`) and cover style (`open`/`closed`) values
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "on" | "open" | "opening" => Ok(Self::On),
            "off" | "close" | "closed" | "closing" => Ok(Self::Off),
            other => Err(HeatwatchError::validation(
                "state".to_string(),
                format!("Unsupported state '{}'", other),
            )),
        }
    }
}

/// Type specific device data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeviceKind {
    Switch {
        #[serde(default)]
        state: HeatState,
        #[serde(default)]
        threshold: f64,
        mqtt_topic: String,
    },
    ShellyCover {
        ip: String,
        mqtt_topic: String,
        #[serde(default)]
        state: HeatState,
    },
    Sensor {
        ip: String,
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        humidity: Option<f64>,
        #[serde(default)]
        battery: Option<f64>,
    },
    Meter {
        ip: String,
        #[serde(default)]
        reading: Option<MeterReading>,
        #[serde(default)]
        power_window: RollingPowerWindow,
        #[serde(default)]
        history: PowerHistory,
        /// Last `Shelly.GetConfig` document
        #[serde(default)]
        device_config: Option<serde_json::Value>,
    },
}

impl DeviceKind {
    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::Switch { .. } => DeviceType::Switch,
            Self::ShellyCover { .. } => DeviceType::ShellyCover,
            Self::Sensor { .. } => DeviceType::Sensor,
            Self::Meter { .. } => DeviceType::Meter,
        }
    }
}

/// A device entry in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Last successful refresh or state change
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub kind: DeviceKind,
}

impl DeviceState {
    /// Build a registry entry from a configuration seed
    pub fn from_seed(seed: &DeviceSeed) -> Self {
        let ip = seed.ip.clone().unwrap_or_default();
        let topic = seed.mqtt_topic.clone().unwrap_or_default();
        let kind = match seed.kind {
            DeviceType::Switch => DeviceKind::Switch {
                state: HeatState::Off,
                threshold: seed.threshold.unwrap_or(100.0),
                mqtt_topic: topic,
            },
            DeviceType::ShellyCover => DeviceKind::ShellyCover {
                ip,
                mqtt_topic: topic,
                state: HeatState::Off,
            },
            DeviceType::Sensor => DeviceKind::Sensor {
                ip,
                temperature: None,
                humidity: None,
                battery: None,
            },
            DeviceType::Meter => DeviceKind::Meter {
                ip,
                reading: None,
                power_window: RollingPowerWindow::default(),
                history: PowerHistory::default(),
                device_config: None,
            },
        };
        Self {
            id: seed.id.clone(),
            name: seed.name.clone(),
            description: seed.description.clone(),
            enabled: seed.enabled,
            last_updated: None,
            kind,
        }
    }

    /// Recorded on/off state for switches and covers
    pub fn heat_state(&self) -> Option<HeatState> {
        match &self.kind {
            DeviceKind::Switch { state, .. } | DeviceKind::ShellyCover { state, .. } => {
                Some(*state)
            }
            _ => None,
        }
    }

    /// Device address, if the device is reached over HTTP
    pub fn ip(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::ShellyCover { ip, .. }
            | DeviceKind::Sensor { ip, .. }
            | DeviceKind::Meter { ip, .. } => Some(ip),
            DeviceKind::Switch { .. } => None,
        }
    }

    pub fn mqtt_topic(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::Switch { mqtt_topic, .. } | DeviceKind::ShellyCover { mqtt_topic, .. } => {
                Some(mqtt_topic)
            }
            _ => None,
        }
    }

    /// Indoor temperature for sensors
    pub fn temperature(&self) -> Option<f64> {
        match &self.kind {
            DeviceKind::Sensor { temperature, .. } => *temperature,
            _ => None,
        }
    }
}

/// Body of a create-or-update request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceUpsert {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<DeviceType>,
    pub ip: Option<String>,
    pub mqtt_topic: Option<String>,
    pub threshold: Option<f64>,
    pub enabled: Option<bool>,
    pub description: Option<String>,
}

/// Result of a create-or-update request
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub created: bool,
    pub device: DeviceState,
    /// Set when a switch threshold changed: (topic, new value)
    pub threshold_changed: Option<(String, f64)>,
    /// Whether the device address was set or changed
    pub ip_changed: bool,
}

/// Shared, lock-guarded device map
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<BTreeMap<String, DeviceState>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated from configuration seeds
    pub fn from_seeds(seeds: &[DeviceSeed]) -> Self {
        let map = seeds
            .iter()
            .map(|s| (s.id.clone(), DeviceState::from_seed(s)))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn get(&self, id: &str) -> Option<DeviceState> {
        self.inner.read().await.get(id).cloned()
    }

    /// All devices ordered by id
    pub async fn list(&self) -> Vec<DeviceState> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn insert(&self, device: DeviceState) {
        self.inner.write().await.insert(device.id.clone(), device);
    }

    pub async fn remove(&self, id: &str) -> Option<DeviceState> {
        self.inner.write().await.remove(id)
    }

    /// Mutate a device in place; `None` when the id is unknown
    pub async fn update<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut DeviceState) -> R,
    {
        let mut guard = self.inner.write().await;
        guard.get_mut(id).map(f)
    }

    /// Record an on/off state for a switch or cover without actuating it
    pub async fn set_recorded_state(&self, id: &str, new_state: HeatState) -> Result<DeviceState> {
        let mut guard = self.inner.write().await;
        let device = guard
            .get_mut(id)
            .ok_or_else(|| HeatwatchError::not_found(format!("device {}", id)))?;
        match &mut device.kind {
            DeviceKind::Switch { state, .. } | DeviceKind::ShellyCover { state, .. } => {
                *state = new_state;
            }
            _ => {
                return Err(HeatwatchError::validation(
                    "type".to_string(),
                    format!("Device '{}' has no on/off state", id),
                ));
            }
        }
        device.last_updated = Some(Utc::now());
        Ok(device.clone())
    }

    /// State topics of all switches, for the MQTT subscription
    pub async fn switch_state_topics(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .values()
            .filter_map(|d| match &d.kind {
                DeviceKind::Switch { mqtt_topic, .. } => Some(format!("{}/state", mqtt_topic)),
                _ => None,
            })
            .collect()
    }

    /// Apply an incoming `<topic>/state` message; returns the updated device id
    pub async fn apply_state_message(&self, topic: &str, payload: &str) -> Option<String> {
        let base = topic.strip_suffix("/state")?;
        let new_state = payload.parse::<HeatState>().ok()?;
        let mut guard = self.inner.write().await;
        let device = guard.values_mut().find(|d| {
            matches!(&d.kind, DeviceKind::Switch { mqtt_topic, .. } if mqtt_topic == base)
        })?;
        if let DeviceKind::Switch { state, .. } = &mut device.kind {
            *state = new_state;
        }
        device.last_updated = Some(Utc::now());
        Some(device.id.clone())
    }

    /// Create a device when the id is new and a name is given, otherwise update it
    pub async fn upsert(&self, req: DeviceUpsert) -> Result<UpsertOutcome> {
        if req.id.trim().is_empty() {
            return Err(HeatwatchError::validation("id", "Invalid device ID"));
        }
        let mut guard = self.inner.write().await;

        let Some(device) = guard.get_mut(&req.id) else {
            let Some(name) = req.name.clone() else {
                return Err(HeatwatchError::validation("id", "Invalid device ID"));
            };
            let kind = req.kind.unwrap_or(DeviceType::Switch);
            let default_topic = format!("home/device{}", guard.len() + 1);
            let seed = DeviceSeed {
                id: req.id.clone(),
                name,
                kind,
                ip: req.ip.clone(),
                mqtt_topic: Some(req.mqtt_topic.clone().unwrap_or(default_topic)),
                threshold: Some(req.threshold.unwrap_or(100.0)),
                description: req
                    .description
                    .clone()
                    .unwrap_or_else(|| "New device".to_string()),
                enabled: req.enabled.unwrap_or(true),
            };
            if kind != DeviceType::Switch && seed.ip.as_deref().is_none_or(str::is_empty) {
                return Err(HeatwatchError::validation("ip", "IP address cannot be empty"));
            }
            let device = DeviceState::from_seed(&seed);
            guard.insert(device.id.clone(), device.clone());
            return Ok(UpsertOutcome {
                created: true,
                ip_changed: device.ip().is_some_and(|ip| !ip.is_empty()),
                device,
                threshold_changed: None,
            });
        };

        if let Some(kind) = req.kind
            && kind != device.kind.device_type()
        {
            return Err(HeatwatchError::validation(
                "type",
                "Changing the type of an existing device is not supported",
            ));
        }

        let mut threshold_changed = None;
        let ip_changed = req
            .ip
            .as_deref()
            .is_some_and(|addr| device.ip().is_some_and(|old| old != addr));
        if let Some(name) = req.name {
            device.name = name;
        }
        if let Some(enabled) = req.enabled {
            device.enabled = enabled;
        }
        if let Some(description) = req.description {
            device.description = description;
        }
        match &mut device.kind {
            DeviceKind::Switch {
                threshold,
                mqtt_topic,
                ..
            } => {
                if let Some(topic) = req.mqtt_topic {
                    *mqtt_topic = topic;
                }
                if let Some(value) = req.threshold {
                    *threshold = value;
                    threshold_changed = Some((format!("{}/threshold", mqtt_topic), value));
                }
            }
            DeviceKind::ShellyCover { ip, mqtt_topic, .. } => {
                if let Some(topic) = req.mqtt_topic {
                    *mqtt_topic = topic;
                }
                if let Some(addr) = req.ip {
                    *ip = addr;
                }
            }
            DeviceKind::Sensor { ip, .. } | DeviceKind::Meter { ip, .. } => {
                if let Some(addr) = req.ip {
                    *ip = addr;
                }
            }
        }

        Ok(UpsertOutcome {
            created: false,
            device: device.clone(),
            threshold_changed,
            ip_changed,
        })
    }
}
