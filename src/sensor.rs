//! Indoor temperature/humidity sensor polling

use crate::error::{HeatwatchError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::registry::{DeviceKind, DeviceRegistry};
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;

/// A measured value with the device's own validity flag
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ValidatedValue {
    pub value: Option<f64>,
    #[serde(default)]
    pub is_valid: bool,
}

impl ValidatedValue {
    /// The value, if the device marked it valid
    pub fn valid(&self) -> Option<f64> {
        if self.is_valid { self.value } else { None }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct BatteryValue {
    pub value: Option<f64>,
}

/// Subset of the H&T `/status` document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HtStatus {
    pub tmp: Option<ValidatedValue>,
    pub hum: Option<ValidatedValue>,
    pub bat: Option<BatteryValue>,
}

/// HTTP reader for indoor sensors
pub struct SensorReader {
    client: reqwest::Client,
    logger: StructuredLogger,
}

impl SensorReader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            logger: get_logger("sensor"),
        })
    }

    pub async fn fetch_status(&self, ip: &str) -> Result<HtStatus> {
        let url = format!("http://{}/status", ip);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(HeatwatchError::network(format!(
                "Sensor at {} answered {}",
                ip,
                resp.status()
            )));
        }
        let status: HtStatus = resp.json().await?;
        Ok(status)
    }

    /// Poll the sensor `id` and merge valid values into the registry
    ///
    /// Any failure leaves temperature, humidity and battery unchanged.
    pub async fn refresh(&self, registry: &DeviceRegistry, id: &str) -> bool {
        let Some(device) = registry.get(id).await else {
            self.logger.warn(&format!("Sensor '{}' is not registered", id));
            return false;
        };
        let DeviceKind::Sensor { ip, .. } = &device.kind else {
            self.logger.warn(&format!("Device '{}' is not a sensor", id));
            return false;
        };

        let status = match self.fetch_status(ip).await {
            Ok(status) => status,
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to read sensor '{}' at {}: {}", id, ip, e));
                return false;
            }
        };

        let new_temp = status.tmp.and_then(|t| t.valid());
        let new_hum = status.hum.and_then(|h| h.valid());
        let new_bat = status.bat.and_then(|b| b.value);
        if status.tmp.is_some() && new_temp.is_none() {
            self.logger
                .debug(&format!("Sensor '{}' reported an invalid temperature", id));
        }

        registry
            .update(id, |dev| {
                if let DeviceKind::Sensor {
                    temperature,
                    humidity,
                    battery,
                    ..
                } = &mut dev.kind
                {
                    if new_temp.is_some() {
                        *temperature = new_temp;
                    }
                    if new_hum.is_some() {
                        *humidity = new_hum;
                    }
                    if new_bat.is_some() {
                        *battery = new_bat;
                    }
                    dev.last_updated = Some(Utc::now());
                }
            })
            .await
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_values_are_ignored() {
        let status: HtStatus = serde_json::from_value(json!({
            "tmp": {"value": 21.5, "is_valid": true},
            "hum": {"value": 40.0, "is_valid": false},
            "bat": {"value": 87}
        }))
        .unwrap();
        assert_eq!(status.tmp.and_then(|t| t.valid()), Some(21.5));
        assert_eq!(status.hum.and_then(|h| h.valid()), None);
        assert_eq!(status.bat.and_then(|b| b.value), Some(87.0));
    }

    #[test]
    fn missing_validity_flag_means_invalid() {
        let status: HtStatus =
            serde_json::from_value(json!({"tmp": {"value": 19.0}})).unwrap();
        assert_eq!(status.tmp.and_then(|t| t.valid()), None);
    }
}
