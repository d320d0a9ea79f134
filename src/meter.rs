//! Three phase energy meter polling
//!
//! Reads `Shelly.GetStatus` from a Pro 3EM style meter, decodes the `em:0`
//! and `emdata:0` channels once at the boundary and keeps a short window of
//! total power samples for step detection, plus a longer per-phase history
//! for the dashboard.

use crate::error::{HeatwatchError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::registry::{DeviceKind, DeviceRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Number of total power samples kept per meter
pub const POWER_WINDOW_SIZE: usize = 3;

/// Number of per-phase samples kept for the dashboard
pub const POWER_HISTORY_SIZE: usize = 100;

/// `em:0` channel of the status document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmChannel {
    pub a_act_power: Option<f64>,
    pub b_act_power: Option<f64>,
    pub c_act_power: Option<f64>,
    pub a_voltage: Option<f64>,
    pub b_voltage: Option<f64>,
    pub c_voltage: Option<f64>,
    pub total_act_power: Option<f64>,
    pub total_current: Option<f64>,
}

/// `emdata:0` channel of the status document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmDataChannel {
    pub total_act: Option<f64>,
    pub total_act_ret: Option<f64>,
}

/// Subset of `Shelly.GetStatus` used by the reader
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmStatus {
    #[serde(rename = "em:0")]
    pub em: Option<EmChannel>,
    #[serde(rename = "emdata:0")]
    pub emdata: Option<EmDataChannel>,
}

/// Active power per phase in W
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhasePower {
    pub a: Option<f64>,
    pub b: Option<f64>,
    pub c: Option<f64>,
}

/// Decoded meter snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    pub phase_power: PhasePower,
    /// Net active power in W, negative while exporting
    pub total_power: f64,
    pub total_current: Option<f64>,
    pub voltage: Option<f64>,
    /// Cumulative consumed energy in Wh
    pub energy_consumed_wh: Option<f64>,
    /// Cumulative returned energy in Wh
    pub energy_returned_wh: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

impl MeterReading {
    /// Build a reading from a decoded status document
    pub fn from_status(status: &EmStatus, timestamp: DateTime<Utc>) -> Result<Self> {
        let em = status
            .em
            .as_ref()
            .ok_or_else(|| HeatwatchError::parse("Status has no em:0 channel"))?;

        let phase_power = PhasePower {
            a: em.a_act_power.map(|v| round_to(v, 1)),
            b: em.b_act_power.map(|v| round_to(v, 1)),
            c: em.c_act_power.map(|v| round_to(v, 1)),
        };

        let phases: Vec<f64> = [em.a_act_power, em.b_act_power, em.c_act_power]
            .into_iter()
            .flatten()
            .collect();
        let total_power = match em.total_act_power {
            Some(total) => total,
            None if !phases.is_empty() => phases.iter().sum(),
            None => return Err(HeatwatchError::parse("Status has no active power values")),
        };

        let voltage = [em.a_voltage, em.b_voltage, em.c_voltage]
            .into_iter()
            .flatten()
            .next();

        let emdata = status.emdata.clone().unwrap_or_default();

        Ok(Self {
            phase_power,
            total_power: round_to(total_power, 1),
            total_current: em.total_current.map(|v| round_to(v, 2)),
            voltage,
            energy_consumed_wh: emdata.total_act,
            energy_returned_wh: emdata.total_act_ret,
            timestamp,
        })
    }
}

/// FIFO of the most recent total power samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollingPowerWindow {
    samples: VecDeque<f64>,
}

impl RollingPowerWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, dropping the oldest beyond the window size
    pub fn push(&mut self, sample: f64) {
        self.samples.push_back(sample);
        while self.samples.len() > POWER_WINDOW_SIZE {
            self.samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Sample before the latest one
    pub fn previous(&self) -> Option<f64> {
        let len = self.samples.len();
        if len < 2 {
            return None;
        }
        self.samples.get(len - 2).copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Samples oldest first
    pub fn samples(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }
}

/// One per-phase sample; phases that report nothing count as 0 W
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub timestamp: DateTime<Utc>,
    pub phase_a: f64,
    pub phase_b: f64,
    pub phase_c: f64,
    pub total: f64,
}

impl From<&MeterReading> for PowerSample {
    fn from(reading: &MeterReading) -> Self {
        Self {
            timestamp: reading.timestamp,
            phase_a: reading.phase_power.a.unwrap_or(0.0),
            phase_b: reading.phase_power.b.unwrap_or(0.0),
            phase_c: reading.phase_power.c.unwrap_or(0.0),
            total: reading.total_power,
        }
    }
}

/// Bounded per-phase power history, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PowerHistory {
    samples: VecDeque<PowerSample>,
}

impl PowerHistory {
    pub fn push(&mut self, sample: PowerSample) {
        self.samples.push_back(sample);
        while self.samples.len() > POWER_HISTORY_SIZE {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn first(&self) -> Option<&PowerSample> {
        self.samples.front()
    }

    pub fn last(&self) -> Option<&PowerSample> {
        self.samples.back()
    }
}

/// HTTP reader for energy meters
pub struct MeterReader {
    client: reqwest::Client,
    logger: StructuredLogger,
}

impl MeterReader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            logger: get_logger("meter"),
        })
    }

    /// Fetch and decode the status document of the meter at `ip`
    pub async fn fetch_status(&self, ip: &str) -> Result<EmStatus> {
        let url = format!("http://{}/rpc/Shelly.GetStatus", ip);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(HeatwatchError::network(format!(
                "Meter at {} answered {}",
                ip,
                resp.status()
            )));
        }
        let status: EmStatus = resp.json().await?;
        Ok(status)
    }

    /// Fetch the device configuration of the meter at `ip`
    ///
    /// The document is passed through untouched for display.
    pub async fn fetch_config(&self, ip: &str) -> Result<serde_json::Value> {
        let url = format!("http://{}/rpc/Shelly.GetConfig", ip);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(HeatwatchError::network(format!(
                "Meter at {} answered {}",
                ip,
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    /// Read one snapshot from the meter at `ip`
    pub async fn read(&self, ip: &str) -> Result<MeterReading> {
        let status = self.fetch_status(ip).await?;
        MeterReading::from_status(&status, Utc::now())
    }

    /// Poll the meter `id` and store the reading in the registry
    ///
    /// Returns false on any failure; previous values stay untouched.
    pub async fn refresh(&self, registry: &DeviceRegistry, id: &str) -> bool {
        let Some(device) = registry.get(id).await else {
            self.logger.warn(&format!("Meter '{}' is not registered", id));
            return false;
        };
        let DeviceKind::Meter { ip, .. } = &device.kind else {
            self.logger.warn(&format!("Device '{}' is not a meter", id));
            return false;
        };

        let reading = match self.read(ip).await {
            Ok(reading) => reading,
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to read meter '{}' at {}: {}", id, ip, e));
                return false;
            }
        };

        let total = reading.total_power;
        let updated = registry
            .update(id, |dev| {
                if let DeviceKind::Meter {
                    reading: slot,
                    power_window,
                    history,
                    ..
                } = &mut dev.kind
                {
                    dev.last_updated = Some(reading.timestamp);
                    history.push(PowerSample::from(&reading));
                    *slot = Some(reading);
                    power_window.push(total);
                }
            })
            .await
            .is_some();

        if updated {
            self.logger
                .debug(&format!("Meter '{}' total power {:.1} W", id, total));
        }
        updated
    }

    /// Fetch the device configuration of meter `id` into the registry
    ///
    /// A failed fetch keeps the previously stored document.
    pub async fn refresh_config(&self, registry: &DeviceRegistry, id: &str) -> bool {
        let Some(DeviceKind::Meter { ip, .. }) = registry.get(id).await.map(|d| d.kind) else {
            self.logger.warn(&format!("Meter '{}' is not registered", id));
            return false;
        };

        let config = match self.fetch_config(&ip).await {
            Ok(config) => config,
            Err(e) => {
                self.logger.warn(&format!(
                    "Failed to read configuration of meter '{}' at {}: {}",
                    id, ip, e
                ));
                return false;
            }
        };

        registry
            .update(id, |dev| {
                if let DeviceKind::Meter { device_config, .. } = &mut dev.kind {
                    *device_config = Some(config);
                }
            })
            .await
            .is_some()
    }
}
