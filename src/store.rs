//! Hourly time-series store
//!
//! Keeps at most one record per local hour bucket, trims to a fixed number
//! of days and rewrites the backing JSON file after every mutation.

use crate::error::{HeatwatchError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::registry::HeatState;
use chrono::{Days, NaiveDateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Recorded position of the heat source cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    #[serde(alias = "on")]
    Open,
    #[default]
    #[serde(alias = "off")]
    Closed,
}

impl From<HeatState> for Position {
    fn from(state: HeatState) -> Self {
        match state {
            HeatState::On => Self::Open,
            HeatState::Off => Self::Closed,
        }
    }
}

impl From<Position> for HeatState {
    fn from(position: Position) -> Self {
        match position {
            Position::Open => Self::On,
            Position::Closed => Self::Off,
        }
    }
}

/// One observation per hour bucket
///
/// Fields from `target_temp` on are derived by the savings estimator when
/// records are read and are never written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyRecord {
    pub timestamp: NaiveDateTime,
    pub indoor_temp: Option<f64>,
    pub outdoor_temp: Option<f64>,
    pub device_position: Position,
    pub electricity_price: Option<f64>,
    /// Net meter power in kW, negative while exporting
    #[serde(default)]
    pub solar_production: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_temp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_consumption: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solar_benefit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_saved: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimal_state: Option<HeatState>,
}

impl HourlyRecord {
    fn new(timestamp: NaiveDateTime, obs: &HourObservation) -> Self {
        Self {
            timestamp,
            indoor_temp: obs.indoor_temp,
            outdoor_temp: obs.outdoor_temp,
            device_position: obs.position,
            electricity_price: obs.price,
            solar_production: obs.solar_production,
            target_temp: None,
            grid_consumption: None,
            solar_benefit: None,
            energy_saved: None,
            optimal_state: None,
        }
    }

    fn apply(&mut self, obs: &HourObservation) {
        self.indoor_temp = obs.indoor_temp;
        self.outdoor_temp = obs.outdoor_temp;
        self.device_position = obs.position;
        self.electricity_price = obs.price;
        self.solar_production = obs.solar_production;
    }

    /// Drop derived fields
    pub fn clear_derived(&mut self) {
        self.target_temp = None;
        self.grid_consumption = None;
        self.solar_benefit = None;
        self.energy_saved = None;
        self.optimal_state = None;
    }
}

/// Values observed for the current hour
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HourObservation {
    pub indoor_temp: Option<f64>,
    pub outdoor_temp: Option<f64>,
    #[serde(alias = "device_position")]
    pub position: Position,
    #[serde(alias = "electricity_price")]
    pub price: Option<f64>,
    #[serde(default)]
    pub solar_production: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    hourly_records: Vec<HourlyRecord>,
}

/// Truncate to the top of the hour
pub fn hour_bucket(at: NaiveDateTime) -> Result<NaiveDateTime> {
    at.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .ok_or_else(|| HeatwatchError::store(format!("Cannot truncate {} to the hour", at)))
}

/// File-backed hourly store
pub struct TimeSeriesStore {
    path: PathBuf,
    max_days: u32,
    tz: Tz,
    records: Vec<HourlyRecord>,
    logger: StructuredLogger,
}

impl TimeSeriesStore {
    /// Open the store at `path`
    ///
    /// A missing file gives an empty store. An unreadable or corrupt file is
    /// logged and also gives an empty store.
    pub fn open<P: AsRef<Path>>(path: P, max_days: u32, tz: Tz) -> Self {
        let logger = get_logger("store");
        let path = path.as_ref().to_path_buf();
        let records = match Self::load(&path) {
            Ok(Some(mut records)) => {
                records.iter_mut().for_each(HourlyRecord::clear_derived);
                records.sort_by_key(|r| r.timestamp);
                logger.info(&format!(
                    "Loaded {} hourly records from {}",
                    records.len(),
                    path.display()
                ));
                records
            }
            Ok(None) => {
                logger.info(&format!(
                    "No history file at {}, starting empty",
                    path.display()
                ));
                Vec::new()
            }
            Err(e) => {
                logger.error(&format!(
                    "History file {} is unreadable, starting empty: {}",
                    path.display(),
                    e
                ));
                Vec::new()
            }
        };

        let mut store = Self {
            path,
            max_days,
            tz,
            records,
            logger,
        };
        store.trim();
        store
    }

    fn load(path: &Path) -> Result<Option<Vec<HourlyRecord>>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let file: StoreFile = serde_json::from_str(&contents)?;
        Ok(Some(file.hourly_records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in chronological order
    pub fn records(&self) -> &[HourlyRecord] {
        &self.records
    }

    fn capacity(&self) -> usize {
        self.max_days as usize * 24
    }

    fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.tz).naive_local()
    }

    /// Bucket of the current local hour
    ///
    /// Buckets are naive local times: on the autumn DST change both 02:00
    /// hours share one bucket, and the later observation overwrites it.
    pub fn current_bucket(&self) -> Result<NaiveDateTime> {
        hour_bucket(self.local_now())
    }

    /// Record an observation for the current hour
    pub fn upsert_hour(&mut self, obs: &HourObservation) -> Result<HourlyRecord> {
        let bucket = self.current_bucket()?;
        self.upsert_hour_at(bucket, obs)
    }

    /// Record an observation for the hour containing `at`
    pub fn upsert_hour_at(
        &mut self,
        at: NaiveDateTime,
        obs: &HourObservation,
    ) -> Result<HourlyRecord> {
        let bucket = hour_bucket(at)?;
        let record = match self
            .records
            .binary_search_by_key(&bucket, |r| r.timestamp)
        {
            Ok(idx) => {
                self.records[idx].apply(obs);
                self.records[idx].clone()
            }
            Err(idx) => {
                let record = HourlyRecord::new(bucket, obs);
                self.records.insert(idx, record.clone());
                record
            }
        };
        self.trim();
        self.persist()?;
        self.logger
            .debug(&format!("Upserted hour {} ({} records)", bucket, self.len()));
        Ok(record)
    }

    fn trim(&mut self) {
        let cap = self.capacity();
        if self.records.len() > cap {
            let excess = self.records.len() - cap;
            self.records.drain(..excess);
        }
    }

    /// Records whose bucket is at or after local midnight `days` days ago
    pub fn get_records(&self, days: u32) -> Vec<HourlyRecord> {
        let midnight = self.local_now().date().and_time(NaiveTime::MIN);
        let cutoff = midnight
            .checked_sub_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDateTime::MIN);
        self.get_records_since(cutoff)
    }

    pub fn get_records_since(&self, cutoff: NaiveDateTime) -> Vec<HourlyRecord> {
        self.records
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write all records atomically: temp sibling, sync, rename
    pub fn persist(&self) -> Result<()> {
        let file = StoreFile {
            hourly_records: self.records.clone(),
        };
        let contents = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                HeatwatchError::store(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }

        let tmp = self.temp_path();
        let write_tmp = || -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(contents.as_bytes())?;
            f.sync_all()?;
            Ok(())
        };
        write_tmp().map_err(|e| {
            HeatwatchError::store(format!("Cannot write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            HeatwatchError::store(format!(
                "Cannot replace {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}
