//! Periodic collection job
//!
//! One cycle polls the indoor sensor and the energy meter, runs step
//! detection on the meter's power window, looks up the outdoor temperature
//! and current price, and upserts the hour's record in the store.

use crate::config::CollectorConfig;
use crate::detector::{HeatSourceDetector, Transition};
use crate::error::{HeatwatchError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::meter::MeterReader;
use crate::prices::{PriceFetcher, price_at};
use crate::registry::{DeviceKind, DeviceRegistry, HeatState};
use crate::sensor::SensorReader;
use crate::store::{HourObservation, HourlyRecord, TimeSeriesStore};
use crate::weather::WeatherFetcher;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Summary of one completed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub sensor_ok: bool,
    pub meter_ok: bool,
    pub transition: Option<Transition>,
    pub heat_source_state: Option<HeatState>,
    pub indoor_temp: Option<f64>,
    pub outdoor_temp: Option<f64>,
    pub price: Option<f64>,
    pub total_power_w: Option<f64>,
    pub record: Option<HourlyRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(Box<CycleReport>),
    /// Another cycle was still running
    Skipped,
}

/// Clears the running flag when dropped
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Collector {
    config: CollectorConfig,
    registry: DeviceRegistry,
    meter: MeterReader,
    sensor: SensorReader,
    detector: HeatSourceDetector,
    weather: Arc<WeatherFetcher>,
    prices: Arc<PriceFetcher>,
    store: Arc<Mutex<TimeSeriesStore>>,
    updates: broadcast::Sender<String>,
    running: AtomicBool,
    cycles: AtomicU64,
    skipped: AtomicU64,
    logger: StructuredLogger,
}

/// Handle to a started collector
pub struct CollectorHandle {
    shutdown_tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    /// Stop the timer and wait for an in-flight cycle to finish
    pub async fn stop(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();
        self.task
            .await
            .map_err(|e| HeatwatchError::generic(format!("Collector task failed: {}", e)))
    }
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        registry: DeviceRegistry,
        device_timeout: Duration,
        weather: Arc<WeatherFetcher>,
        prices: Arc<PriceFetcher>,
        store: Arc<Mutex<TimeSeriesStore>>,
        updates: broadcast::Sender<String>,
    ) -> Result<Self> {
        Ok(Self {
            detector: HeatSourceDetector::new(config.power_step_threshold_w),
            config,
            registry,
            meter: MeterReader::new(device_timeout)?,
            sensor: SensorReader::new(device_timeout)?,
            weather,
            prices,
            store,
            updates,
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            logger: get_logger("collector"),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Completed and skipped cycle counts
    pub fn counters(&self) -> (u64, u64) {
        (
            self.cycles.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
        )
    }

    /// Run one cycle unless one is already in progress
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(_guard) = CycleGuard::acquire(&self.running) else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            self.logger
                .warn("Previous collection cycle still running, skipping");
            return CycleOutcome::Skipped;
        };

        let report = self.collect().await;
        self.cycles.fetch_add(1, Ordering::Relaxed);

        if let Ok(json) = serde_json::to_string(&report) {
            // No subscribers is fine
            let _ = self.updates.send(json);
        }
        CycleOutcome::Completed(Box::new(report))
    }

    async fn collect(&self) -> CycleReport {
        let started_at = Utc::now();
        let cfg = &self.config;

        let sensor_ok = self.sensor.refresh(&self.registry, &cfg.sensor_id).await;
        let meter_ok = self.meter.refresh(&self.registry, &cfg.meter_id).await;

        let (window, total_power_w) = match self.registry.get(&cfg.meter_id).await.map(|d| d.kind)
        {
            Some(DeviceKind::Meter {
                power_window,
                reading,
                ..
            }) => (Some(power_window), reading.map(|r| r.total_power)),
            _ => (None, None),
        };

        // Only a fresh sample can form a new step
        let transition = if meter_ok {
            window.as_ref().and_then(|w| self.detector.detect(w))
        } else {
            None
        };
        if let Some(t) = transition {
            match self
                .registry
                .set_recorded_state(&cfg.heat_source_id, t.state())
                .await
            {
                Ok(_) => self.logger.info(&format!(
                    "Heat source '{}' detected {}",
                    cfg.heat_source_id,
                    t.state()
                )),
                Err(e) => self
                    .logger
                    .warn(&format!("Cannot record detected transition: {}", e)),
            }
        }

        let heat_source_state = self
            .registry
            .get(&cfg.heat_source_id)
            .await
            .and_then(|d| d.heat_state());
        let indoor_temp = self
            .registry
            .get(&cfg.sensor_id)
            .await
            .and_then(|d| d.temperature());
        let outdoor_temp = self.weather.current_outdoor_temp().await;
        let curve = self.prices.fetch_curve().await;
        let price = price_at(&curve, Utc::now());

        let obs = HourObservation {
            indoor_temp,
            outdoor_temp,
            position: heat_source_state.unwrap_or_default().into(),
            price,
            solar_production: total_power_w.map_or(0.0, |w| w / 1000.0),
        };

        let (record, store_error) = match self.store.lock().await.upsert_hour(&obs) {
            Ok(record) => (Some(record), None),
            Err(e) => {
                self.logger
                    .error(&format!("Failed to store hourly record: {}", e));
                (None, Some(e.to_string()))
            }
        };

        self.logger.info(&format!(
            "Cycle done: sensor_ok={} meter_ok={} indoor={:?} outdoor={:?} price={:?}",
            sensor_ok, meter_ok, indoor_temp, outdoor_temp, price
        ));

        CycleReport {
            started_at,
            sensor_ok,
            meter_ok,
            transition,
            heat_source_state,
            indoor_temp,
            outdoor_temp,
            price,
            total_power_w,
            record,
            store_error,
        }
    }

    /// Spawn the periodic task; the first cycle runs immediately
    pub fn start(self: Arc<Self>) -> CollectorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            self.logger.info(&format!(
                "Collector started, interval {}s",
                period.as_secs()
            ));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                    _ = shutdown_rx.recv() => {
                        self.logger.info("Collector stopping");
                        break;
                    }
                }
            }
        });
        CollectorHandle { shutdown_tx, task }
    }
}
