//! Application context
//!
//! Owns every shared component and exposes the read and control operations
//! used by the web API.

use crate::collector::Collector;
use crate::config::{Config, DeviceType};
use crate::controller::{DeliveryReport, DeviceController, MessagePublisher};
use crate::error::{HeatwatchError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::meter::{MeterReader, PowerHistory, RollingPowerWindow};
use crate::mqtt::{MqttBridge, MqttStatus, MqttUpdate};
use crate::prices::{PriceFetcher, PricePoint};
use crate::registry::{
    DeviceKind, DeviceRegistry, DeviceState, DeviceUpsert, HeatState, UpsertOutcome,
};
use crate::savings;
use crate::store::{HourObservation, HourlyRecord, TimeSeriesStore};
use crate::weather::WeatherFetcher;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};

pub struct AppContext {
    pub config: Config,
    pub registry: DeviceRegistry,
    pub store: Arc<Mutex<TimeSeriesStore>>,
    pub prices: Arc<PriceFetcher>,
    pub weather: Arc<WeatherFetcher>,
    pub controller: DeviceController,
    pub mqtt: Arc<MqttBridge>,
    pub collector: Arc<Collector>,
    pub updates: broadcast::Sender<String>,
    pub started_at: DateTime<Utc>,
    /// File that broker setting changes are written back to
    pub config_path: Option<PathBuf>,
    meter: MeterReader,
    logger: StructuredLogger,
}

impl AppContext {
    /// Build the context and connect to the MQTT broker
    pub fn connect(config: Config) -> Result<Self> {
        let registry = DeviceRegistry::from_seeds(&config.devices);
        let mqtt = Arc::new(MqttBridge::connect(&config.mqtt, registry.clone()));
        let publisher: Arc<dyn MessagePublisher> = mqtt.clone();
        Self::assemble(config, registry, mqtt, publisher)
    }

    /// Build the context with a custom publisher and no broker connection
    pub fn with_publisher(config: Config, publisher: Arc<dyn MessagePublisher>) -> Result<Self> {
        let registry = DeviceRegistry::from_seeds(&config.devices);
        let mqtt = Arc::new(MqttBridge::disabled(&config.mqtt, registry.clone()));
        Self::assemble(config, registry, mqtt, publisher)
    }

    fn assemble(
        config: Config,
        registry: DeviceRegistry,
        mqtt: Arc<MqttBridge>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Result<Self> {
        let tz = config.tz()?;
        let device_timeout = Duration::from_secs(config.network.device_timeout_secs);
        let service_timeout = Duration::from_secs(config.network.service_timeout_secs);

        let store = Arc::new(Mutex::new(TimeSeriesStore::open(
            &config.store.path,
            config.store.max_days,
            tz,
        )));
        let prices = Arc::new(PriceFetcher::new(&config.prices, service_timeout)?);
        let weather = Arc::new(WeatherFetcher::new(&config.weather, service_timeout)?);
        let controller = DeviceController::new(
            registry.clone(),
            publisher,
            &config.network.app_id,
            device_timeout,
        )?;
        let (updates, _) = broadcast::channel(16);
        let collector = Arc::new(Collector::new(
            config.collector.clone(),
            registry.clone(),
            device_timeout,
            weather.clone(),
            prices.clone(),
            store.clone(),
            updates.clone(),
        )?);

        Ok(Self {
            config,
            registry,
            store,
            prices,
            weather,
            controller,
            mqtt,
            collector,
            updates,
            started_at: Utc::now(),
            config_path: None,
            meter: MeterReader::new(device_timeout)?,
            logger: get_logger("app"),
        })
    }

    /// Persist broker setting changes to `path`
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Day-ahead prices for today and tomorrow
    pub async fn get_price_curve(&self) -> Vec<PricePoint> {
        self.prices.fetch_curve().await
    }

    pub async fn get_current_outdoor_temp(&self) -> Option<f64> {
        self.weather.current_outdoor_temp().await
    }

    pub async fn get_device(&self, id: &str) -> Option<DeviceState> {
        self.registry.get(id).await
    }

    pub async fn list_devices(&self) -> Vec<DeviceState> {
        self.registry.list().await
    }

    pub async fn set_device_state(&self, id: &str, state: HeatState) -> Result<DeliveryReport> {
        self.controller.set_state(id, state).await
    }

    pub async fn stop_device(&self, id: &str) -> Result<DeliveryReport> {
        self.controller.stop(id).await
    }

    /// Records of the last `days` days with savings fields filled in
    pub async fn get_history(&self, days: u32) -> Vec<HourlyRecord> {
        let records = self.store.lock().await.get_records(days);
        savings::annotate(&records, &self.config.savings)
    }

    /// Explicit write of the current hour's record
    pub async fn record_hour(&self, obs: &HourObservation) -> Result<HourlyRecord> {
        let record = self.store.lock().await.upsert_hour(obs)?;
        Ok(savings::estimate(&record, &self.config.savings))
    }

    /// Create or update a device; publishes threshold changes
    pub async fn upsert_device(&self, req: DeviceUpsert) -> Result<UpsertOutcome> {
        let outcome = self.registry.upsert(req).await?;

        if let Some((topic, value)) = &outcome.threshold_changed
            && let Err(e) = self.controller.publish_threshold(topic, *value).await
        {
            self.logger
                .warn(&format!("Threshold publish to {} failed: {}", topic, e));
        }

        if outcome.created
            && outcome.device.kind.device_type() == DeviceType::Switch
            && self.mqtt.is_connected()
            && let Some(topic) = outcome.device.mqtt_topic()
            && let Err(e) = self.mqtt.subscribe_state(topic).await
        {
            self.logger
                .warn(&format!("State subscription for {} failed: {}", topic, e));
        }

        if outcome.ip_changed && outcome.device.kind.device_type() == DeviceType::Meter {
            self.meter
                .refresh_config(&self.registry, &outcome.device.id)
                .await;
            if let Some(device) = self.registry.get(&outcome.device.id).await {
                return Ok(UpsertOutcome { device, ..outcome });
            }
        }

        Ok(outcome)
    }

    pub async fn remove_device(&self, id: &str) -> Result<DeviceState> {
        self.registry
            .remove(id)
            .await
            .ok_or_else(|| HeatwatchError::not_found(format!("device {}", id)))
    }

    /// Clear the power window of a meter
    pub async fn reset_power_window(&self, id: &str) -> Result<()> {
        self.with_meter(id, |window, _| window.clear()).await
    }

    /// Clear the per-phase power history of a meter
    pub async fn reset_power_history(&self, id: &str) -> Result<()> {
        self.with_meter(id, |_, history| history.clear()).await
    }

    async fn with_meter<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut RollingPowerWindow, &mut PowerHistory),
    {
        let found = self
            .registry
            .update(id, |dev| match &mut dev.kind {
                DeviceKind::Meter {
                    power_window,
                    history,
                    ..
                } => {
                    f(power_window, history);
                    true
                }
                _ => false,
            })
            .await
            .ok_or_else(|| HeatwatchError::not_found(format!("device {}", id)))?;
        if !found {
            return Err(HeatwatchError::validation(
                "type".to_string(),
                format!("Device '{}' is not a meter", id),
            ));
        }
        Ok(())
    }

    /// Apply new broker settings, write them back and reconnect
    pub async fn update_mqtt(&self, update: MqttUpdate) -> Result<MqttStatus> {
        let mqtt = update.apply(&self.mqtt.config());
        let mut config = self.config.clone();
        config.mqtt = mqtt.clone();
        config.validate()?;

        if let Some(path) = &self.config_path {
            config.save_to_file(path)?;
            self.logger
                .info(&format!("Saved MQTT settings to {}", path.display()));
        }

        self.mqtt.reconfigure(&mqtt).await;
        Ok(self.mqtt.status())
    }

    pub fn mqtt_status(&self) -> MqttStatus {
        self.mqtt.status()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }
}
