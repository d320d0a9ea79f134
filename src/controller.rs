//! Device control over HTTP RPC and MQTT
//!
//! Commands are fire-and-forget: the requested state is recorded in the
//! registry and every delivery channel is attempted once. The returned
//! report lists what was tried and what failed.

use crate::error::{HeatwatchError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger, get_logger_with_context};
use crate::registry::{DeviceKind, DeviceRegistry, HeatState};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Outbound message channel used by the controller
#[async_trait::async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;
}

/// Cover command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverAction {
    Open,
    Close,
    Stop,
}

impl CoverAction {
    /// RPC method name
    pub fn method(self) -> &'static str {
        match self {
            Self::Open => "Cover.Open",
            Self::Close => "Cover.Close",
            Self::Stop => "Cover.Stop",
        }
    }

    /// Plain command payload
    pub fn command(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Stop => "stop",
        }
    }
}

impl From<HeatState> for CoverAction {
    fn from(state: HeatState) -> Self {
        match state {
            HeatState::On => Self::Open,
            HeatState::Off => Self::Close,
        }
    }
}

impl fmt::Display for CoverAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

/// One attempted delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelAttempt {
    /// `http:<url>` or `mqtt:<topic>`
    pub channel: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a control command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub device_id: String,
    /// Requested state or action (`on`, `off`, `stop`)
    pub action: String,
    /// Whether the new state was recorded in the registry
    pub recorded: bool,
    pub channels: Vec<ChannelAttempt>,
}

impl DeliveryReport {
    fn new(device_id: &str, action: impl Into<String>) -> Self {
        Self {
            device_id: device_id.to_string(),
            action: action.into(),
            recorded: false,
            channels: Vec::new(),
        }
    }

    fn push(&mut self, channel: String, result: Result<()>) {
        let (delivered, error) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.channels.push(ChannelAttempt {
            channel,
            delivered,
            error,
        });
    }

    /// Channels that were tried
    pub fn attempted(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.channel.as_str()).collect()
    }

    pub fn all_delivered(&self) -> bool {
        self.channels.iter().all(|c| c.delivered)
    }
}

pub struct DeviceController {
    client: reqwest::Client,
    publisher: Arc<dyn MessagePublisher>,
    registry: DeviceRegistry,
    app_id: String,
    logger: StructuredLogger,
}

impl DeviceController {
    pub fn new(
        registry: DeviceRegistry,
        publisher: Arc<dyn MessagePublisher>,
        app_id: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            publisher,
            registry,
            app_id: app_id.to_string(),
            logger: get_logger("controller"),
        })
    }

    /// Switch a device on or off
    pub async fn set_state(&self, id: &str, state: HeatState) -> Result<DeliveryReport> {
        let device = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| HeatwatchError::not_found(format!("device {}", id)))?;

        let mut report = DeliveryReport::new(id, state.as_str());
        match &device.kind {
            DeviceKind::ShellyCover { ip, mqtt_topic, .. } => {
                self.registry.set_recorded_state(id, state).await?;
                report.recorded = true;
                self.drive_cover(&mut report, ip, mqtt_topic, CoverAction::from(state))
                    .await;
            }
            DeviceKind::Switch { mqtt_topic, .. } => {
                self.registry.set_recorded_state(id, state).await?;
                report.recorded = true;
                let topic = format!("{}/set", mqtt_topic);
                let result = self.publish(&topic, state.as_str().to_string()).await;
                report.push(format!("mqtt:{}", topic), result);
            }
            DeviceKind::Sensor { .. } | DeviceKind::Meter { .. } => {
                return Err(HeatwatchError::validation(
                    "type".to_string(),
                    format!("Device '{}' cannot be controlled", id),
                ));
            }
        }

        self.log_report(&report);
        Ok(report)
    }

    /// Stop a moving cover; nothing is recorded
    pub async fn stop(&self, id: &str) -> Result<DeliveryReport> {
        let device = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| HeatwatchError::not_found(format!("device {}", id)))?;

        let DeviceKind::ShellyCover { ip, mqtt_topic, .. } = &device.kind else {
            return Err(HeatwatchError::validation(
                "type".to_string(),
                format!("Device '{}' is not a cover", id),
            ));
        };

        let mut report = DeliveryReport::new(id, CoverAction::Stop.command());
        self.drive_cover(&mut report, ip, mqtt_topic, CoverAction::Stop)
            .await;
        self.log_report(&report);
        Ok(report)
    }

    /// HTTP RPC followed by both MQTT publishes, regardless of earlier failures
    async fn drive_cover(
        &self,
        report: &mut DeliveryReport,
        ip: &str,
        topic: &str,
        action: CoverAction,
    ) {
        let body = json!({
            "id": 1,
            "src": self.app_id,
            "method": action.method(),
            "params": {"id": 0}
        });

        let url = format!("http://{}/rpc", ip);
        let http_result = self.post_rpc(&url, &body).await;
        report.push(format!("http:{}", url), http_result);

        let rpc_topic = format!("{}/rpc", topic);
        let result = self.publish(&rpc_topic, body.to_string()).await;
        report.push(format!("mqtt:{}", rpc_topic), result);

        let command_topic = format!("{}/command/cover:0", topic);
        let result = self
            .publish(&command_topic, action.command().to_string())
            .await;
        report.push(format!("mqtt:{}", command_topic), result);
    }

    async fn post_rpc(&self, url: &str, body: &serde_json::Value) -> Result<()> {
        let resp = self.client.post(url).json(body).send().await?;
        if !resp.status().is_success() {
            return Err(HeatwatchError::network(format!(
                "{} answered {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        self.publisher.publish(topic, payload).await
    }

    /// Publish a threshold change for a switch
    pub async fn publish_threshold(&self, topic: &str, value: f64) -> Result<()> {
        self.publish(topic, value.to_string()).await
    }

    fn log_report(&self, report: &DeliveryReport) {
        let logger = get_logger_with_context(
            LogContext::new(self.logger.component())
                .with_device(&report.device_id)
                .with_field("action", report.action.clone()),
        );
        for attempt in report.channels.iter().filter(|c| !c.delivered) {
            logger.warn(&format!(
                "Delivery via {} failed: {}",
                attempt.channel,
                attempt.error.as_deref().unwrap_or("unknown error")
            ));
        }
        logger.info(&format!(
            "{}/{} channels delivered",
            report.channels.iter().filter(|c| c.delivered).count(),
            report.channels.len()
        ));
    }
}
