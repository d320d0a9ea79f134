//! MQTT broker connection
//!
//! Publishes controller commands and listens on `<topic>/state` for switch
//! devices, applying reported states to the registry.

use crate::config::MqttConfig;
use crate::controller::MessagePublisher;
use crate::error::{HeatwatchError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::registry::DeviceRegistry;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use utoipa::ToSchema;
use uuid::Uuid;

/// Upper bound for handing a message to the client queue
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection summary for the status endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MqttStatus {
    pub enabled: bool,
    pub connected: bool,
    pub broker: String,
    pub username: Option<String>,
    pub tls: bool,
}

pub fn build_options(cfg: &MqttConfig) -> MqttOptions {
    let client_id = format!("heatwatch-{}", Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    opts.set_clean_session(true);
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if cfg.tls {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

/// Partial broker settings posted to the update endpoint
///
/// Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct MqttUpdate {
    pub enabled: Option<bool>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<bool>,
    pub keep_alive_secs: Option<u64>,
}

impl MqttUpdate {
    pub fn apply(self, current: &MqttConfig) -> MqttConfig {
        MqttConfig {
            enabled: self.enabled.unwrap_or(current.enabled),
            host: self.host.unwrap_or_else(|| current.host.clone()),
            port: self.port.unwrap_or(current.port),
            username: self.username.or_else(|| current.username.clone()),
            password: self.password.or_else(|| current.password.clone()),
            tls: self.tls.unwrap_or(current.tls),
            keep_alive_secs: self.keep_alive_secs.unwrap_or(current.keep_alive_secs),
        }
    }
}

/// One client and its event loop task
struct Session {
    client: Option<AsyncClient>,
    connected: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    config: MqttConfig,
}

impl Session {
    fn idle(config: &MqttConfig) -> Self {
        Self {
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            task: None,
            config: config.clone(),
        }
    }

    fn open(config: &MqttConfig, registry: &DeviceRegistry, logger: &StructuredLogger) -> Self {
        if !config.enabled {
            return Self::idle(config);
        }
        let (client, eventloop) = AsyncClient::new(build_options(config), 10);
        let connected = Arc::new(AtomicBool::new(false));

        logger.info(&format!(
            "Connecting to MQTT broker at {}:{}",
            config.host, config.port
        ));
        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            registry.clone(),
            connected.clone(),
            get_logger("mqtt"),
        ));

        Self {
            client: Some(client),
            connected,
            task: Some(task),
            config: config.clone(),
        }
    }

    async fn close(self) {
        if let Some(client) = &self.client {
            let _ = client.disconnect().await;
        }
        if let Some(task) = self.task {
            task.abort();
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

/// Broker client shared by the controller and the web API
///
/// The session can be replaced at runtime when the broker settings change.
pub struct MqttBridge {
    session: RwLock<Session>,
    registry: DeviceRegistry,
    logger: StructuredLogger,
}

impl MqttBridge {
    /// Bridge that stays offline until reconfigured; every publish fails
    pub fn disabled(config: &MqttConfig, registry: DeviceRegistry) -> Self {
        Self {
            session: RwLock::new(Session::idle(config)),
            registry,
            logger: get_logger("mqtt"),
        }
    }

    /// Create the client and spawn its event loop
    ///
    /// Connection happens in the background; a missing broker only shows up
    /// as `connected == false` and failed publishes.
    pub fn connect(config: &MqttConfig, registry: DeviceRegistry) -> Self {
        let logger = get_logger("mqtt");
        let session = Session::open(config, &registry, &logger);
        Self {
            session: RwLock::new(session),
            registry,
            logger,
        }
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Client handle and connection flag of the current session
    fn handle(&self) -> (Option<AsyncClient>, bool) {
        let session = self.read_session();
        (
            session.client.clone(),
            session.connected.load(Ordering::Relaxed),
        )
    }

    pub fn is_connected(&self) -> bool {
        self.read_session().connected.load(Ordering::Relaxed)
    }

    /// Current broker settings
    pub fn config(&self) -> MqttConfig {
        self.read_session().config.clone()
    }

    pub fn status(&self) -> MqttStatus {
        let session = self.read_session();
        let config = &session.config;
        MqttStatus {
            enabled: config.enabled,
            connected: session.connected.load(Ordering::Relaxed),
            broker: format!("{}:{}", config.host, config.port),
            username: config.username.clone().filter(|u| !u.is_empty()),
            tls: config.tls,
        }
    }

    /// Replace the broker session with one built from `config`
    pub async fn reconfigure(&self, config: &MqttConfig) {
        let fresh = Session::open(config, &self.registry, &self.logger);
        let old = {
            let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, fresh)
        };
        old.close().await;
        self.logger.info(&format!(
            "MQTT settings updated, broker {}:{}",
            config.host, config.port
        ));
    }

    /// Subscribe to the state topic of a newly added switch
    pub async fn subscribe_state(&self, base_topic: &str) -> Result<()> {
        let (client, _) = self.handle();
        let client = client.ok_or_else(|| HeatwatchError::mqtt("MQTT is disabled"))?;
        client
            .subscribe(format!("{}/state", base_topic), QoS::AtLeastOnce)
            .await
            .map_err(|e| HeatwatchError::mqtt(e.to_string()))
    }

    /// Stop the event loop task
    pub async fn shutdown(&self) {
        let old = {
            let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
            let config = slot.config.clone();
            std::mem::replace(&mut *slot, Session::idle(&config))
        };
        old.close().await;
        self.logger.info("MQTT bridge stopped");
    }
}

#[async_trait::async_trait]
impl MessagePublisher for MqttBridge {
    /// Hand a message to the client
    ///
    /// Refused while the broker is unreachable so that stale commands are
    /// never queued for replay after a reconnect.
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let (client, connected) = self.handle();
        let client = client.ok_or_else(|| HeatwatchError::mqtt("MQTT is disabled"))?;
        if !connected {
            return Err(HeatwatchError::mqtt(format!(
                "Not connected to broker, dropped message for {}",
                topic
            )));
        }
        let send = client.publish(topic, QoS::AtLeastOnce, false, payload.into_bytes());
        match tokio::time::timeout(PUBLISH_TIMEOUT, send).await {
            Ok(Ok(())) => {
                self.logger.debug(&format!("Published to {}", topic));
                Ok(())
            }
            Ok(Err(e)) => Err(HeatwatchError::mqtt(format!(
                "Publish to {} failed: {}",
                topic, e
            ))),
            Err(_) => Err(HeatwatchError::timeout(format!(
                "Publish to {} timed out",
                topic
            ))),
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    registry: DeviceRegistry,
    connected: Arc<AtomicBool>,
    logger: StructuredLogger,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::Relaxed);
                logger.info("Connected to MQTT broker");
                // Only try_subscribe: awaiting the client queue here would deadlock
                for topic in registry.switch_state_topics().await {
                    if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                        logger.warn(&format!("Subscribe to {} failed: {}", topic, e));
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                let payload = String::from_utf8_lossy(&msg.payload);
                match registry.apply_state_message(&msg.topic, &payload).await {
                    Some(id) => logger.debug(&format!("Device {} reported '{}'", id, payload)),
                    None => logger.debug(&format!("Ignored message on {}", msg.topic)),
                }
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::Relaxed) {
                    logger.warn(&format!("MQTT connection lost: {}", e));
                } else {
                    logger.debug(&format!("MQTT connect failed: {}", e));
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
