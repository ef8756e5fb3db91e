// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, error, info, warn};

use leap_bridge::manager::{ConnectorFactory, TlsConnectorFactory};
use leap_bridge::protocol::{self, CommuniqueType, OneDeviceStatus, Response};
use leap_bridge::transport::Connector;
use leap_bridge::{
    Announced, BridgeOptions, ButtonAction, ButtonWiring, ControllerAnnouncement, CredentialStore,
    Credentials, LeapError, Session, SessionEvent, SessionManager, SessionOptions, walk,
};

/// Delay between a new-device notice and the topology refresh it triggers.
const DEVICE_HEARD_REFRESH: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "leap2mqtt")]
#[command(about = "Bridge between LEAP lighting controllers and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    bridge: BridgeOptions,
    #[serde(default)]
    session: SessionToml,
    mqtt: MqttToml,
    #[serde(default)]
    controllers: Vec<ControllerToml>,
}

#[derive(Debug, Deserialize)]
struct SessionToml {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_ping_interval")]
    ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout")]
    ping_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    request_timeout_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
}

impl Default for SessionToml {
    fn default() -> Self {
        Self {
            port: default_port(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            request_timeout_secs: default_request_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

fn default_port() -> u16 {
    leap_bridge::config::LEAP_PORT
}
fn default_ping_interval() -> u64 {
    30
}
fn default_ping_timeout() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    10
}
fn default_reconnect_attempts() -> u32 {
    20
}
fn default_reconnect_delay() -> u64 {
    1000
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
}

fn default_client_id() -> String {
    "leap-bridge".to_string()
}
fn default_publish_topic() -> String {
    "leap".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct ControllerToml {
    /// Controller id as announced on the network
    id: String,
    address: String,
    #[serde(default)]
    port: Option<u16>,
    ca: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

fn build_session_options(toml: &SessionToml) -> SessionOptions {
    SessionOptions::builder()
        .port(toml.port)
        .ping_interval(Duration::from_secs(toml.ping_interval_secs))
        .ping_timeout(Duration::from_secs(toml.ping_timeout_secs))
        .request_timeout(Duration::from_secs(toml.request_timeout_secs))
        .reconnect_attempts(toml.reconnect_attempts)
        .reconnect_delay(Duration::from_millis(toml.reconnect_delay_ms))
        .build()
}

fn load_credentials(controllers: &[ControllerToml]) -> Result<CredentialStore> {
    let mut store = CredentialStore::new();
    for c in controllers {
        let creds = Credentials::from_files(&c.ca, &c.cert, &c.key)
            .with_context(|| format!("Failed to load credentials for controller {}", c.id))?;
        store.insert(&c.id, creds);
    }
    Ok(store)
}

/// TLS connectors honouring a per-controller port override.
struct ConfiguredConnectors {
    default: TlsConnectorFactory,
    ports: HashMap<String, u16>,
}

impl ConfiguredConnectors {
    fn new(default_port: u16, controllers: &[ControllerToml]) -> Self {
        Self {
            default: TlsConnectorFactory::new(default_port),
            ports: controllers
                .iter()
                .filter_map(|c| c.port.map(|p| (c.id.to_lowercase(), p)))
                .collect(),
        }
    }
}

impl ConnectorFactory for ConfiguredConnectors {
    fn build(
        &self,
        announcement: &ControllerAnnouncement,
        credentials: &Credentials,
    ) -> leap_bridge::Result<Arc<dyn Connector>> {
        match self.ports.get(&announcement.controller_id.to_lowercase()) {
            Some(&port) => TlsConnectorFactory::new(port).build(announcement, credentials),
            None => self.default.build(announcement, credentials),
        }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&text).context("Failed to parse config file")
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages share a flat {now, op, ...} structure

// Button gestures: {now, op, controller, device, button, buttonNumber, press}
#[derive(Serialize)]
struct MqttButtonEvent {
    now: u64,
    op: String,
    controller: String,
    device: String,
    button: String,
    #[serde(rename = "buttonNumber")]
    button_number: u32,
    press: String,
}

// Controller lifecycle: {now, op, controller}
#[derive(Serialize)]
struct MqttControllerEvent {
    now: u64,
    op: String,
    controller: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_button_event(client: &AsyncClient, topic: &str, action: &ButtonAction) {
    let msg = MqttButtonEvent {
        now: now_epoch_ms(),
        op: "BUTTON_PRESS".to_string(),
        controller: action.controller_id.clone(),
        device: action.device.clone(),
        button: action.label.clone(),
        button_number: action.button_number,
        press: action.kind.as_str().to_string(),
    };
    publish_json(client, topic, &msg, false).await;
}

async fn publish_controller_event(client: &AsyncClient, topic: &str, op: &str, controller: &str) {
    let msg = MqttControllerEvent {
        now: now_epoch_ms(),
        op: op.to_string(),
        controller: controller.to_string(),
    };
    publish_json(client, topic, &msg, true).await;
}

fn is_device_heard(response: &Response) -> bool {
    response.communique_type == CommuniqueType::UpdateResponse
        && response.url() == Some(protocol::DEVICE_HEARD_URL)
}

// ---------------------------------------------------------------------------
// Controllers
// ---------------------------------------------------------------------------

/// Only a controller we cannot serve at all is taken out of service; a
/// failed read leaves it running for the next refresh.
fn takes_out_of_service(e: &LeapError) -> bool {
    matches!(e, LeapError::UnsupportedProjectType { .. })
}

/// One event watcher per controller.
#[derive(Clone, Default)]
struct Watchers(Arc<Mutex<HashMap<String, JoinHandle<()>>>>);

impl Watchers {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track the watcher for `id`, stopping any previous one.
    fn track(&self, id: &str, handle: JoinHandle<()>) {
        if let Some(previous) = self.lock().insert(id.to_string(), handle) {
            previous.abort();
        }
    }

    fn stop(&self, id: &str) {
        if let Some(handle) = self.lock().remove(id) {
            handle.abort();
        }
    }

    fn stop_all(&self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
struct Bridge {
    manager: Arc<SessionManager>,
    wiring: Arc<ButtonWiring>,
    watchers: Watchers,
    client: AsyncClient,
    topic: String,
}

impl Bridge {
    async fn announce(&self, announcement: ControllerAnnouncement) {
        let id = announcement.controller_id.clone();
        match self.manager.handle_announcement(&announcement).await {
            Ok(Announced::Created(session)) => {
                publish_controller_event(&self.client, &self.topic, "CONTROLLER_CONNECTED", &id)
                    .await;
                match session.processor_info().await {
                    Ok(info) => info!(
                        "Controller {}: {} {} (s/n {}, firmware {})",
                        id, info.manufacturer, info.model, info.serial_number, info.firmware_revision
                    ),
                    Err(e) => warn!("Controller {}: could not read processor info: {}", id, e),
                }
                let watcher = tokio::spawn(self.clone().watch(session.clone()));
                self.watchers.track(session.controller_id(), watcher);
                self.walk(&session).await;
            }
            Ok(Announced::Reconfigured(_)) => {
                publish_controller_event(&self.client, &self.topic, "CONTROLLER_CONNECTED", &id)
                    .await;
            }
            Ok(Announced::NoCredentials) | Ok(Announced::InProgress) => {}
            Err(e) => error!("Announcement of controller {} failed: {}", id, e),
        }
    }

    async fn walk(&self, session: &Session) {
        let id = session.controller_id();
        match walk(session, self.wiring.as_ref()).await {
            Ok(_) => {}
            Err(e) if takes_out_of_service(&e) => {
                error!("Controller {} is out of service: {}", id, e);
                self.wiring.forget_controller(id).await;
                self.manager.remove(id).await;
                // Last, since this may be the watcher's own task.
                self.watchers.stop(id);
            }
            Err(e) => warn!("Controller {}: device walk incomplete: {}", id, e),
        }
    }

    /// Publish disconnects and refresh the topology after a new-device notice.
    async fn watch(self, session: Session) {
        let mut events = session.events();
        let mut refresh_at: Option<Instant> = None;
        loop {
            tokio::select! {
                () = wait_until(refresh_at) => {
                    refresh_at = None;
                    info!("Refreshing devices on controller {}", session.controller_id());
                    self.walk(&session).await;
                }
                event = events.recv() => match event {
                    Ok(SessionEvent::Disconnected) => {
                        warn!("Controller {} disconnected", session.controller_id());
                        publish_controller_event(
                            &self.client,
                            &self.topic,
                            "CONTROLLER_DISCONNECTED",
                            session.controller_id(),
                        )
                        .await;
                    }
                    Ok(SessionEvent::Unsolicited(response)) if is_device_heard(&response) => {
                        match response.body_as::<OneDeviceStatus>() {
                            Ok(status) => {
                                if let Some(heard) = status.device_status.device_heard {
                                    info!(
                                        "New {} s/n {}. Triggering refresh in {}s.",
                                        heard.device_type,
                                        heard.serial_number.unwrap_or_default(),
                                        DEVICE_HEARD_REFRESH.as_secs()
                                    );
                                }
                            }
                            Err(e) => debug!("Unreadable device-heard notice: {e}"),
                        }
                        refresh_at = Some(Instant::now() + DEVICE_HEARD_REFRESH);
                    }
                    Ok(SessionEvent::Unsolicited(_)) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!("Controller {} event receiver lagged, missed {n} events", session.controller_id());
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn announcements(controllers: &[ControllerToml]) -> Vec<ControllerAnnouncement> {
    controllers
        .iter()
        .map(|c| ControllerAnnouncement::new(&c.id, &c.address))
        .collect()
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=leap_bridge=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let (mqtt_host, mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;
    let options = build_session_options(&config.session);
    let credentials = load_credentials(&config.controllers)?;
    if credentials.is_empty() {
        warn!("No controllers configured");
    }
    let factory = Arc::new(ConfiguredConnectors::new(options.port, &config.controllers));
    let manager = Arc::new(SessionManager::new(credentials, factory, options));

    // MQTT
    let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, &mqtt_host, mqtt_port);
    mqtt_opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

    let mqtt_handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("MQTT: connected"),
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT event loop error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    // Button gestures -> MQTT
    let (wiring, mut actions) = ButtonWiring::new(config.bridge.clone());
    let bridge = Bridge {
        manager,
        wiring: Arc::new(wiring),
        watchers: Watchers::default(),
        client: client.clone(),
        topic: config.mqtt.publish_topic.clone(),
    };
    let client_actions = client.clone();
    let topic_actions = config.mqtt.publish_topic.clone();
    let actions_handle = tokio::spawn(async move {
        while let Some(action) = actions.recv().await {
            info!(
                "{} button {} ({}): {} press",
                action.device,
                action.button_number,
                action.label,
                action.kind.as_str()
            );
            publish_button_event(&client_actions, &topic_actions, &action).await;
        }
    });

    for announcement in announcements(&config.controllers) {
        tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.announce(announcement).await }
        });
    }

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    info!("LEAP bridge running. Send SIGHUP to re-announce controllers, SIGINT/SIGTERM to stop.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sighup.recv() => {
                // Addresses are re-read; credentials and MQTT settings need a restart.
                info!("Received SIGHUP, reloading controller addresses from {}", cli.config);
                match load_config(&cli.config) {
                    Ok(new_config) => {
                        for announcement in announcements(&new_config.controllers) {
                            tokio::spawn({
                                let bridge = bridge.clone();
                                async move { bridge.announce(announcement).await }
                            });
                        }
                    }
                    Err(e) => warn!("Failed to reload config, keeping previous: {e}"),
                }
            }
        }
    }

    bridge.watchers.stop_all();
    for id in bridge.manager.controller_ids().await {
        bridge.wiring.forget_controller(&id).await;
    }
    bridge.manager.close_all().await;
    actions_handle.abort();
    if let Err(e) = client.disconnect().await {
        debug!("MQTT disconnect: {e}");
    }
    mqtt_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}
