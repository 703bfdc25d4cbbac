/*!
MQTT runtime: one connection, one supervising loop.

Purpose:
- Drive the broker connection through the rumqttc event loop. On the first
  successful connection (and only then) the Home Assistant discovery runs
  once; reconnects never re-emit it.
- Under a live connection, three kinds of child tasks run: the per-bus
  publish loops (scan, publish changed payloads, sleep the bus scan
  interval) and the cover tick loop. Incoming publishes are dispatched to
  output features and covers straight from the event loop, which doubles as
  the subscribe task.
- On any connection-level error all children are cancelled, the loop sleeps
  `reconnect_interval` and retries; exceeding `retry_limit` raises a fatal
  error out of the supervisor. An absent limit retries forever.

Ownership:
- The Modbus clients stay inside their scanners; this module only reaches
  them through the shared scanner handles, one publish task per bus at a
  time. Output commands travel through the feature's write queue and are
  applied by the scanner at the start of its next tick.
*/

pub mod discovery;

use std::sync::Arc;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::covers::{CoverCommand, CoverMap, TICK_INTERVAL};
use crate::error::Error;
use crate::features::{Feature, FeatureKind, FeatureMap};
use crate::hardware::HardwareMap;
use crate::logging::prefix;
use crate::modbus::Scanner;
use crate::registers::Bus;

/// Kinds published from the TCP scan results.
pub const TCP_PUBLISH_KINDS: &[FeatureKind] = &[
    FeatureKind::DigitalInput,
    FeatureKind::DigitalOutput,
    FeatureKind::Relay,
    FeatureKind::Led,
];

/// Kinds published from the RTU scan results; meters live here.
pub const RTU_PUBLISH_KINDS: &[FeatureKind] = &[
    FeatureKind::DigitalInput,
    FeatureKind::DigitalOutput,
    FeatureKind::Relay,
    FeatureKind::Led,
    FeatureKind::Meter,
];

pub type SharedScanner = Arc<Mutex<Scanner>>;
pub type SharedCovers = Arc<Mutex<CoverMap>>;

/// A command extracted from an incoming publish.
#[derive(Debug)]
pub enum Routed {
    Output { feature: Arc<Feature>, on: bool },
    Cover { object_id: String, command: CoverCommand },
}

/// Match an incoming message against the topic table.
///
/// Unknown topics yield nothing and are silently ignored; binary payloads
/// other than "ON"/"OFF" are dropped. A topic matching several features
/// applies to all of them, in definition order.
pub fn route(device_slug: &str, features: &FeatureMap, topic: &str, payload: &str) -> Vec<Routed> {
    let mut routed = Vec::new();

    let segments: Vec<&str> = topic.split('/').collect();
    let [device, component, object_id, action] = segments[..] else {
        return routed;
    };
    if device != device_slug {
        return routed;
    }

    match component {
        "relay" if action == "set" => {
            let on = match payload {
                "ON" => true,
                "OFF" => false,
                _ => return routed,
            };
            for feature in features.by_kinds(&[FeatureKind::DigitalOutput, FeatureKind::Relay]) {
                if feature.object_id == object_id {
                    routed.push(Routed::Output { feature: feature.clone(), on });
                }
            }
        }
        "cover" => {
            if let Some(command) = CoverCommand::parse(action, payload) {
                routed.push(Routed::Cover { object_id: object_id.to_string(), command });
            }
        }
        _ => {}
    }

    routed
}

/// Child tasks of one connection epoch.
struct ChildTasks {
    cancel: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ChildTasks {
    fn none() -> Self {
        Self { cancel: watch::channel(false).0, handles: Vec::new() }
    }

    /// Signal cancellation and wait for every child to unwind. Each task
    /// observes the signal at its next suspension point; the cover loop
    /// releases relay intent before returning.
    async fn stop(&mut self) {
        let _ = self.cancel.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

pub struct MqttRuntime {
    config: Arc<Config>,
    hardware: Arc<HardwareMap>,
    features: Arc<FeatureMap>,
    covers: SharedCovers,
    tcp_scanner: Option<SharedScanner>,
    rtu_scanner: Option<SharedScanner>,
}

impl MqttRuntime {
    pub fn new(
        config: Arc<Config>,
        hardware: Arc<HardwareMap>,
        features: Arc<FeatureMap>,
        covers: CoverMap,
        tcp_scanner: Option<SharedScanner>,
        rtu_scanner: Option<SharedScanner>,
    ) -> Self {
        Self {
            config,
            hardware,
            features,
            covers: Arc::new(Mutex::new(covers)),
            tcp_scanner,
            rtu_scanner,
        }
    }

    /// Connect/reconnect to the broker until the retry limit is exhausted
    /// or `shutdown` fires. On shutdown every child task is cancelled and
    /// joined before this returns, so the caller sees all of them unwound.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let slug = self.config.device_slug();
        let client_id = format!("{slug}-{}", Uuid::new_v4());
        info!("{} Client ID: {}", prefix::MQTT, client_id);

        let mut options = MqttOptions::new(
            client_id.clone(),
            self.config.mqtt.host.clone(),
            self.config.mqtt.port,
        );
        options.set_keep_alive(self.config.mqtt.keepalive_duration());
        if let (Some(username), Some(password)) =
            (&self.config.mqtt.username, &self.config.mqtt.password)
        {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let mut children = ChildTasks::none();
        let mut attempts: u32 = 0;
        let mut discovery_done = false;

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    children.stop().await;
                    return Ok(());
                }
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    attempts = 0;
                    info!(
                        "{} Connected to {}:{}",
                        prefix::MQTT, self.config.mqtt.host, self.config.mqtt.port
                    );

                    if let Err(err) =
                        client.subscribe(format!("{slug}/#"), QoS::AtMostOnce).await
                    {
                        warn!("{} Subscribe failed: {}", prefix::MQTT, err);
                    } else {
                        debug!("{} Subscribe topic {}/#", prefix::MQTT, slug);
                    }

                    if self.config.homeassistant.enabled && !discovery_done {
                        info!("{} Initialize Home Assistant discovery", prefix::MQTT);
                        discovery::publish_all(
                            &client,
                            &self.config,
                            &self.hardware,
                            &self.features,
                            &*self.covers.lock().await,
                        )
                        .await;
                        discovery_done = true;
                    }

                    children.stop().await;
                    children = self.spawn_children(&client).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                    self.dispatch(&slug, &publish.topic, &payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    children.stop().await;
                    attempts += 1;
                    error!(
                        "{} Error '{}'. Connecting attempt #{}. Reconnecting in {} seconds.",
                        prefix::MQTT, err, attempts, self.config.mqtt.reconnect_interval
                    );
                    if self.config.mqtt.retry_exhausted(attempts) {
                        return Err(Error::MqttRetryLimit);
                    }
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = sleep(self.config.mqtt.reconnect_delay()) => {}
                    }
                }
            }
        }
    }

    async fn dispatch(&self, slug: &str, topic: &str, payload: &str) {
        for routed in route(slug, &self.features, topic, payload) {
            match routed {
                Routed::Output { feature, on } => {
                    info!("{} [{}] Subscribe message: {}", prefix::MQTT, topic, payload);
                    if let Err(err) = feature.set_state(on).await {
                        warn!(
                            "{} [{}] Write request failed: {}",
                            prefix::MQTT, feature.circuit, err
                        );
                    }
                }
                Routed::Cover { object_id, command } => {
                    info!("{} [{}] Subscribe message: {}", prefix::MQTT, topic, payload);
                    self.covers.lock().await.command(&object_id, command, Instant::now()).await;
                }
            }
        }
    }

    async fn spawn_children(&self, client: &AsyncClient) -> ChildTasks {
        let (cancel, _) = watch::channel(false);
        let mut handles = Vec::new();

        if let Some(scanner) = &self.tcp_scanner {
            handles.push(tokio::spawn(publish_loop(
                client.clone(),
                scanner.clone(),
                self.features.clone(),
                Bus::Tcp,
                TCP_PUBLISH_KINDS,
                self.config.modbus_tcp.scan_interval(),
                cancel.subscribe(),
            )));
        }

        if let Some(scanner) = &self.rtu_scanner {
            handles.push(tokio::spawn(publish_loop(
                client.clone(),
                scanner.clone(),
                self.features.clone(),
                Bus::Rtu,
                RTU_PUBLISH_KINDS,
                self.config.modbus_serial.scan_interval(),
                cancel.subscribe(),
            )));
        }

        if !self.covers.lock().await.is_empty() {
            handles.push(tokio::spawn(cover_loop(
                client.clone(),
                self.covers.clone(),
                cancel.subscribe(),
            )));
        }

        ChildTasks { cancel, handles }
    }

    /// Release cover relays and push the resulting writes onto the bus;
    /// used by the supervisor on shutdown.
    pub async fn shutdown(&self) {
        self.covers.lock().await.release_all(Instant::now()).await;
        if let Some(scanner) = &self.tcp_scanner {
            scanner.lock().await.flush_writes().await;
        }
        if let Some(scanner) = &self.rtu_scanner {
            scanner.lock().await.flush_writes().await;
        }
    }
}

/// Scan one bus, publish every changed payload retained at QoS 1, sleep the
/// bus scan interval, repeat until cancelled.
async fn publish_loop(
    client: AsyncClient,
    scanner: SharedScanner,
    features: Arc<FeatureMap>,
    bus: Bus,
    kinds: &'static [FeatureKind],
    scan_interval: std::time::Duration,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            return;
        }

        scanner.lock().await.tick().await;

        for feature in features.by_bus_and_kinds(bus, kinds) {
            let Some(payload) = feature.changed_payload() else {
                continue;
            };
            match client.publish(feature.state_topic(), QoS::AtLeastOnce, true, payload.clone()).await
            {
                Ok(()) => {
                    debug!(
                        "{} [{}] Publishing message: {}",
                        prefix::MQTT,
                        feature.state_topic(),
                        payload
                    );
                    feature.mark_published(&payload);
                }
                Err(err) => {
                    warn!("{} [{}] Publish failed: {}", prefix::MQTT, feature.state_topic(), err);
                }
            }
        }

        tokio::select! {
            _ = cancel.changed() => return,
            _ = sleep(scan_interval) => {}
        }
    }
}

/// Tick the cover engines and publish their state/position transitions.
/// Cancellation releases every relay before the task returns.
async fn cover_loop(client: AsyncClient, covers: SharedCovers, mut cancel: watch::Receiver<bool>) {
    let mut ticker = interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                covers.lock().await.release_all(Instant::now()).await;
                return;
            }
            _ = ticker.tick() => {
                let publishes = covers.lock().await.tick_all(Instant::now()).await;
                for (topic, payload) in publishes {
                    if let Err(err) =
                        client.publish(topic.clone(), QoS::AtLeastOnce, true, payload.clone()).await
                    {
                        warn!("{} [{}] Publish failed: {}", prefix::MQTT, topic, err);
                    } else {
                        debug!("{} [{}] Publishing message: {}", prefix::MQTT, topic, payload);
                    }
                }
            }
        }
    }
}
