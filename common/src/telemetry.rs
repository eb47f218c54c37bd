use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    config::DocumentKind,
    counter::CounterStore,
    error::SessionError,
    network::LinkState,
    nvram::ByteStore,
    retry::Clock,
    session::{BrokerSession, SharedSession},
    store::{ConfigStore, DocumentStorage},
};

/// Reading reported by a probe that dropped off the bus.
pub const DISCONNECTED_CELSIUS: f32 = -127.0;

/// Temperature probes on the shared bus, in bus order.
pub trait SensorBank: Send {
    fn read_celsius(&mut self) -> Vec<f32>;
}

/// Interrupt-capable digital input.
pub trait DigitalInput: Send + Sync {
    fn is_high(&self) -> bool;

    /// Re-enables the edge interrupt after the pending pulses were drained.
    fn rearm(&self) {}
}

/// Link facts the snapshot reports.
pub trait LinkInfo: Send + Sync {
    fn signal_strength(&self) -> Option<i8>;
    fn local_address(&self) -> Option<Ipv4Addr>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub id: String,
    pub slaves: Vec<u8>,
    pub timestamp: u64,
    pub counter: u16,
    #[serde(rename = "GPIO")]
    pub gpio: u8,
    pub rssi: Option<i8>,
    pub ip: String,
    pub temps: Vec<f32>,
}

/// Live readings shown on the configuration dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub counter: u16,
    #[serde(rename = "GPIO")]
    pub gpio: bool,
    pub temperatures: Vec<f32>,
}

/// Body of `GET /data`. Documents that were never stored are omitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub network: Map<String, Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub mqtt: Map<String, Value>,
    pub status: DeviceStatus,
    pub link: LinkState,
    pub ip: String,
    pub rssi: Option<i8>,
}

/// Keeps only probes that answered with a real reading.
pub fn connected_readings(readings: &[f32]) -> Vec<f32> {
    readings
        .iter()
        .copied()
        .filter(|reading| reading.is_finite() && *reading != DISCONNECTED_CELSIUS)
        .collect()
}

/// Replaces the stored secret with a `<key>Set` flag.
pub fn redact(kind: DocumentKind, mut document: Map<String, Value>) -> Map<String, Value> {
    let key = kind.secret_key();
    let set = match document.remove(key) {
        Some(Value::String(secret)) => !secret.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    };
    document.insert(format!("{key}Set"), Value::Bool(set));
    document
}

pub struct TelemetrySource<B, S> {
    client_id: String,
    counter: CounterStore<B>,
    store: Arc<ConfigStore<S>>,
    sensors: Mutex<Box<dyn SensorBank>>,
    input: Arc<dyn DigitalInput>,
    link: Arc<dyn LinkInfo>,
    clock: Arc<dyn Clock>,
}

impl<B: ByteStore, S: DocumentStorage> TelemetrySource<B, S> {
    /// `client_id` is the identity the session was opened with at boot.
    pub fn new(
        client_id: impl Into<String>,
        counter: CounterStore<B>,
        store: Arc<ConfigStore<S>>,
        sensors: Box<dyn SensorBank>,
        input: Arc<dyn DigitalInput>,
        link: Arc<dyn LinkInfo>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            counter,
            store,
            sensors: Mutex::new(sensors),
            input,
            link,
            clock,
        }
    }

    pub fn counter(&self) -> &CounterStore<B> {
        &self.counter
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let readings = self
            .sensors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .read_celsius();

        TelemetrySnapshot {
            id: self.client_id.clone(),
            slaves: vec![1],
            timestamp: self.clock.now_ms(),
            counter: self.counter.read(),
            gpio: u8::from(self.input.is_high()),
            rssi: self.link.signal_strength(),
            ip: self
                .link
                .local_address()
                .unwrap_or(Ipv4Addr::UNSPECIFIED)
                .to_string(),
            temps: connected_readings(&readings),
        }
    }

    pub fn status_report(&self, link: LinkState) -> StatusReport {
        let document = |kind| {
            self.store
                .document(kind)
                .map(|document| redact(kind, document))
                .unwrap_or_default()
        };
        let snapshot = self.snapshot();

        StatusReport {
            network: document(DocumentKind::Network),
            mqtt: document(DocumentKind::Messaging),
            status: DeviceStatus {
                counter: snapshot.counter,
                gpio: snapshot.gpio != 0,
                temperatures: snapshot.temps,
            },
            link,
            ip: snapshot.ip,
            rssi: snapshot.rssi,
        }
    }
}

pub struct TelemetryPublisher<B, S, C> {
    source: Arc<TelemetrySource<B, S>>,
    session: SharedSession<C>,
    topic: String,
}

impl<B: ByteStore, S: DocumentStorage, C: BrokerSession> TelemetryPublisher<B, S, C> {
    pub fn new(
        source: Arc<TelemetrySource<B, S>>,
        session: SharedSession<C>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            source,
            session,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes one snapshot on the root topic. `Ok(false)` means there was
    /// no session to publish on.
    pub fn try_publish(&self) -> Result<bool, SessionError> {
        if !self.session.lock().is_connected() {
            return Ok(false);
        }

        // Sensor conversion can take a while; the session stays unlocked.
        let snapshot = self.source.snapshot();
        let payload = serde_json::to_vec(&snapshot)?;

        let mut session = self.session.lock();
        if !session.is_connected() {
            return Ok(false);
        }
        session.publish(&self.topic, &payload)?;
        debug!(
            "published snapshot on `{}` (counter {}, {} probe(s))",
            self.topic,
            snapshot.counter,
            snapshot.temps.len()
        );
        Ok(true)
    }

    pub fn publish_snapshot(&self) -> bool {
        match self.try_publish() {
            Ok(published) => published,
            Err(err) => {
                warn!("failed to publish snapshot on `{}`: {err}", self.topic);
                false
            }
        }
    }

    /// Periodic publishing. A zero interval disables the timer.
    pub fn run_timer(&self, clock: &dyn Clock, interval_secs: u16) {
        if interval_secs == 0 {
            info!("telemetry interval is 0; periodic publishing disabled");
            return;
        }

        let interval = Duration::from_secs(u64::from(interval_secs));
        loop {
            clock.sleep(interval);
            self.publish_snapshot();
        }
    }
}
