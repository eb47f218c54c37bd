//! Deterministic doubles for the platform seams.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use crate::{
    config::{AccessPointIdentity, DocumentKind},
    error::{LinkError, NvramError, SessionError, StoreError},
    network::{StaticAddressing, WifiLink},
    nvram::{ByteStore, NVRAM_CAPACITY},
    retry::{Clock, Restart},
    session::{BrokerSession, SessionOptions},
    store::DocumentStorage,
    telemetry::{DigitalInput, LinkInfo, SensorBank},
};

/// Time only moves when something sleeps.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    }
}

#[derive(Debug, Default)]
pub struct RecordingRestart {
    reasons: Mutex<Vec<String>>,
}

impl RecordingRestart {
    pub fn count(&self) -> usize {
        self.reasons.lock().unwrap().len()
    }

    pub fn last_reason(&self) -> Option<String> {
        self.reasons.lock().unwrap().last().cloned()
    }
}

impl Restart for RecordingRestart {
    fn restart(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryByteStore {
    image: [u8; NVRAM_CAPACITY],
    pub commits: u32,
    pub fail_commits: bool,
}

impl ByteStore for MemoryByteStore {
    fn read_byte(&self, slot: usize) -> u8 {
        self.image.get(slot).copied().unwrap_or(0)
    }

    fn write_byte(&mut self, slot: usize, value: u8) -> Result<(), NvramError> {
        let byte = self.image.get_mut(slot).ok_or(NvramError::SlotOutOfRange {
            slot,
            capacity: NVRAM_CAPACITY,
        })?;
        *byte = value;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), NvramError> {
        if self.fail_commits {
            return Err(NvramError::Backend("commit refused".to_string()));
        }
        self.commits += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDocuments {
    documents: Mutex<HashMap<DocumentKind, Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryDocuments {
    pub fn insert(&self, kind: DocumentKind, raw: &[u8]) {
        self.documents.lock().unwrap().insert(kind, raw.to_vec());
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl DocumentStorage for MemoryDocuments {
    fn read(&self, kind: DocumentKind) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.documents.lock().unwrap().get(&kind).cloned())
    }

    fn write(&self, kind: DocumentKind, bytes: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write refused".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(kind, bytes);
        Ok(())
    }
}

/// Radio that joins on the n-th association and can be made to drop.
#[derive(Debug, Default)]
pub struct FakeLink {
    pub connected: bool,
    pub connect_on_association: Option<u32>,
    pub associations: u32,
    pub reconnects: u32,
    pub down_for_reconnects: u32,
    pub static_addressing: Option<StaticAddressing>,
    pub static_before_association: bool,
    pub last_ssid: Option<String>,
    pub access_point: Option<AccessPointIdentity>,
}

impl FakeLink {
    pub fn connecting_on(association: u32) -> Self {
        Self {
            connect_on_association: Some(association),
            ..Self::default()
        }
    }

    /// Loses the link until `reconnects` reconnect requests were issued.
    pub fn drop_link(&mut self, reconnects: u32) {
        self.connected = false;
        self.down_for_reconnects = reconnects;
    }
}

impl WifiLink for FakeLink {
    fn configure_static(&mut self, addressing: &StaticAddressing) -> Result<(), LinkError> {
        self.static_addressing = Some(addressing.clone());
        Ok(())
    }

    fn associate(&mut self, ssid: &str, _secret: &str) -> Result<(), LinkError> {
        if self.associations == 0 {
            self.static_before_association = self.static_addressing.is_some();
        }
        self.associations += 1;
        self.last_ssid = Some(ssid.to_string());
        if self
            .connect_on_association
            .is_some_and(|target| self.associations >= target)
        {
            self.connected = true;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        self.reconnects += 1;
        self.down_for_reconnects = self.down_for_reconnects.saturating_sub(1);
        if self.down_for_reconnects == 0 {
            self.connected = true;
            Ok(())
        } else {
            Err(LinkError::Driver("no beacon".to_string()))
        }
    }

    fn start_access_point(&mut self, identity: &AccessPointIdentity) -> Result<(), LinkError> {
        self.access_point = Some(identity.clone());
        Ok(())
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.connected.then_some(Ipv4Addr::new(10, 0, 0, 40))
    }

    fn signal_strength(&self) -> Option<i8> {
        self.connected.then_some(-58)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FakeLinkInfo {
    pub rssi: Option<i8>,
    pub address: Option<Ipv4Addr>,
}

impl LinkInfo for FakeLinkInfo {
    fn signal_strength(&self) -> Option<i8> {
        self.rssi
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.address
    }
}

/// Broker client that accepts the n-th connect.
#[derive(Debug, Default)]
pub struct FakeSession {
    pub connected: bool,
    pub connect_on: Option<u32>,
    pub connects: u32,
    pub last_options: Option<SessionOptions>,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
}

impl FakeSession {
    pub fn connecting_on(connect: u32) -> Self {
        Self {
            connect_on: Some(connect),
            ..Self::default()
        }
    }

    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }
}

impl BrokerSession for FakeSession {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), SessionError> {
        self.connects += 1;
        self.last_options = Some(options.clone());
        if self.connect_on.is_some_and(|target| self.connects >= target) {
            self.connected = true;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeSensors {
    readings: Vec<f32>,
}

impl FakeSensors {
    pub fn new(readings: Vec<f32>) -> Self {
        Self { readings }
    }
}

impl SensorBank for FakeSensors {
    fn read_celsius(&mut self) -> Vec<f32> {
        self.readings.clone()
    }
}

#[derive(Debug, Default)]
pub struct FakeInput {
    high: AtomicBool,
    rearms: AtomicUsize,
}

impl FakeInput {
    pub fn new(high: bool) -> Self {
        Self {
            high: AtomicBool::new(high),
            rearms: AtomicUsize::new(0),
        }
    }

    pub fn rearms(&self) -> usize {
        self.rearms.load(Ordering::SeqCst)
    }
}

impl DigitalInput for FakeInput {
    fn is_high(&self) -> bool {
        self.high.load(Ordering::SeqCst)
    }

    fn rearm(&self) {
        self.rearms.fetch_add(1, Ordering::SeqCst);
    }
}
