//! Boot sequence and background tasks shared by the host and ESP front-ends.

use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{info, warn};
use serde_json::Value;

use crate::{
    config::{AccessPointIdentity, DocumentKind, MessagingProfile, SupervisorConfig},
    counter::CounterStore,
    error::{DeviceError, StoreError},
    network::{BootOutcome, LinkState, NetworkManager, WifiLink},
    nvram::{ByteStore, NvBytes},
    reset::{ResetCoordinator, ResetFlag},
    retry::{Clock, Restart},
    session::{BrokerSession, InboundMessage, SessionOutcome, SessionSupervisor, SharedSession},
    signal::{PulseCounter, SignalLatch},
    store::{ConfigStore, DocumentStorage},
    telemetry::{DigitalInput, SensorBank, StatusReport, TelemetryPublisher, TelemetrySource},
};

/// Interrupt-side handles. Producers only ever touch these.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub pulses: Arc<PulseCounter>,
    pub reset: Arc<SignalLatch>,
}

/// Everything a front-end supplies to bring the device up.
pub struct Platform<L, B, S, C> {
    pub link: L,
    pub bytes: B,
    pub documents: S,
    pub session: C,
    pub inbound: Receiver<InboundMessage>,
    pub sensors: Box<dyn SensorBank>,
    pub input: Arc<dyn DigitalInput>,
    pub clock: Arc<dyn Clock>,
    pub restart: Arc<dyn Restart>,
    pub signals: Signals,
}

pub struct Device<L, B, S, C> {
    config: SupervisorConfig,
    bytes: NvBytes<B>,
    messaging: MessagingProfile,
    store: Arc<ConfigStore<S>>,
    reset_flag: ResetFlag<B>,
    network: Arc<NetworkManager<L>>,
    session: SharedSession<C>,
    source: Arc<TelemetrySource<B, S>>,
    publisher: Arc<TelemetryPublisher<B, S, C>>,
    supervisor: Arc<SessionSupervisor<B, S, C>>,
    inbound: Mutex<Option<Receiver<InboundMessage>>>,
    input: Arc<dyn DigitalInput>,
    clock: Arc<dyn Clock>,
    restart: Arc<dyn Restart>,
    signals: Signals,
    boot: BootOutcome,
    session_outcome: Option<SessionOutcome>,
    started: AtomicBool,
}

impl<L, B, S, C> Device<L, B, S, C>
where
    L: WifiLink + 'static,
    B: ByteStore + 'static,
    S: DocumentStorage + 'static,
    C: BrokerSession + 'static,
{
    /// Loads both documents, settles the network identity and, when both the
    /// managed network and the broker are configured, opens the session.
    pub fn boot(
        platform: Platform<L, B, S, C>,
        mut config: SupervisorConfig,
        identity: AccessPointIdentity,
    ) -> Self {
        config.sanitize();
        let Platform {
            link,
            bytes,
            documents,
            session,
            inbound,
            sensors,
            input,
            clock,
            restart,
            signals,
        } = platform;

        let bytes = NvBytes::new(bytes);
        let store = Arc::new(ConfigStore::new(documents));
        let network_profile = store.load_network();
        let messaging = store.load_messaging();
        info!(
            "boot: network {}, broker {}",
            if network_profile.configured { "configured" } else { "unconfigured" },
            if messaging.configured { "configured" } else { "unconfigured" },
        );

        let reset_flag = ResetFlag::new(bytes.clone());
        let nvram = bytes.clone();
        let network = Arc::new(NetworkManager::new(
            link,
            clock.clone(),
            restart.clone(),
            config.clone(),
            identity,
        ));
        let boot = network.boot(&network_profile, &reset_flag);

        let session = SharedSession::new(session);
        let source = Arc::new(TelemetrySource::new(
            messaging.client_id.clone(),
            CounterStore::new(bytes, config.counter_layout),
            store.clone(),
            sensors,
            input.clone(),
            network.clone(),
            clock.clone(),
        ));
        let publisher = Arc::new(TelemetryPublisher::new(
            source.clone(),
            session.clone(),
            messaging.topic_root.clone(),
        ));
        let supervisor = Arc::new(SessionSupervisor::new(
            session.clone(),
            &messaging,
            store.clone(),
            publisher.clone(),
            network.status(),
            clock.clone(),
            restart.clone(),
            config.clone(),
        ));

        let session_outcome = match boot {
            BootOutcome::Managed { .. } if messaging.configured => Some(supervisor.connect()),
            BootOutcome::Managed { .. } => {
                info!("broker not configured; staying offline");
                None
            }
            BootOutcome::AccessPoint { .. } | BootOutcome::Restarting => None,
        };

        Self {
            config,
            bytes: nvram,
            messaging,
            store,
            reset_flag,
            network,
            session,
            source,
            publisher,
            supervisor,
            inbound: Mutex::new(Some(inbound)),
            input,
            clock,
            restart,
            signals,
            boot,
            session_outcome,
            started: AtomicBool::new(false),
        }
    }

    pub fn boot_outcome(&self) -> BootOutcome {
        self.boot
    }

    pub fn session_outcome(&self) -> Option<SessionOutcome> {
        self.session_outcome
    }

    pub fn link_state(&self) -> LinkState {
        self.network.state()
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    pub fn store(&self) -> &ConfigStore<S> {
        &self.store
    }

    pub fn session(&self) -> &SharedSession<C> {
        &self.session
    }

    pub fn counter(&self) -> &CounterStore<B> {
        self.source.counter()
    }

    pub fn nvram(&self) -> &NvBytes<B> {
        &self.bytes
    }

    /// Address the dashboard script calls back to.
    pub fn dashboard_address(&self) -> Ipv4Addr {
        self.network.dashboard_address()
    }

    pub fn status_report(&self) -> StatusReport {
        self.source.status_report(self.network.state())
    }

    /// Full-document replace from the local configuration endpoint.
    pub fn replace_document(&self, kind: DocumentKind, document: &Value) -> Result<(), StoreError> {
        self.store.replace(kind, document)
    }

    /// Restart requested by an operator; the caller answers first.
    pub fn request_restart(&self, reason: &str) {
        self.clock
            .sleep(Duration::from_millis(self.config.restart_delay_ms));
        self.restart.restart(reason);
    }

    /// Persists one increment per pulse recorded since the last drain and
    /// returns how many increments were stored.
    pub fn drain_pulses(&self) -> u32 {
        let pulses = self.signals.pulses.drain();
        if pulses == 0 {
            return 0;
        }

        let mut persisted = 0_u32;
        for _ in 0..pulses {
            match self.counter().increment_and_persist() {
                Ok(_) => persisted += 1,
                Err(err) => warn!("pulse dropped, counter not persisted: {err}"),
            }
        }
        self.input.rearm();
        persisted
    }

    /// Spawns the named supervision tasks for the mode the device booted in.
    pub fn spawn_background(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, DeviceError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(DeviceError::AlreadyStarted);
        }

        let mut handles = Vec::new();

        let coordinator = ResetCoordinator::new(
            self.reset_flag.clone(),
            self.signals.reset.clone(),
            self.clock.clone(),
            self.restart.clone(),
            Duration::from_millis(self.config.reset_settle_ms),
            Duration::from_millis(self.config.input_poll_interval_ms),
        );
        handles.push(spawn("reset-watch", move || coordinator.run())?);

        let device = self.clone();
        handles.push(spawn("pulse-counter", move || {
            let interval = Duration::from_millis(device.config.input_poll_interval_ms);
            loop {
                device.drain_pulses();
                device.clock.sleep(interval);
            }
        })?);

        if !matches!(self.boot, BootOutcome::Managed { .. }) {
            return Ok(handles);
        }

        let network = self.network.clone();
        handles.push(spawn("link-supervisor", move || network.run_supervision())?);

        if !self.messaging.configured {
            return Ok(handles);
        }

        let supervisor = self.supervisor.clone();
        handles.push(spawn("session-supervisor", move || {
            supervisor.run_supervision()
        })?);

        match self
            .inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            Some(inbound) => {
                let supervisor = self.supervisor.clone();
                handles.push(spawn("session-rx", move || {
                    for message in inbound.iter() {
                        supervisor.handle_inbound(&message);
                    }
                    warn!("inbound channel closed");
                })?);
            }
            None => warn!("inbound channel already taken"),
        }

        let publisher = self.publisher.clone();
        let clock = self.clock.clone();
        let interval = self.messaging.publish_interval_secs;
        handles.push(spawn("telemetry-timer", move || {
            publisher.run_timer(clock.as_ref(), interval)
        })?);

        Ok(handles)
    }
}

fn spawn(
    name: &'static str,
    task: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, DeviceError> {
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(task)
        .map_err(|source| DeviceError::Spawn { name, source })?;
    info!("started `{name}` task");
    Ok(handle)
}
