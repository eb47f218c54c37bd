use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyInputPin, IOPin, Input, InputOutput, InputPin, InterruptType, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Serialize;
use serde_json::Value;

use dweb08_common::{
    config::FALLBACK_DNS, AccessPointIdentity, BrokerSession, ByteStore, Device, DigitalInput,
    DocumentKind, DocumentStorage, InboundMessage, LinkError, NvramError, Platform, Restart,
    SensorBank, SessionError, SessionOptions, Signals, StaticAddressing, StoreError,
    SupervisorConfig, SystemClock, WifiLink, DISCONNECTED_CELSIUS, NVRAM_CAPACITY,
};

use crate::web;

type EspDevice = Device<EspLink, NvsByteStore, NvsDocuments, EspSession>;

const NVS_NAMESPACE: &str = "dweb08";
const SLOT_KEYS: [&str; NVRAM_CAPACITY] = [
    "slot0", "slot1", "slot2", "slot3", "slot4", "slot5", "slot6", "slot7",
];

const TEMP_BUS_PIN: i32 = 4;
const MAX_HTTP_BODY: usize = 4096;
const MAX_DOCUMENT_BYTES: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;

#[derive(Debug, Serialize)]
struct MessageBody {
    message: &'static str,
}

/// Eight persisted slots, staged in RAM until commit.
struct NvsByteStore {
    nvs: EspNvs<NvsDefault>,
    image: [u8; NVRAM_CAPACITY],
    dirty: [bool; NVRAM_CAPACITY],
}

impl NvsByteStore {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        let mut image = [0_u8; NVRAM_CAPACITY];
        for (slot, key) in SLOT_KEYS.iter().enumerate() {
            image[slot] = nvs.get_u8(key)?.unwrap_or(0);
        }

        Ok(Self {
            nvs,
            image,
            dirty: [false; NVRAM_CAPACITY],
        })
    }
}

impl ByteStore for NvsByteStore {
    fn read_byte(&self, slot: usize) -> u8 {
        self.image.get(slot).copied().unwrap_or(0)
    }

    fn write_byte(&mut self, slot: usize, value: u8) -> Result<(), NvramError> {
        if slot >= NVRAM_CAPACITY {
            return Err(NvramError::SlotOutOfRange {
                slot,
                capacity: NVRAM_CAPACITY,
            });
        }
        self.image[slot] = value;
        self.dirty[slot] = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), NvramError> {
        for slot in 0..NVRAM_CAPACITY {
            if !self.dirty[slot] {
                continue;
            }
            self.nvs
                .set_u8(SLOT_KEYS[slot], self.image[slot])
                .map_err(|err| NvramError::Backend(err.to_string()))?;
            self.dirty[slot] = false;
        }
        Ok(())
    }
}

struct NvsDocuments {
    partition: EspDefaultNvsPartition,
    lock: Mutex<()>,
}

impl NvsDocuments {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            lock: Mutex::new(()),
        }
    }

    fn key(kind: DocumentKind) -> &'static str {
        match kind {
            DocumentKind::Network => "network_json",
            DocumentKind::Messaging => "mqtt_json",
        }
    }

    fn open(&self) -> Result<EspNvs<NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

impl DocumentStorage for NvsDocuments {
    fn read(&self, kind: DocumentKind) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; MAX_DOCUMENT_BYTES];

        let value = nvs
            .get_str(Self::key(kind), &mut buffer)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(value.map(|value| value.as_bytes().to_vec()))
    }

    fn write(&self, kind: DocumentKind, bytes: &[u8]) -> Result<(), StoreError> {
        let payload = core::str::from_utf8(bytes)
            .map_err(|err| StoreError::Backend(format!("document is not utf-8: {err}")))?;
        if payload.len() >= MAX_DOCUMENT_BYTES {
            return Err(StoreError::Backend(format!(
                "document exceeds {MAX_DOCUMENT_BYTES} bytes"
            )));
        }

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut nvs = self.open()?;
        nvs.set_str(Self::key(kind), payload)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }
}

struct EspLink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl EspLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
        Ok(Self { wifi })
    }

    fn ensure_started(&mut self) -> Result<(), LinkError> {
        if !self.wifi.is_started().map_err(driver)? {
            self.wifi.start().map_err(driver)?;
            disable_wifi_power_save();
        }
        Ok(())
    }
}

fn driver(err: EspError) -> LinkError {
    LinkError::Driver(err.to_string())
}

impl WifiLink for EspLink {
    fn configure_static(&mut self, addressing: &StaticAddressing) -> Result<(), LinkError> {
        let mask = Mask::try_from(addressing.subnet)
            .map_err(|_| LinkError::InvalidConfiguration("invalid subnet mask"))?;

        let mut conf = NetifConfiguration::wifi_default_client();
        conf.key = "WIFI_STA_STATIC"
            .try_into()
            .map_err(|_| LinkError::InvalidConfiguration("netif key too long"))?;
        conf.ip_configuration = Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: addressing.address,
                subnet: Subnet {
                    gateway: addressing.gateway,
                    mask,
                },
                dns: Some(addressing.primary_dns),
                secondary_dns: addressing.secondary_dns,
            },
        )));

        let netif = EspNetif::new_with_conf(&conf).map_err(driver)?;
        self.wifi.wifi_mut().swap_netif_sta(netif).map_err(driver)?;
        Ok(())
    }

    fn associate(&mut self, ssid: &str, secret: &str) -> Result<(), LinkError> {
        let auth_method = if secret.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| LinkError::InvalidConfiguration("network name too long"))?,
                password: secret
                    .try_into()
                    .map_err(|_| LinkError::InvalidConfiguration("network secret too long"))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(driver)?;
        self.ensure_started()?;
        self.wifi.wifi_mut().connect().map_err(driver)
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.is_up().unwrap_or(false)
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        self.wifi.wifi_mut().connect().map_err(driver)
    }

    fn start_access_point(&mut self, identity: &AccessPointIdentity) -> Result<(), LinkError> {
        let mask = Mask::try_from(identity.subnet)
            .map_err(|_| LinkError::InvalidConfiguration("invalid access point mask"))?;

        let mut conf = NetifConfiguration::wifi_default_router();
        conf.ip_configuration = Some(IpConfiguration::Router(RouterConfiguration {
            subnet: Subnet {
                gateway: identity.address,
                mask,
            },
            dhcp_enabled: true,
            dns: Some(FALLBACK_DNS),
            secondary_dns: None,
        }));
        let netif = EspNetif::new_with_conf(&conf).map_err(driver)?;
        self.wifi.wifi_mut().swap_netif_ap(netif).map_err(driver)?;

        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: identity
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| LinkError::InvalidConfiguration("access point name too long"))?,
                password: identity
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| LinkError::InvalidConfiguration("access point secret too long"))?,
                auth_method: AuthMethod::WPAWPA2Personal,
                channel: 1,
                ..Default::default()
            }))
            .map_err(driver)?;
        self.ensure_started()?;
        self.wifi.wait_netif_up().map_err(driver)
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
    }

    fn signal_strength(&self) -> Option<i8> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info.rssi)
    }
}

/// Broker session over the ESP-IDF client. Each connect replaces the client;
/// dropping the old one ends its event thread.
struct EspSession {
    inbound: Sender<InboundMessage>,
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
}

impl EspSession {
    fn new(inbound: Sender<InboundMessage>) -> Self {
        Self {
            inbound,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn client(&mut self) -> Result<&mut EspMqttClient<'static>, SessionError> {
        self.client.as_mut().ok_or(SessionError::NotConnected)
    }
}

impl BrokerSession for EspSession {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), SessionError> {
        self.client = None;
        self.connected.store(false, Ordering::Release);

        let url = format!("mqtt://{}:{}", options.host, options.port);
        let conf = MqttClientConfiguration {
            client_id: (!options.client_id.is_empty()).then_some(options.client_id.as_str()),
            username: (!options.username.is_empty()).then_some(options.username.as_str()),
            password: (!options.password.is_empty()).then_some(options.password.as_str()),
            // Reconnects go through the supervisor's retry windows.
            disable_auto_reconnect: true,
            ..Default::default()
        };

        let (client, mut connection) = EspMqttClient::new(&url, &conf)
            .map_err(|err| SessionError::Client(err.to_string()))?;
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();
        let inbound = self.inbound.clone();

        thread::Builder::new()
            .name("mqtt-events".into())
            .stack_size(8192)
            .spawn(move || {
                while let Ok(event) = connection.next() {
                    match event.payload() {
                        EventPayload::Connected(_) => flag.store(true, Ordering::Release),
                        EventPayload::Disconnected => flag.store(false, Ordering::Release),
                        EventPayload::Received {
                            topic: Some(topic),
                            data,
                            details: Details::Complete,
                            ..
                        } => {
                            let message = InboundMessage {
                                topic: topic.to_string(),
                                payload: data.to_vec(),
                            };
                            if inbound.send(message).is_err() {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                flag.store(false, Ordering::Release);
                info!("mqtt event loop ended");
            })
            .map_err(|err| SessionError::Client(err.to_string()))?;

        self.client = Some(client);
        self.connected = connected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Acquire)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| SessionError::Client(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        self.client()?
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| SessionError::Client(err.to_string()))
    }
}

/// DS18B20 probes on one shared bus, reported in scan order.
struct ProbeBank {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    probes: Vec<Address>,
    delay: Ets,
}

impl ProbeBank {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut bank = Self {
            one_wire,
            probes: Vec::new(),
            delay: Ets,
        };
        bank.scan();
        Ok(bank)
    }

    fn scan(&mut self) {
        self.probes.clear();
        for address in self.one_wire.devices(false, &mut self.delay) {
            match address {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                    self.probes.push(address);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("one-wire scan failed: {err:?}");
                    break;
                }
            }
        }
        info!(
            "{} DS18B20 probe(s) on GPIO{TEMP_BUS_PIN}",
            self.probes.len()
        );
    }
}

impl SensorBank for ProbeBank {
    fn read_celsius(&mut self) -> Vec<f32> {
        if self.probes.is_empty() {
            self.scan();
        }
        if self.probes.is_empty() {
            return Vec::new();
        }

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            return vec![DISCONNECTED_CELSIUS; self.probes.len()];
        }
        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        let Self {
            one_wire,
            probes,
            delay,
        } = self;
        probes
            .iter()
            .map(|address| {
                let sensor = match Ds18b20::new::<core::convert::Infallible>(*address) {
                    Ok(sensor) => sensor,
                    Err(err) => {
                        warn!("invalid DS18B20 address {address:?}: {err:?}");
                        return DISCONNECTED_CELSIUS;
                    }
                };
                match sensor.read_data(&mut *one_wire, &mut *delay) {
                    Ok(data) => data.temperature,
                    Err(err) => {
                        warn!("DS18B20 {address:?} did not answer: {err:?}");
                        DISCONNECTED_CELSIUS
                    }
                }
            })
            .collect()
    }
}

/// Pulse input: the ISR only bumps the shared counter; the interrupt stays
/// disabled after firing until the counter task re-arms it.
struct PulseInput {
    pin: Mutex<PinDriver<'static, AnyInputPin, Input>>,
}

impl PulseInput {
    fn new(pin: AnyInputPin, signals: &Signals) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input(pin)?;
        pin.set_interrupt_type(InterruptType::PosEdge)?;
        let pulses = signals.pulses.clone();
        unsafe {
            pin.subscribe(move || pulses.record())?;
        }
        pin.enable_interrupt()?;
        Ok(Self {
            pin: Mutex::new(pin),
        })
    }
}

impl DigitalInput for PulseInput {
    fn is_high(&self) -> bool {
        self.pin
            .lock()
            .map(|pin| pin.is_high())
            .unwrap_or(false)
    }

    fn rearm(&self) {
        let mut pin = self.pin.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = pin.enable_interrupt() {
            warn!("failed to re-arm pulse input: {err}");
        }
    }
}

/// Reset button on the boot strap pin, active low.
fn watch_reset_button(
    pin: AnyIOPin,
    signals: &Signals,
) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
    let mut pin = PinDriver::input(pin)?;
    pin.set_pull(Pull::Up)?;
    pin.set_interrupt_type(InterruptType::NegEdge)?;
    let reset = signals.reset.clone();
    unsafe {
        pin.subscribe(move || reset.raise())?;
    }
    pin.enable_interrupt()?;
    Ok(pin)
}

struct EspRestart;

impl Restart for EspRestart {
    fn restart(&self, reason: &str) {
        warn!("restarting: {reason}");
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let signals = Signals::default();
    let bytes = NvsByteStore::open(nvs_partition.clone()).context("failed to open nvram slots")?;
    let link = EspLink::new(modem, sys_loop, nvs_partition.clone())
        .context("failed to initialize wifi")?;
    let sensors = ProbeBank::new(pins.gpio4.downgrade()).context("failed to initialize probes")?;
    let input = PulseInput::new(pins.gpio34.downgrade_input(), &signals)
        .context("failed to initialize pulse input")?;
    let _reset_button = watch_reset_button(pins.gpio0.downgrade(), &signals)
        .context("failed to initialize reset button")?;
    let (inbound_tx, inbound_rx) = mpsc::channel();

    let platform = Platform {
        link,
        bytes,
        documents: NvsDocuments::new(nvs_partition),
        session: EspSession::new(inbound_tx),
        inbound: inbound_rx,
        sensors: Box::new(sensors),
        input: Arc::new(input),
        clock: Arc::new(SystemClock),
        restart: Arc::new(EspRestart),
        signals,
    };

    let device: Arc<EspDevice> = Arc::new(Device::boot(
        platform,
        SupervisorConfig::default(),
        AccessPointIdentity::default(),
    ));
    info!(
        "booted: {:?}, session {:?}",
        device.boot_outcome(),
        device.session_outcome()
    );

    device
        .spawn_background()
        .context("failed to start background tasks")?;
    let _server = create_http_server(device.clone())?;

    // Boot windows can outlast the watchdog, so the main task joins it only now.
    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    loop {
        feed_watchdog();
        thread::sleep(Duration::from_secs(1));
    }
}

fn create_http_server(device: Arc<EspDevice>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for (path, content_type, body) in [
        ("/", web::HTML_CONTENT_TYPE, web::INDEX_HTML),
        ("/style.css", web::CSS_CONTENT_TYPE, web::STYLE_CSS),
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            write_asset(req, content_type, body.as_bytes())
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/main.js", Method::Get, move |req| {
            let script = web::render_script(web::MAIN_JS, device.dashboard_address());
            write_asset(req, web::JS_CONTENT_TYPE, script.as_bytes())
        })?;
    }

    for (path, kind) in [
        ("/network", DocumentKind::Network),
        ("/mqtt", DocumentKind::Messaging),
    ] {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Post, move |mut req| {
            let (status, message) = match read_request_body(&mut req) {
                Ok(body) => replace_document(&device, kind, &body),
                Err(err) => {
                    warn!("rejected {} document: {err:#}", kind.as_str());
                    (400, "Configuration must be a JSON object.")
                }
            };
            write_json(req, status, &MessageBody { message })
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/data", Method::Get, move |req| {
            let report = device.status_report();
            write_json(req, 200, &report)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/restart", Method::Get, move |req| {
        let device = device.clone();
        thread::Builder::new()
            .name("restart-request".into())
            .spawn(move || device.request_restart("restart requested over http"))?;
        write_json(req, 200, &MessageBody { message: "Restarting." })
    })?;

    Ok(server)
}

fn replace_document(device: &EspDevice, kind: DocumentKind, body: &[u8]) -> (u16, &'static str) {
    let document = match serde_json::from_slice::<Value>(body) {
        Ok(document) => document,
        Err(err) => {
            warn!("rejected {} document: {err}", kind.as_str());
            return (400, "Configuration must be a JSON object.");
        }
    };

    match device.replace_document(kind, &document) {
        Ok(()) => (200, "Configuration has been saved."),
        Err(StoreError::NotAnObject) => (400, "Configuration must be a JSON object."),
        Err(err) => {
            warn!("failed to save {} document: {err}", kind.as_str());
            (500, "Configuration has not been saved.")
        }
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_asset(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    content_type: &str,
    body: &[u8],
) -> anyhow::Result<()> {
    req.into_response(200, None, &[("Content-Type", content_type)])?
        .write_all(body)?;
    Ok(())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
