use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use dweb08_common::{
    retry::monotonic_ms, AccessPointIdentity, BrokerSession, Device, DigitalInput, DocumentKind,
    FileByteStore, FsDocumentStorage, InboundMessage, LinkError, Platform, Restart, SensorBank,
    SessionError, SessionOptions, Signals, StaticAddressing, StoreError, SupervisorConfig,
    SystemClock, WifiLink,
};

use crate::web;

type HostDevice = Device<HostLink, FileByteStore, FsDocumentStorage, HostSession>;

/// Exit status asking the service manager to start the process again.
const RESTART_EXIT_CODE: i32 = 75;
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const MQTT_CHANNEL_CAPACITY: usize = 32;
const FALLBACK_CLIENT_ID: &str = "dweb08";
const SUPERVISOR_CONFIG_FILE: &str = "supervisor.json";

#[derive(Debug, Serialize)]
struct MessageBody {
    message: &'static str,
}

struct HostSettings {
    data_dir: PathBuf,
    web_root: PathBuf,
    http_port: u16,
    link_down: bool,
}

impl HostSettings {
    fn from_env() -> Self {
        let data_dir = std::env::var("DWEB_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".dweb08"));
        let web_root = std::env::var("DWEB_WEB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("www"));
        let http_port = std::env::var("DWEB_HTTP_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8080);
        let link_down = std::env::var("DWEB_LINK_DOWN")
            .map(|value| matches!(value.trim(), "1" | "true"))
            .unwrap_or(false);

        Self {
            data_dir,
            web_root,
            http_port,
            link_down,
        }
    }
}

/// Reads timing overrides from the data directory. A missing file means the
/// built-in defaults; an unreadable one is logged and ignored.
fn load_supervisor_config(path: &Path) -> anyhow::Result<SupervisorConfig> {
    match std::fs::read(path) {
        Ok(raw) => match SupervisorConfig::from_json(&raw) {
            Ok(config) => {
                info!("loaded supervisor overrides from {}", path.display());
                Ok(config)
            }
            Err(err) => {
                warn!("ignoring {}: {err}", path.display());
                Ok(SupervisorConfig::default())
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(SupervisorConfig::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Stand-in for the radio: the host network is either reachable or not.
struct HostLink {
    reachable: bool,
    connected: bool,
    static_address: Option<Ipv4Addr>,
}

impl HostLink {
    fn new(reachable: bool) -> Self {
        Self {
            reachable,
            connected: false,
            static_address: None,
        }
    }
}

impl WifiLink for HostLink {
    fn configure_static(&mut self, addressing: &StaticAddressing) -> Result<(), LinkError> {
        info!(
            "host link: static {} gw {} mask {} dns {} / {:?}",
            addressing.address,
            addressing.gateway,
            addressing.subnet,
            addressing.primary_dns,
            addressing.secondary_dns
        );
        self.static_address = Some(addressing.address);
        Ok(())
    }

    fn associate(&mut self, ssid: &str, _secret: &str) -> Result<(), LinkError> {
        if !self.reachable {
            return Err(LinkError::Driver(format!("`{ssid}` is not reachable")));
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        self.connected = self.reachable;
        Ok(())
    }

    fn start_access_point(&mut self, identity: &AccessPointIdentity) -> Result<(), LinkError> {
        info!("host link: serving as access point `{}`", identity.ssid);
        self.connected = false;
        Ok(())
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        if !self.connected {
            return None;
        }
        Some(self.static_address.unwrap_or(Ipv4Addr::LOCALHOST))
    }

    fn signal_strength(&self) -> Option<i8> {
        None
    }
}

/// Broker session over the blocking rumqttc client. Each connect builds a new
/// client whose event thread flips its own connected flag.
struct HostSession {
    inbound: Sender<InboundMessage>,
    client: Option<Client>,
    connected: Arc<AtomicBool>,
}

impl HostSession {
    fn new(inbound: Sender<InboundMessage>) -> Self {
        Self {
            inbound,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn client(&self) -> Result<&Client, SessionError> {
        self.client.as_ref().ok_or(SessionError::NotConnected)
    }
}

impl BrokerSession for HostSession {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), SessionError> {
        if let Some(previous) = self.client.take() {
            let _ = previous.disconnect();
        }
        self.connected.store(false, Ordering::Release);

        // The client rejects an empty id.
        let client_id = if options.client_id.trim().is_empty() {
            FALLBACK_CLIENT_ID
        } else {
            options.client_id.as_str()
        };
        let mut mqtt_options = MqttOptions::new(client_id, &options.host, options.port);
        mqtt_options.set_keep_alive(MQTT_KEEP_ALIVE);
        if !options.username.is_empty() {
            mqtt_options.set_credentials(&options.username, &options.password);
        }

        let (client, mut connection) = Client::new(mqtt_options, MQTT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let inbound = self.inbound.clone();
        let flag = connected.clone();

        thread::Builder::new()
            .name("mqtt-events".into())
            .spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            flag.store(true, Ordering::Release);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let message = InboundMessage {
                                topic: publish.topic,
                                payload: publish.payload.to_vec(),
                            };
                            if inbound.send(message).is_err() {
                                break;
                            }
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            flag.store(false, Ordering::Release);
                            break;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!("mqtt connection error: {err}");
                            flag.store(false, Ordering::Release);
                            break;
                        }
                    }
                }
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
            .map_err(|err| SessionError::Client(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        self.client()?
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| SessionError::Client(err.to_string()))
    }
}

/// Two simulated probes drifting slowly around room temperature.
struct SimulatedProbes;

impl SensorBank for SimulatedProbes {
    fn read_celsius(&mut self) -> Vec<f32> {
        let minutes = (monotonic_ms() / 60_000 % 20) as f32;
        vec![21.0 + minutes * 0.05, 19.5 - minutes * 0.05]
    }
}

struct HostInput;

impl DigitalInput for HostInput {
    fn is_high(&self) -> bool {
        false
    }
}

struct ProcessRestart;

impl Restart for ProcessRestart {
    fn restart(&self, reason: &str) {
        warn!("restarting: {reason}");
        std::process::exit(RESTART_EXIT_CODE);
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    std::fs::create_dir_all(&settings.data_dir).with_context(|| {
        format!("failed to create data directory {}", settings.data_dir.display())
    })?;

    let config = load_supervisor_config(&settings.data_dir.join(SUPERVISOR_CONFIG_FILE))?;
    let bytes = FileByteStore::open(settings.data_dir.join("nvram.bin"))
        .context("failed to open nvram image")?;
    let (inbound_tx, inbound_rx) = mpsc::channel();
    let signals = Signals::default();

    let platform = Platform {
        link: HostLink::new(!settings.link_down),
        bytes,
        documents: FsDocumentStorage::new(&settings.data_dir),
        session: HostSession::new(inbound_tx),
        inbound: inbound_rx,
        sensors: Box::new(SimulatedProbes),
        input: Arc::new(HostInput),
        clock: Arc::new(SystemClock),
        restart: Arc::new(ProcessRestart),
        signals: signals.clone(),
    };

    // Boot can block for minutes while association and broker windows run.
    let device: Arc<HostDevice> = Arc::new(
        tokio::task::spawn_blocking(move || {
            Device::boot(platform, config, AccessPointIdentity::default())
        })
        .await
        .context("boot task failed")?,
    );
    info!(
        "booted: {:?}, session {:?}",
        device.boot_outcome(),
        device.session_outcome()
    );

    device
        .spawn_background()
        .context("failed to start background tasks")?;
    spawn_signal_handlers(signals)?;

    let app = Router::new()
        .route("/", get(handle_get_index))
        .route("/style.css", get(handle_get_style))
        .route("/main.js", get(handle_get_script))
        .route("/network", post(handle_post_network))
        .route("/mqtt", post(handle_post_mqtt))
        .route("/data", get(handle_get_data))
        .route("/restart", get(handle_get_restart))
        .fallback_service(ServeDir::new(&settings.web_root))
        .with_state(device);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http server at {addr}"))?;

    info!("listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handlers(signals: Signals) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut pulse = signal(SignalKind::user_defined1()).context("failed to watch SIGUSR1")?;
    let mut reset = signal(SignalKind::hangup()).context("failed to watch SIGHUP")?;

    let pulses = signals.pulses.clone();
    tokio::spawn(async move {
        while pulse.recv().await.is_some() {
            pulses.record();
        }
    });

    tokio::spawn(async move {
        while reset.recv().await.is_some() {
            info!("reset signal received");
            signals.reset.raise();
        }
    });

    info!("SIGUSR1 records a pulse, SIGHUP asserts reset");
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handlers(_signals: Signals) -> anyhow::Result<()> {
    warn!("pulse and reset signals are only wired on unix hosts");
    Ok(())
}

async fn handle_get_index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, web::HTML_CONTENT_TYPE)], web::INDEX_HTML)
}

async fn handle_get_style() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, web::CSS_CONTENT_TYPE)], web::STYLE_CSS)
}

async fn handle_get_script(State(device): State<Arc<HostDevice>>) -> impl IntoResponse {
    let script = web::render_script(web::MAIN_JS, device.dashboard_address());
    ([(header::CONTENT_TYPE, web::JS_CONTENT_TYPE)], script)
}

async fn handle_post_network(State(device): State<Arc<HostDevice>>, body: Bytes) -> impl IntoResponse {
    replace_document(&device, DocumentKind::Network, &body)
}

async fn handle_post_mqtt(State(device): State<Arc<HostDevice>>, body: Bytes) -> impl IntoResponse {
    replace_document(&device, DocumentKind::Messaging, &body)
}

fn replace_document(device: &HostDevice, kind: DocumentKind, body: &[u8]) -> axum::response::Response {
    let document = match serde_json::from_slice::<Value>(body) {
        Ok(document) => document,
        Err(err) => {
            warn!("rejected {} document: {err}", kind.as_str());
            return message_response(StatusCode::BAD_REQUEST, "Configuration must be a JSON object.");
        }
    };

    match device.replace_document(kind, &document) {
        Ok(()) => message_response(StatusCode::OK, "Configuration has been saved."),
        Err(StoreError::NotAnObject) => {
            message_response(StatusCode::BAD_REQUEST, "Configuration must be a JSON object.")
        }
        Err(err) => {
            warn!("failed to save {} document: {err}", kind.as_str());
            message_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration has not been saved.",
            )
        }
    }
}

async fn handle_get_data(State(device): State<Arc<HostDevice>>) -> axum::response::Response {
    match tokio::task::spawn_blocking(move || device.status_report()).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            warn!("status report task failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_get_restart(State(device): State<Arc<HostDevice>>) -> impl IntoResponse {
    let spawned = thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || device.request_restart("restart requested over http"));
    if let Err(err) = spawned {
        warn!("failed to schedule restart: {err}");
        return message_response(StatusCode::INTERNAL_SERVER_ERROR, "Restart failed.");
    }
    message_response(StatusCode::OK, "Restarting.")
}

fn message_response(status: StatusCode, message: &'static str) -> axum::response::Response {
    (status, Json(MessageBody { message })).into_response()
}
