use std::net::Ipv4Addr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::counter::CounterLayout;

pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Primary resolver on static setups; the profile DNS is installed as secondary.
pub const FALLBACK_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Network,
    #[serde(rename = "mqtt")]
    Messaging,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 2] = [DocumentKind::Network, DocumentKind::Messaging];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Messaging => "mqtt",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Network => "network.json",
            Self::Messaging => "mqtt.json",
        }
    }

    /// Key holding the secret that status views must not echo back.
    pub fn secret_key(self) -> &'static str {
        match self {
            Self::Network => "wifiPass",
            Self::Messaging => "clientPass",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkProfile {
    pub address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Addr>,
    pub dhcp_enabled: bool,
    pub network_name: String,
    pub network_secret: String,
    pub configured: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagingProfile {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub client_name: String,
    pub client_secret: String,
    pub topic_root: String,
    pub publish_interval_secs: u16,
    pub configured: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NetworkDocument {
    ip: String,
    gateway: String,
    dns: String,
    subnet: String,
    #[serde(deserialize_with = "flag")]
    dhcp: bool,
    ssid: String,
    #[serde(rename = "wifiPass")]
    wifi_pass: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessagingDocument {
    broker: String,
    #[serde(deserialize_with = "number")]
    port: Option<u16>,
    #[serde(rename = "clientId")]
    client_id: String,
    client: String,
    #[serde(rename = "clientPass")]
    client_pass: String,
    topic: String,
    #[serde(deserialize_with = "number")]
    interval: Option<u16>,
}

impl NetworkProfile {
    pub fn from_document(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let doc: NetworkDocument = serde_json::from_slice(raw)?;
        let network_name = doc.ssid.trim().to_string();

        Ok(Self {
            address: parse_address(&doc.ip),
            gateway: parse_address(&doc.gateway),
            dns: parse_address(&doc.dns),
            subnet: parse_address(&doc.subnet),
            dhcp_enabled: doc.dhcp,
            configured: !network_name.is_empty(),
            network_name,
            network_secret: doc.wifi_pass,
        })
    }
}

impl MessagingProfile {
    pub fn from_document(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let doc: MessagingDocument = serde_json::from_slice(raw)?;
        let broker_host = doc.broker.trim().to_string();

        Ok(Self {
            configured: !broker_host.is_empty(),
            broker_host,
            broker_port: doc.port.filter(|port| *port != 0).unwrap_or(DEFAULT_BROKER_PORT),
            client_id: doc.client_id,
            client_name: doc.client,
            client_secret: doc.client_pass,
            topic_root: doc.topic.trim().trim_end_matches('/').to_string(),
            publish_interval_secs: doc.interval.unwrap_or(0),
        })
    }
}

fn parse_address(raw: &str) -> Option<Ipv4Addr> {
    raw.trim().parse().ok()
}

/// Accepts `true`/`false`, `0`/`1`, `"1"`/`"0"` and `null` for boolean document fields.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(i64),
        Text(String),
        Null(()),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Number(value) => value != 0,
        Flag::Text(value) => matches!(value.trim(), "1" | "true" | "on"),
        Flag::Null(()) => false,
    })
}

/// Accepts JSON numbers as well as the numeric strings the configuration form posts.
fn number<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Integer(u64),
        Text(String),
        Null(()),
    }

    Ok(match Number::deserialize(deserializer)? {
        Number::Integer(value) => u16::try_from(value).ok(),
        Number::Text(value) => value.trim().parse().ok(),
        Number::Null(()) => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointIdentity {
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub ssid: String,
    pub password: String,
}

impl Default for AccessPointIdentity {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(192, 168, 1, 10),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            subnet: Ipv4Addr::new(255, 255, 255, 0),
            ssid: "DWEB08".to_string(),
            password: "unilojasmille".to_string(),
        }
    }
}

/// Timing and retry knobs. Missing keys in an override document keep their
/// defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    pub window_ms: u64,
    pub link_max_windows: u32,
    pub session_max_windows: u32,
    pub link_check_interval_ms: u64,
    pub session_check_interval_ms: u64,
    pub reset_settle_ms: u64,
    pub input_poll_interval_ms: u64,
    pub restart_delay_ms: u64,
    pub max_inbound_payload_bytes: usize,
    pub counter_layout: CounterLayout,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            window_ms: 10_000,
            link_max_windows: 10,
            session_max_windows: 11,
            link_check_interval_ms: 1_000,
            session_check_interval_ms: 1_000,
            reset_settle_ms: 5_000,
            input_poll_interval_ms: 50,
            restart_delay_ms: 1_000,
            max_inbound_payload_bytes: 1_024,
            counter_layout: CounterLayout::Wide,
        }
    }
}

impl SupervisorConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_slice(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(10, 5_000);
        self.window_ms = self.window_ms.max(self.poll_interval_ms);
        self.link_max_windows = self.link_max_windows.max(1);
        self.session_max_windows = self.session_max_windows.max(1);
        self.link_check_interval_ms = self.link_check_interval_ms.max(self.poll_interval_ms);
        self.session_check_interval_ms = self.session_check_interval_ms.max(100);
        self.input_poll_interval_ms = self.input_poll_interval_ms.clamp(1, 1_000);
    }
}
