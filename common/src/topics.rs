use crate::config::DocumentKind;

pub const NETWORK_SUFFIX: &str = "/network";
pub const MESSAGING_SUFFIX: &str = "/mqtt";
pub const DATA_SUFFIX: &str = "/data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRoute {
    Patch(DocumentKind),
    PublishTelemetry,
}

/// The four topics a session subscribes to, derived from the configured root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    root: String,
    network: String,
    messaging: String,
    data: String,
}

impl TopicSet {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.to_string(),
            network: format!("{root}{NETWORK_SUFFIX}"),
            messaging: format!("{root}{MESSAGING_SUFFIX}"),
            data: format!("{root}{DATA_SUFFIX}"),
        }
    }

    /// Telemetry goes out on the root topic.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn all(&self) -> [&str; 4] {
        [&self.root, &self.network, &self.messaging, &self.data]
    }

    pub fn route(&self, topic: &str) -> Option<InboundRoute> {
        if topic == self.network {
            Some(InboundRoute::Patch(DocumentKind::Network))
        } else if topic == self.messaging {
            Some(InboundRoute::Patch(DocumentKind::Messaging))
        } else if topic == self.data {
            Some(InboundRoute::PublishTelemetry)
        } else {
            None
        }
    }
}
