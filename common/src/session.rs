use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use log::{info, warn};

use crate::{
    config::{MessagingProfile, SupervisorConfig},
    error::SessionError,
    network::NetworkStatus,
    nvram::ByteStore,
    retry::{retry_windows, Clock, Restart, RetryOutcome, RetryPolicy},
    store::{ConfigStore, DocumentStorage},
    telemetry::TelemetryPublisher,
    topics::{InboundRoute, TopicSet},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl From<&MessagingProfile> for SessionOptions {
    fn from(profile: &MessagingProfile) -> Self {
        Self {
            host: profile.broker_host.clone(),
            port: profile.broker_port,
            client_id: profile.client_id.clone(),
            username: profile.client_name.clone(),
            password: profile.client_secret.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Message-bus client seen by the supervisor.
///
/// Implementations deliver inbound publishes as [`InboundMessage`]s on the
/// channel they were built with; the supervisor never reads from the client.
pub trait BrokerSession: Send {
    /// Issues a connect without waiting for the broker's acknowledgement.
    fn connect(&mut self, options: &SessionOptions) -> Result<(), SessionError>;
    fn is_connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError>;
}

/// The one session of the device, shared by the supervisor and the publisher.
pub struct SharedSession<C> {
    inner: Arc<Mutex<C>>,
}

impl<C> Clone for SharedSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> SharedSession<C> {
    pub fn new(session: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, C> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Connected { attempts: u32 },
    Restarting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Patched { updated: usize },
    Published,
    Ignored,
    Rejected,
}

pub struct SessionSupervisor<B, S, C> {
    session: SharedSession<C>,
    options: SessionOptions,
    topics: TopicSet,
    store: Arc<ConfigStore<S>>,
    telemetry: Arc<TelemetryPublisher<B, S, C>>,
    network: NetworkStatus,
    clock: Arc<dyn Clock>,
    restart: Arc<dyn Restart>,
    config: SupervisorConfig,
}

impl<B, S, C> SessionSupervisor<B, S, C>
where
    B: ByteStore,
    S: DocumentStorage,
    C: BrokerSession,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SharedSession<C>,
        profile: &MessagingProfile,
        store: Arc<ConfigStore<S>>,
        telemetry: Arc<TelemetryPublisher<B, S, C>>,
        network: NetworkStatus,
        clock: Arc<dyn Clock>,
        restart: Arc<dyn Restart>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            session,
            options: SessionOptions::from(profile),
            topics: TopicSet::new(&profile.topic_root),
            store,
            telemetry,
            network,
            clock,
            restart,
            config,
        }
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn connect(&self) -> SessionOutcome {
        info!(
            "connecting to broker {}:{} as `{}`",
            self.options.host, self.options.port, self.options.client_id
        );

        let outcome = retry_windows(
            self.policy(),
            self.clock.as_ref(),
            |attempt| {
                if attempt > 1 {
                    warn!("broker did not answer; connect attempt {attempt}");
                }
                if let Err(err) = self.session.lock().connect(&self.options) {
                    warn!("connect attempt {attempt} failed: {err}");
                }
            },
            || self.session.lock().is_connected(),
        );

        let attempts = match outcome {
            RetryOutcome::Ready { attempts } => attempts,
            RetryOutcome::Exhausted { attempts } => {
                warn!("broker unreachable after {attempts} connect attempts; restarting");
                self.restart.restart("broker session could not be established");
                return SessionOutcome::Restarting;
            }
        };

        {
            let mut session = self.session.lock();
            for topic in self.topics.all() {
                if let Err(err) = session.subscribe(topic) {
                    warn!("failed to subscribe to `{topic}`: {err}");
                }
            }
        }
        info!(
            "session established after {attempts} attempt(s); subscribed under `{}`",
            self.topics.root()
        );

        self.telemetry.publish_snapshot();
        SessionOutcome::Connected { attempts }
    }

    pub fn handle_inbound(&self, message: &InboundMessage) -> InboundOutcome {
        if message.payload.len() > self.config.max_inbound_payload_bytes {
            warn!(
                "dropping {}-byte payload on `{}` (limit {})",
                message.payload.len(),
                message.topic,
                self.config.max_inbound_payload_bytes
            );
            return InboundOutcome::Rejected;
        }

        match self.topics.route(&message.topic) {
            Some(InboundRoute::Patch(kind)) => {
                match self.store.merge_patch(kind, &message.payload) {
                    Ok(updated) => InboundOutcome::Patched { updated },
                    Err(err) => {
                        warn!("rejected {} patch: {err}", kind.as_str());
                        InboundOutcome::Rejected
                    }
                }
            }
            Some(InboundRoute::PublishTelemetry) => {
                self.telemetry.publish_snapshot();
                InboundOutcome::Published
            }
            None => InboundOutcome::Ignored,
        }
    }

    /// Reconnects when the managed network is up but the session is not.
    pub fn supervise_once(&self) -> Option<SessionOutcome> {
        if !self.network.is_managed_up() || self.session.lock().is_connected() {
            return None;
        }
        warn!("broker session lost; reconnecting");
        Some(self.connect())
    }

    pub fn run_supervision(&self) {
        let interval = Duration::from_millis(self.config.session_check_interval_ms);
        loop {
            if self.supervise_once() == Some(SessionOutcome::Restarting) {
                return;
            }
            self.clock.sleep(interval);
        }
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            poll_interval_ms: self.config.poll_interval_ms,
            window_ms: self.config.window_ms,
            max_windows: self.config.session_max_windows,
        }
    }
}
