//! Network identity: managed-network client or fixed local access point.
//!
//! ```text
//! Unconfigured ──reset flag──────────────▶ AccessPoint
//!      │ ──no network name──────────────▶ AccessPoint
//!      └─▶ ConnectingManaged ─▶ ConnectedManaged ─▶ Supervising
//!                 │ (10 windows)                      │ (link lost, 10 windows)
//!                 └────────────▶ restart ◀────────────┘
//! ```

use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::{AccessPointIdentity, NetworkProfile, SupervisorConfig, FALLBACK_DNS},
    error::LinkError,
    nvram::ByteStore,
    reset::ResetFlag,
    retry::{retry_windows, Clock, Restart, RetryOutcome, RetryPolicy},
    telemetry::LinkInfo,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Unconfigured,
    ConnectingManaged,
    ConnectedManaged,
    AccessPoint,
    Supervising,
}

impl LinkState {
    pub fn is_managed(self) -> bool {
        matches!(self, Self::ConnectedManaged | Self::Supervising)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub link_up: bool,
}

/// Shared view of the manager's state for the session supervisor and the
/// status endpoint.
#[derive(Debug, Clone, Default)]
pub struct NetworkStatus {
    inner: Arc<Mutex<LinkSnapshot>>,
}

impl NetworkStatus {
    pub fn snapshot(&self) -> LinkSnapshot {
        *self.lock()
    }

    pub fn state(&self) -> LinkState {
        self.lock().state
    }

    pub fn is_managed_up(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.state.is_managed() && snapshot.link_up
    }

    fn set_state(&self, state: LinkState) {
        self.lock().state = state;
    }

    fn set_link_up(&self, link_up: bool) {
        self.lock().link_up = link_up;
    }

    #[cfg(test)]
    pub(crate) fn mark_managed_up(&self) {
        self.set_state(LinkState::Supervising);
        self.set_link_up(true);
    }

    fn lock(&self) -> MutexGuard<'_, LinkSnapshot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAddressing {
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub primary_dns: Ipv4Addr,
    pub secondary_dns: Option<Ipv4Addr>,
}

impl StaticAddressing {
    pub fn from_profile(profile: &NetworkProfile) -> Result<Self, LinkError> {
        Ok(Self {
            address: profile
                .address
                .ok_or(LinkError::InvalidConfiguration("ip is required when dhcp is off"))?,
            gateway: profile.gateway.ok_or(LinkError::InvalidConfiguration(
                "gateway is required when dhcp is off",
            ))?,
            subnet: profile.subnet.ok_or(LinkError::InvalidConfiguration(
                "subnet is required when dhcp is off",
            ))?,
            primary_dns: FALLBACK_DNS,
            secondary_dns: profile.dns,
        })
    }
}

/// Radio driver seen by the manager.
pub trait WifiLink: Send {
    /// Installs fixed addressing; must be called before [`WifiLink::associate`].
    fn configure_static(&mut self, addressing: &StaticAddressing) -> Result<(), LinkError>;
    /// Starts association with a managed network without waiting for it.
    fn associate(&mut self, ssid: &str, secret: &str) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
    fn reconnect(&mut self) -> Result<(), LinkError>;
    fn start_access_point(&mut self, identity: &AccessPointIdentity) -> Result<(), LinkError>;
    fn local_address(&self) -> Option<Ipv4Addr>;
    /// Received signal strength in dBm while associated.
    fn signal_strength(&self) -> Option<i8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    AccessPoint { forced: bool },
    Managed { attempts: u32 },
    Restarting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Healthy,
    Recovered { polls: u32 },
    Restarting,
}

pub struct NetworkManager<L> {
    link: Mutex<L>,
    status: NetworkStatus,
    static_address: OnceLock<Ipv4Addr>,
    clock: Arc<dyn Clock>,
    restart: Arc<dyn Restart>,
    config: SupervisorConfig,
    identity: AccessPointIdentity,
}

impl<L: WifiLink> NetworkManager<L> {
    pub fn new(
        link: L,
        clock: Arc<dyn Clock>,
        restart: Arc<dyn Restart>,
        config: SupervisorConfig,
        identity: AccessPointIdentity,
    ) -> Self {
        Self {
            link: Mutex::new(link),
            status: NetworkStatus::default(),
            static_address: OnceLock::new(),
            clock,
            restart,
            config,
            identity,
        }
    }

    pub fn status(&self) -> NetworkStatus {
        self.status.clone()
    }

    pub fn state(&self) -> LinkState {
        self.status.state()
    }

    pub fn access_point_identity(&self) -> &AccessPointIdentity {
        &self.identity
    }

    pub fn with_link<T>(&self, f: impl FnOnce(&mut L) -> T) -> T {
        f(&mut self.lock_link())
    }

    /// Boot-time decision. The reset flag is consumed before anything else.
    pub fn boot<B: ByteStore>(
        &self,
        profile: &NetworkProfile,
        reset_flag: &ResetFlag<B>,
    ) -> BootOutcome {
        let forced = match reset_flag.consume() {
            Ok(armed) => armed,
            Err(err) => {
                warn!("reset flag was set but could not be cleared: {err}");
                true
            }
        };

        if forced {
            info!(
                "reset flag consumed; forcing access point after {}ms",
                self.config.reset_settle_ms
            );
            self.clock
                .sleep(Duration::from_millis(self.config.reset_settle_ms));
            return self.enter_access_point(true);
        }

        if !profile.configured {
            info!("network not configured; starting access point");
            return self.enter_access_point(false);
        }

        self.join_managed(profile)
    }

    fn enter_access_point(&self, forced: bool) -> BootOutcome {
        if let Err(err) = self.lock_link().start_access_point(&self.identity) {
            warn!("failed to start access point `{}`: {err}", self.identity.ssid);
        } else {
            info!(
                "access point `{}` up at {}",
                self.identity.ssid, self.identity.address
            );
        }
        self.status.set_link_up(false);
        self.status.set_state(LinkState::AccessPoint);
        BootOutcome::AccessPoint { forced }
    }

    fn join_managed(&self, profile: &NetworkProfile) -> BootOutcome {
        self.status.set_state(LinkState::ConnectingManaged);

        if !profile.dhcp_enabled {
            match StaticAddressing::from_profile(profile) {
                Ok(addressing) => {
                    if let Err(err) = self.lock_link().configure_static(&addressing) {
                        warn!("failed to apply static addressing, using dhcp: {err}");
                    } else {
                        info!(
                            "static addressing {} via {}",
                            addressing.address, addressing.gateway
                        );
                        self.static_address.get_or_init(|| addressing.address);
                    }
                }
                Err(err) => warn!("{err}; using dhcp"),
            }
        }

        info!("connecting to `{}`", profile.network_name);
        let outcome = retry_windows(
            self.link_policy(),
            self.clock.as_ref(),
            |attempt| {
                if attempt > 1 {
                    warn!("association timed out; attempt {attempt}");
                }
                if let Err(err) = self
                    .lock_link()
                    .associate(&profile.network_name, &profile.network_secret)
                {
                    warn!("association attempt {attempt} failed: {err}");
                }
            },
            || self.lock_link().is_connected(),
        );

        match outcome {
            RetryOutcome::Ready { attempts } => {
                self.status.set_link_up(true);
                self.status.set_state(LinkState::ConnectedManaged);
                info!(
                    "connected to `{}` as {:?} after {attempts} attempt(s)",
                    profile.network_name,
                    self.lock_link().local_address()
                );
                BootOutcome::Managed { attempts }
            }
            RetryOutcome::Exhausted { attempts } => {
                warn!(
                    "could not join `{}` after {attempts} attempts; restarting",
                    profile.network_name
                );
                self.restart.restart("managed network association failed");
                BootOutcome::Restarting
            }
        }
    }

    /// Address a browser should call back to: the fixed identity in
    /// access-point mode, the configured address on a static setup, else
    /// whatever the link was assigned.
    pub fn dashboard_address(&self) -> Ipv4Addr {
        match self.status.state() {
            LinkState::AccessPoint => self.identity.address,
            state if state.is_managed() => self
                .static_address
                .get()
                .copied()
                .or_else(|| self.lock_link().local_address())
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }

    /// One supervision pass: detects a lost link and drives reconnection.
    pub fn check_link(&self) -> LinkHealth {
        if self.lock_link().is_connected() {
            self.status.set_link_up(true);
            return LinkHealth::Healthy;
        }

        self.status.set_link_up(false);
        warn!("managed network connection lost; reconnecting");

        let mut polls = 0_u32;
        let outcome = retry_windows(
            self.link_policy(),
            self.clock.as_ref(),
            |window| {
                if window > 1 {
                    warn!("reconnect window {window} started");
                }
            },
            || {
                let mut link = self.lock_link();
                if link.is_connected() {
                    return true;
                }
                polls = polls.saturating_add(1);
                if let Err(err) = link.reconnect() {
                    debug!("reconnect failed: {err}");
                }
                false
            },
        );

        match outcome {
            RetryOutcome::Ready { .. } => {
                self.status.set_link_up(true);
                info!("managed network connection restored");
                LinkHealth::Recovered { polls }
            }
            RetryOutcome::Exhausted { attempts } => {
                warn!("link still down after {attempts} reconnect windows; restarting");
                self.restart.restart("managed network connection lost");
                LinkHealth::Restarting
            }
        }
    }

    /// Supervises the managed link for the process lifetime.
    pub fn run_supervision(&self) {
        self.status.set_state(LinkState::Supervising);
        let interval = Duration::from_millis(self.config.link_check_interval_ms);

        loop {
            if self.check_link() == LinkHealth::Restarting {
                return;
            }
            self.clock.sleep(interval);
        }
    }

    fn link_policy(&self) -> RetryPolicy {
        RetryPolicy {
            poll_interval_ms: self.config.poll_interval_ms,
            window_ms: self.config.window_ms,
            max_windows: self.config.link_max_windows,
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, L> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<L: WifiLink> LinkInfo for NetworkManager<L> {
    fn signal_strength(&self) -> Option<i8> {
        if self.status.state().is_managed() {
            self.lock_link().signal_strength()
        } else {
            None
        }
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        match self.status.state() {
            LinkState::AccessPoint => Some(self.identity.address),
            LinkState::ConnectedManaged | LinkState::Supervising => {
                self.lock_link().local_address()
            }
            LinkState::Unconfigured | LinkState::ConnectingManaged => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        fakes::{FakeLink, ManualClock, MemoryByteStore, RecordingRestart},
        nvram::NvBytes,
    };

    struct Harness {
        manager: NetworkManager<FakeLink>,
        flag: ResetFlag<MemoryByteStore>,
        clock: Arc<ManualClock>,
        restart: Arc<RecordingRestart>,
    }

    fn harness(link: FakeLink) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let restart = Arc::new(RecordingRestart::default());
        let manager = NetworkManager::new(
            link,
            clock.clone(),
            restart.clone(),
            SupervisorConfig::default(),
            AccessPointIdentity::default(),
        );
        Harness {
            manager,
            flag: ResetFlag::new(NvBytes::new(MemoryByteStore::default())),
            clock,
            restart,
        }
    }

    fn configured(dhcp: bool) -> NetworkProfile {
        NetworkProfile {
            address: Some(Ipv4Addr::new(192, 168, 1, 50)),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns: Some(Ipv4Addr::new(192, 168, 1, 2)),
            subnet: Some(Ipv4Addr::new(255, 255, 255, 0)),
            dhcp_enabled: dhcp,
            network_name: "plant-floor".to_string(),
            network_secret: "secret".to_string(),
            configured: true,
        }
    }

    #[test]
    fn unconfigured_profile_starts_access_point() {
        let h = harness(FakeLink::default());

        let outcome = h.manager.boot(&NetworkProfile::default(), &h.flag);

        assert_eq!(outcome, BootOutcome::AccessPoint { forced: false });
        assert_eq!(h.manager.state(), LinkState::AccessPoint);
        assert!(!h.manager.status().is_managed_up());
        h.manager.with_link(|link| {
            assert_eq!(link.access_point, Some(AccessPointIdentity::default()));
            assert_eq!(link.associations, 0);
        });
        assert_eq!(
            h.manager.local_address(),
            Some(Ipv4Addr::new(192, 168, 1, 10))
        );
    }

    #[test]
    fn reset_flag_forces_access_point_once() {
        let h = harness(FakeLink::connecting_on(1));
        h.flag.arm().unwrap();

        let first = h.manager.boot(&configured(true), &h.flag);

        assert_eq!(first, BootOutcome::AccessPoint { forced: true });
        assert!(!h.flag.is_armed());
        assert_eq!(h.clock.now_ms(), 5_000);
        h.manager.with_link(|link| assert_eq!(link.associations, 0));

        let second = harness(FakeLink::connecting_on(1));
        let outcome = second.manager.boot(&configured(true), &h.flag);
        assert_eq!(outcome, BootOutcome::Managed { attempts: 1 });
    }

    #[test]
    fn static_addressing_is_applied_before_association() {
        let h = harness(FakeLink::connecting_on(3));

        let outcome = h.manager.boot(&configured(false), &h.flag);

        assert_eq!(outcome, BootOutcome::Managed { attempts: 3 });
        assert_eq!(h.manager.state(), LinkState::ConnectedManaged);
        assert!(h.manager.status().is_managed_up());
        h.manager.with_link(|link| {
            assert_eq!(
                link.static_addressing,
                Some(StaticAddressing {
                    address: Ipv4Addr::new(192, 168, 1, 50),
                    gateway: Ipv4Addr::new(192, 168, 1, 1),
                    subnet: Ipv4Addr::new(255, 255, 255, 0),
                    primary_dns: FALLBACK_DNS,
                    secondary_dns: Some(Ipv4Addr::new(192, 168, 1, 2)),
                })
            );
            assert!(link.static_before_association);
            assert_eq!(link.last_ssid.as_deref(), Some("plant-floor"));
        });
    }

    #[test]
    fn dashboard_address_follows_the_network_identity() {
        let access_point = harness(FakeLink::default());
        access_point
            .manager
            .boot(&NetworkProfile::default(), &access_point.flag);
        assert_eq!(
            access_point.manager.dashboard_address(),
            Ipv4Addr::new(192, 168, 1, 10)
        );

        let fixed = harness(FakeLink::connecting_on(1));
        fixed.manager.boot(&configured(false), &fixed.flag);
        assert_eq!(
            fixed.manager.dashboard_address(),
            Ipv4Addr::new(192, 168, 1, 50)
        );

        let leased = harness(FakeLink::connecting_on(1));
        leased.manager.boot(&configured(true), &leased.flag);
        assert_eq!(
            leased.manager.dashboard_address(),
            Ipv4Addr::new(10, 0, 0, 40)
        );
    }

    #[test]
    fn dashboard_address_uses_the_lease_when_static_setup_was_incomplete() {
        let h = harness(FakeLink::connecting_on(1));
        let mut profile = configured(false);
        profile.subnet = None;
        h.manager.boot(&profile, &h.flag);

        assert_eq!(h.manager.dashboard_address(), Ipv4Addr::new(10, 0, 0, 40));
    }

    #[test]
    fn dhcp_profile_skips_static_addressing() {
        let h = harness(FakeLink::connecting_on(1));

        h.manager.boot(&configured(true), &h.flag);

        h.manager
            .with_link(|link| assert_eq!(link.static_addressing, None));
    }

    #[test]
    fn incomplete_static_profile_falls_back_to_dhcp() {
        let h = harness(FakeLink::connecting_on(1));
        let mut profile = configured(false);
        profile.gateway = None;

        let outcome = h.manager.boot(&profile, &h.flag);

        assert_eq!(outcome, BootOutcome::Managed { attempts: 1 });
        h.manager
            .with_link(|link| assert_eq!(link.static_addressing, None));
    }

    #[test]
    fn association_gives_up_after_ten_windows_and_restarts() {
        let h = harness(FakeLink::default());

        let outcome = h.manager.boot(&configured(true), &h.flag);

        assert_eq!(outcome, BootOutcome::Restarting);
        assert_eq!(h.restart.count(), 1);
        assert_eq!(h.clock.now_ms(), 100_000);
        h.manager.with_link(|link| assert_eq!(link.associations, 10));
    }

    #[test]
    fn healthy_link_needs_no_reconnect() {
        let h = harness(FakeLink::connecting_on(1));
        h.manager.boot(&configured(true), &h.flag);

        assert_eq!(h.manager.check_link(), LinkHealth::Healthy);
        h.manager.with_link(|link| assert_eq!(link.reconnects, 0));
    }

    #[test]
    fn lost_link_is_nudged_every_poll_until_it_returns() {
        let h = harness(FakeLink::connecting_on(1));
        h.manager.boot(&configured(true), &h.flag);
        h.manager.with_link(|link| link.drop_link(4));

        let health = h.manager.check_link();

        assert_eq!(health, LinkHealth::Recovered { polls: 4 });
        assert!(h.manager.status().is_managed_up());
        assert_eq!(h.restart.count(), 0);
    }

    #[test]
    fn link_that_never_returns_restarts_the_device() {
        let h = harness(FakeLink::connecting_on(1));
        h.manager.boot(&configured(true), &h.flag);
        let booted_at = h.clock.now_ms();
        h.manager.with_link(|link| link.drop_link(u32::MAX));

        h.manager.run_supervision();

        assert_eq!(h.restart.count(), 1);
        assert_eq!(
            h.restart.last_reason().as_deref(),
            Some("managed network connection lost")
        );
        assert_eq!(h.clock.now_ms() - booted_at, 100_000);
        assert_eq!(h.manager.state(), LinkState::Supervising);
        assert!(!h.manager.status().is_managed_up());
    }
}
