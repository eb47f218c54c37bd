use std::{sync::Arc, time::Duration};

use log::{info, warn};

use crate::{
    error::NvramError,
    nvram::{ByteStore, NvBytes},
    retry::{Clock, Restart},
    signal::SignalLatch,
};

pub const RESET_FLAG_SLOT: usize = 1;

/// Persistent "force access point on next boot" byte.
pub struct ResetFlag<B> {
    bytes: NvBytes<B>,
}

impl<B> Clone for ResetFlag<B> {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
        }
    }
}

impl<B: ByteStore> ResetFlag<B> {
    pub fn new(bytes: NvBytes<B>) -> Self {
        Self { bytes }
    }

    pub fn is_armed(&self) -> bool {
        self.bytes.read_byte(RESET_FLAG_SLOT) != 0
    }

    pub fn arm(&self) -> Result<(), NvramError> {
        let mut store = self.bytes.lock();
        store.write_byte(RESET_FLAG_SLOT, 1)?;
        store.commit()
    }

    /// Returns whether the flag was set, clearing it in the same critical
    /// section. `Err` means the flag was set but could not be cleared.
    pub fn consume(&self) -> Result<bool, NvramError> {
        let mut store = self.bytes.lock();
        if store.read_byte(RESET_FLAG_SLOT) == 0 {
            return Ok(false);
        }
        store.write_byte(RESET_FLAG_SLOT, 0)?;
        store.commit()?;
        Ok(true)
    }
}

pub struct ResetCoordinator<B> {
    flag: ResetFlag<B>,
    signal: Arc<SignalLatch>,
    clock: Arc<dyn Clock>,
    restart: Arc<dyn Restart>,
    settle: Duration,
    poll_interval: Duration,
}

impl<B: ByteStore> ResetCoordinator<B> {
    pub fn new(
        flag: ResetFlag<B>,
        signal: Arc<SignalLatch>,
        clock: Arc<dyn Clock>,
        restart: Arc<dyn Restart>,
        settle: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            flag,
            signal,
            clock,
            restart,
            settle,
            poll_interval,
        }
    }

    /// Handles a pending assertion, if any. Returns `true` once the restart
    /// has been requested.
    pub fn poll_once(&self) -> bool {
        if !self.signal.take() {
            return false;
        }
        self.handle_assertion();
        true
    }

    pub fn handle_assertion(&self) {
        info!("reset signal asserted; access point will be forced on next boot");
        if let Err(err) = self.flag.arm() {
            warn!("failed to persist reset flag: {err}");
        }
        self.clock.sleep(self.settle);
        self.restart.restart("reset signal");
    }

    pub fn run(self) {
        loop {
            if self.poll_once() {
                return;
            }
            self.clock.sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{ManualClock, MemoryByteStore, RecordingRestart};

    fn coordinator() -> (
        ResetCoordinator<MemoryByteStore>,
        ResetFlag<MemoryByteStore>,
        Arc<SignalLatch>,
        Arc<ManualClock>,
        Arc<RecordingRestart>,
    ) {
        let flag = ResetFlag::new(NvBytes::new(MemoryByteStore::default()));
        let signal = Arc::new(SignalLatch::new());
        let clock = Arc::new(ManualClock::default());
        let restart = Arc::new(RecordingRestart::default());
        let coordinator = ResetCoordinator::new(
            flag.clone(),
            signal.clone(),
            clock.clone(),
            restart.clone(),
            Duration::from_secs(5),
            Duration::from_millis(50),
        );
        (coordinator, flag, signal, clock, restart)
    }

    #[test]
    fn idle_poll_does_nothing() {
        let (coordinator, flag, _, _, restart) = coordinator();

        assert!(!coordinator.poll_once());
        assert!(!flag.is_armed());
        assert_eq!(restart.count(), 0);
    }

    #[test]
    fn assertion_arms_flag_settles_then_restarts() {
        let (coordinator, flag, signal, clock, restart) = coordinator();
        signal.raise();

        assert!(coordinator.poll_once());
        assert!(flag.is_armed());
        assert_eq!(clock.now_ms(), 5_000);
        assert_eq!(restart.count(), 1);
        assert_eq!(restart.last_reason().as_deref(), Some("reset signal"));
    }

    #[test]
    fn run_returns_after_restart_request() {
        let (coordinator, _, signal, clock, restart) = coordinator();
        signal.raise();

        coordinator.run();

        assert_eq!(restart.count(), 1);
        assert_eq!(clock.now_ms(), 5_000);
    }

    #[test]
    fn consume_clears_the_flag_once() {
        let (_, flag, _, _, _) = coordinator();
        flag.arm().unwrap();

        assert!(flag.consume().unwrap());
        assert!(!flag.is_armed());
        assert!(!flag.consume().unwrap());
    }
}
