//! Interrupt-to-task handoff. Producers may run in interrupt context, so both
//! types only touch a single atomic.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Level-style request that is consumed at most once per assertion.
#[derive(Debug, Default)]
pub struct SignalLatch {
    raised: AtomicBool,
}

impl SignalLatch {
    pub const fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
        }
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Returns `true` once per assertion and clears the latch.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }
}

/// Edge counter drained by a single consumer.
#[derive(Debug, Default)]
pub struct PulseCounter {
    pending: AtomicU32,
}

impl PulseCounter {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
        }
    }

    pub fn record(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn drain(&self) -> u32 {
        self.pending.swap(0, Ordering::AcqRel)
    }
}
