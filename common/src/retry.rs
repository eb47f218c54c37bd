use std::{
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

pub trait Clock: Send + Sync {
    /// Milliseconds since boot.
    fn now_ms(&self) -> u64;
    fn sleep(&self, duration: Duration);
}

/// Terminal fallback of every exhausted retry loop.
///
/// Device implementations never return. Test doubles record the call and
/// return, and callers stop their loop after invoking it.
pub trait Restart: Send + Sync {
    fn restart(&self, reason: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub poll_interval_ms: u64,
    pub window_ms: u64,
    pub max_windows: u32,
}

impl RetryPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Ready { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl RetryOutcome {
    pub fn attempts(self) -> u32 {
        match self {
            Self::Ready { attempts } | Self::Exhausted { attempts } => attempts,
        }
    }
}

/// Windowed polling retry.
///
/// Each window starts with `attempt`, then polls `ready` every
/// `poll_interval_ms` until `window_ms` elapses. After `max_windows` windows
/// without success the loop gives up and the caller escalates.
pub fn retry_windows(
    policy: RetryPolicy,
    clock: &dyn Clock,
    mut attempt: impl FnMut(u32),
    mut ready: impl FnMut() -> bool,
) -> RetryOutcome {
    let mut attempts = 0_u32;
    let mut timed_out = 0_u32;

    loop {
        attempts = attempts.saturating_add(1);
        attempt(attempts);

        let window_start = clock.now_ms();
        loop {
            if ready() {
                return RetryOutcome::Ready { attempts };
            }
            if clock.now_ms().saturating_sub(window_start) >= policy.window_ms {
                break;
            }
            clock.sleep(policy.poll_interval());
        }

        timed_out = timed_out.saturating_add(1);
        if timed_out >= policy.max_windows {
            return RetryOutcome::Exhausted { attempts };
        }
    }
}
