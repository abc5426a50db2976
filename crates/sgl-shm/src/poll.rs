//! Memory polling with backoff.
//!
//! Client and server in shared-memory mode only communicate through memory, so every
//! wait is a poll. Polls spin briefly, then yield, then sleep in growing steps capped
//! at [`Backoff::MAX_SLEEP`].

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;
    pub const MAX_SLEEP: Duration = Duration::from_millis(1);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Waits a little longer than last time.
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let exp = (self.step - Self::YIELD_LIMIT).min(10);
            let sleep = Duration::from_micros(1u64 << exp).min(Self::MAX_SLEEP);
            std::thread::sleep(sleep);
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Polls `ready` until it returns `true` or `timeout` elapses. Returns `false` on
/// timeout. `None` waits forever.
pub fn wait_until(timeout: Option<Duration>, mut ready: impl FnMut() -> bool) -> bool {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut backoff = Backoff::new();
    loop {
        if ready() {
            return true;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        backoff.snooze();
    }
}
