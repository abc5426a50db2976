//! Cross-process spinlock over one shared 32-bit word (the `LOCK` register).
//!
//! `0` is unlocked, `1` is locked. Acquire is a compare-and-swap loop with a CPU pause
//! hint between attempts; release is a release-ordered store of `0`.

use core::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::poll::Backoff;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

#[derive(Debug, Clone, Copy)]
pub struct SpinLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> SpinLock<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spins until the lock is taken. Only the server-side tests and in-process users
    /// should wait without a bound.
    pub fn lock(&self) -> SpinGuard<'a> {
        loop {
            if self.try_lock() {
                return SpinGuard { word: self.word };
            }
            while self.word.load(Ordering::Relaxed) != UNLOCKED {
                core::hint::spin_loop();
            }
        }
    }

    /// Like [`SpinLock::lock`] but gives up after `timeout`, backing off to yields and
    /// short sleeps while the holder keeps the lock.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<SpinGuard<'a>> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        loop {
            if self.try_lock() {
                return Some(SpinGuard { word: self.word });
            }
            if Instant::now() >= deadline {
                return None;
            }
            backoff.snooze();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Forcibly releases the lock, e.g. when a server resets a region whose previous
    /// holder died.
    pub fn force_unlock(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}

/// Releases the lock on drop.
#[derive(Debug)]
pub struct SpinGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let word = AtomicU32::new(0);
        let lock = SpinLock::new(&word);
        {
            let _g = lock.lock();
            assert!(lock.is_locked());
            assert!(!lock.try_lock());
        }
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
    }

    #[test]
    fn try_lock_for_times_out_while_held() {
        let word = AtomicU32::new(0);
        let lock = SpinLock::new(&word);
        let _held = lock.lock();
        assert!(lock.try_lock_for(Duration::from_millis(10)).is_none());
    }
}
