//! Resubmission gate
//!
//! A binary semaphore: one credit at most. The transfer path releases it on
//! entry to a completion and takes it back (blocking) before resubmitting;
//! a consumer that must not race a resubmission takes it for the duration of
//! its exclusive work and releases it afterwards.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct GateInner {
    available: Mutex<bool>,
    cond: Condvar,
}

/// Single-credit exclusivity signal
#[derive(Debug, Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    /// Create a gate with its one credit available
    pub fn new() -> Self {
        let gate = Self {
            inner: Arc::new(GateInner::default()),
        };
        gate.release();
        gate
    }

    /// Give the credit back; releasing an already-available gate is a no-op
    pub fn release(&self) {
        let mut available = self.inner.available.lock();
        *available = true;
        self.inner.cond.notify_one();
    }

    /// Take the credit, waiting up to `wait` (`None` waits forever)
    pub fn acquire(&self, wait: Option<Duration>) -> bool {
        let mut available = self.inner.available.lock();
        match wait {
            None => {
                while !*available {
                    self.inner.cond.wait(&mut available);
                }
            }
            Some(wait) => {
                let deadline = Instant::now() + wait;
                while !*available {
                    if self
                        .inner
                        .cond
                        .wait_until(&mut available, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                if !*available {
                    return false;
                }
            }
        }
        *available = false;
        true
    }

    /// Take the credit only if it is free right now
    pub fn try_acquire(&self) -> bool {
        let mut available = self.inner.available.lock();
        std::mem::replace(&mut *available, false)
    }

    /// Acquire and get a guard that releases on drop
    pub fn exclusive(&self, wait: Option<Duration>) -> Option<GateGuard<'_>> {
        self.acquire(wait).then_some(GateGuard { gate: self })
    }

    pub fn is_available(&self) -> bool {
        *self.inner.available.lock()
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the gate's credit until dropped
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_starts_available() {
        let gate = Gate::new();
        assert!(gate.is_available());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
    }

    #[test]
    fn test_release_never_exceeds_one_credit() {
        let gate = Gate::new();
        gate.release();
        gate.release();
        assert!(gate.acquire(Some(Duration::ZERO)));
        assert!(!gate.acquire(Some(Duration::from_millis(5))));
    }

    #[test]
    fn test_acquire_times_out() {
        let gate = Gate::new();
        assert!(gate.acquire(None));
        let start = Instant::now();
        assert!(!gate.acquire(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_blocked_acquire_wakes_on_release() {
        let gate = Gate::new();
        assert!(gate.acquire(None));

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.acquire(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(20));
        gate.release();

        assert!(waiter.join().unwrap());
        assert!(!gate.is_available());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let gate = Gate::new();
        {
            let _guard = gate.exclusive(None).unwrap();
            assert!(!gate.is_available());
            assert!(gate.exclusive(Some(Duration::ZERO)).is_none());
        }
        assert!(gate.is_available());
    }
}
