//! Kernel primitives for a hosted process, built on `std::sync`.
//!
//! Enabled by the `std` feature. Threads play the part of tasks; whichever thread services the
//! USB stack plays the interrupt.

use crate::kernel::{Gate, Kernel, KernelError, Signal, Timeout};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Tick length used by [`HostKernel::default`].
pub const DEFAULT_TICK: Duration = Duration::from_millis(1);

/// Creates [`HostSignal`]s and [`HostGate`]s with a fixed tick length.
#[derive(Clone, Copy, Debug)]
pub struct HostKernel {
    tick: Duration,
}

impl HostKernel {
    pub const fn new(tick: Duration) -> Self {
        Self { tick }
    }

    /// Length of one [`Timeout::Ticks`] tick.
    pub fn tick(&self) -> Duration {
        self.tick
    }
}

impl Default for HostKernel {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl Kernel for HostKernel {
    type Signal = HostSignal;
    type Gate = HostGate;

    fn signal(&self) -> Result<HostSignal, KernelError> {
        Ok(HostSignal::new(self.tick))
    }

    fn gate(&self) -> Result<HostGate, KernelError> {
        Ok(HostGate::new())
    }
}

/// Counting signal on a mutex-protected counter and a condition variable.
#[derive(Debug)]
pub struct HostSignal {
    count: Mutex<u32>,
    posted: Condvar,
    tick: Duration,
}

impl HostSignal {
    pub const fn new(tick: Duration) -> Self {
        Self {
            count: Mutex::new(0),
            posted: Condvar::new(),
            tick,
        }
    }

    /// Number of posts not yet consumed.
    pub fn pending(&self) -> u32 {
        *lock(&self.count)
    }

    fn deadline(&self, ticks: u32) -> Option<Instant> {
        self.tick
            .checked_mul(ticks)
            .and_then(|wait| Instant::now().checked_add(wait))
    }
}

impl Signal for HostSignal {
    fn post(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_add(1);
        self.posted.notify_one();
    }

    fn pend(&self, timeout: Timeout) -> bool {
        let mut count = lock(&self.count);

        let deadline = match timeout {
            Timeout::NoWait => Some(Instant::now()),
            // A wait too long to represent is as good as forever.
            Timeout::Ticks(ticks) => self.deadline(ticks),
            Timeout::Forever => None,
        };

        while *count == 0 {
            match deadline {
                None => {
                    count = self
                        .posted
                        .wait(count)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    count = self
                        .posted
                        .wait_timeout(count, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        *count -= 1;
        true
    }
}

/// Gate on a `std` mutex.
#[derive(Debug, Default)]
pub struct HostGate {
    lock: Mutex<()>,
}

impl HostGate {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }
}

impl Gate for HostGate {
    type Guard<'a> = MutexGuard<'a, ()>;

    fn enter(&self) -> MutexGuard<'_, ()> {
        lock(&self.lock)
    }
}

// A panicking holder doesn't leave the counter or the token inconsistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
