//! Blocking primitives supplied by the scheduler the driver runs under.
//!
//! The driver needs three counting signals and three gates. It creates them once, in
//! [`CdcDriver::init`](crate::CdcDriver::init), through a [`Kernel`]. On a hosted target the
//! `std` feature provides [`HostKernel`](crate::hosted::HostKernel); on bare metal, implement
//! these traits on top of the RTOS in use.

use core::fmt;

/// Relative timeout of a blocking call, in scheduler ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timeout {
    /// Return immediately if the call can't be satisfied.
    NoWait,

    /// Wait at most this many ticks.
    Ticks(u32),

    /// Wait until the call is satisfied.
    Forever,
}

impl Timeout {
    /// Converts a tick count, mapping 0 to [`Timeout::NoWait`].
    pub const fn ticks(ticks: u32) -> Self {
        if ticks == 0 {
            Timeout::NoWait
        } else {
            Timeout::Ticks(ticks)
        }
    }
}

/// A counting wakeup.
///
/// Each `post` is recorded even when nobody waits, and each successful `pend` consumes exactly
/// one post.
pub trait Signal {
    /// Records one event and wakes a waiter, if any. Must not block: this is called from
    /// interrupt context.
    fn post(&self);

    /// Consumes one recorded event, waiting up to `timeout` for one to arrive. Returns `false`
    /// if the timeout expired first.
    fn pend(&self, timeout: Timeout) -> bool;
}

/// A mutual-exclusion token. At most one holder of the guard exists at any time.
pub trait Gate {
    type Guard<'a>
    where
        Self: 'a;

    /// Blocks until the gate is free, then holds it until the guard is dropped.
    fn enter(&self) -> Self::Guard<'_>;
}

/// Factory for the primitives the driver needs.
pub trait Kernel {
    type Signal: Signal;
    type Gate: Gate;

    /// Creates a signal with no recorded events.
    fn signal(&self) -> Result<Self::Signal, KernelError>;

    /// Creates a gate nobody holds.
    fn gate(&self) -> Result<Self::Gate, KernelError>;
}

/// Why a kernel primitive couldn't be created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KernelError {
    /// The kernel ran out of objects or heap.
    OutOfMemory,

    /// The kernel doesn't provide this primitive.
    Unsupported,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => f.write_str("out of kernel objects"),
            KernelError::Unsupported => f.write_str("primitive not supported"),
        }
    }
}
