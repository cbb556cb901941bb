//! # Host Services
//!
//! Services a scheduler consumes from the surrounding kernel.
//!
//! Schedulers never read hardware clocks, program timers or send IPIs
//! themselves. The host hands them these three narrow interfaces instead,
//! which also lets tests drive a scheduler with a simulated clock.

use alloc::sync::Arc;
use core::fmt;

/// Monotonic clock source
pub trait Clock: Send + Sync {
    /// Wall-clock time in nanoseconds as seen by `cpu`
    fn now(&self, cpu: usize) -> u64;

    /// Task-execution clock in nanoseconds (may exclude IRQ or steal time)
    fn task_now(&self, cpu: usize) -> u64 {
        self.now(cpu)
    }
}

/// Opaque key naming one scheduler-owned timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey(pub u64);

/// One-shot timer primitive
///
/// When an armed timer expires the host calls back into the scheduler
/// that armed it, passing the same key.
pub trait TimerService: Send + Sync {
    /// Arm (or re-arm) `key` to fire at absolute time `expires_ns`
    fn arm(&self, key: TimerKey, expires_ns: u64);

    /// Cancel `key`; returns true if it was armed
    fn cancel(&self, key: TimerKey) -> bool;

    /// Nanoseconds until `key` fires, or `None` when it is not armed
    fn remaining(&self, key: TimerKey) -> Option<u64>;
}

/// Cross-CPU notification primitive
pub trait CpuNotifier: Send + Sync {
    /// Ask `cpu` to re-evaluate its running task soon
    fn resched(&self, cpu: usize);

    /// Ask idle `cpu` to run a balance pass on behalf of all idle CPUs
    fn kick_idle_balance(&self, _cpu: usize) {}

    /// Ask `cpu` to run the forced-migration callback of its scheduler
    fn request_active_balance(&self, _cpu: usize) {}
}

/// Bundle of the host services a scheduler holds on to
#[derive(Clone)]
pub struct HostServices {
    /// Clock source
    pub clock: Arc<dyn Clock>,
    /// Timer primitive
    pub timers: Arc<dyn TimerService>,
    /// Cross-CPU notification
    pub notifier: Arc<dyn CpuNotifier>,
}

impl HostServices {
    /// Create a new service bundle
    pub fn new(
        clock: Arc<dyn Clock>,
        timers: Arc<dyn TimerService>,
        notifier: Arc<dyn CpuNotifier>,
    ) -> Self {
        Self { clock, timers, notifier }
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices").finish_non_exhaustive()
    }
}
