//! # Scheduler Framework
//!
//! This module defines the scheduler FRAMEWORK, not a specific scheduler.
//! Actual scheduler implementations are provided as modules.

pub mod traits;
pub mod priority;
pub mod metrics;
pub mod host;

use crate::{ThreadId, ExecResult, ExecError};
use alloc::sync::Arc;
use spin::RwLock;

pub use traits::*;
pub use priority::*;
pub use host::{Clock, CpuNotifier, HostServices, TimerKey, TimerService};

/// Scheduler framework
///
/// This struct holds the current scheduler implementation
/// and provides a stable interface for the rest of the kernel.
pub struct SchedulerFramework {
    /// Current scheduler implementation
    scheduler: RwLock<Option<Arc<dyn Scheduler>>>,
    /// Scheduler metrics
    metrics: metrics::SchedulerMetrics,
    /// Load balancer (for SMP)
    load_balancer: RwLock<Option<Arc<dyn LoadBalancer>>>,
}

impl SchedulerFramework {
    /// Create a new scheduler framework
    pub const fn new() -> Self {
        Self {
            scheduler: RwLock::new(None),
            metrics: metrics::SchedulerMetrics::new(),
            load_balancer: RwLock::new(None),
        }
    }

    /// Set the scheduler implementation
    pub fn set_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        log::info!("Setting scheduler: {} v{}", scheduler.name(), scheduler.version());
        *self.scheduler.write() = Some(scheduler);
    }

    /// Remove the scheduler implementation
    pub fn clear_scheduler(&self) {
        *self.scheduler.write() = None;
        *self.load_balancer.write() = None;
    }

    /// Get the current scheduler
    pub fn scheduler(&self) -> Option<Arc<dyn Scheduler>> {
        self.scheduler.read().clone()
    }

    /// Set the load balancer
    pub fn set_load_balancer(&self, balancer: Arc<dyn LoadBalancer>) {
        *self.load_balancer.write() = Some(balancer);
    }

    /// Pick the next thread to run
    pub fn pick_next(&self, cpu: usize) -> Option<ThreadId> {
        let scheduler = self.scheduler.read();
        let next = scheduler.as_ref()?.pick_next(cpu);
        match next {
            Some(_) => self.metrics.record_context_switch(),
            None => self.metrics.record_idle_pick(),
        }
        next
    }

    /// Hand the running thread back to the scheduler
    pub fn put_prev(&self, cpu: usize) {
        if let Some(scheduler) = self.scheduler.read().as_ref() {
            scheduler.put_prev(cpu);
        }
    }

    /// Add a thread to the scheduler
    pub fn add_thread(&self, thread: SchedulableThread) -> ExecResult<()> {
        let scheduler = self.scheduler.read();
        scheduler.as_ref()
            .ok_or(ExecError::Internal)?
            .add_thread(thread)
    }

    /// Remove a thread from the scheduler
    pub fn remove_thread(&self, id: ThreadId) -> ExecResult<()> {
        let scheduler = self.scheduler.read();
        scheduler.as_ref()
            .ok_or(ExecError::Internal)?
            .remove_thread(id)
    }

    /// Notify that a thread is ready to run
    pub fn thread_ready(&self, id: ThreadId) -> ExecResult<()> {
        let scheduler = self.scheduler.read();
        scheduler.as_ref()
            .ok_or(ExecError::Internal)?
            .thread_ready(id)?;
        self.metrics.record_wakeup();
        Ok(())
    }

    /// Notify that a thread is blocking
    pub fn thread_block(&self, id: ThreadId) -> ExecResult<()> {
        let scheduler = self.scheduler.read();
        scheduler.as_ref()
            .ok_or(ExecError::Internal)?
            .thread_block(id)
    }

    /// Timer tick notification
    pub fn tick(&self, cpu: usize) {
        if let Some(scheduler) = self.scheduler.read().as_ref() {
            scheduler.tick(cpu);
        }
        self.metrics.record_tick();
    }

    /// Yield the current thread
    pub fn yield_current(&self, cpu: usize) {
        if let Some(scheduler) = self.scheduler.read().as_ref() {
            scheduler.yield_thread(cpu);
            self.metrics.record_yield();
        }
    }

    /// Whether `cpu` should call `pick_next` soon
    pub fn needs_reschedule(&self, cpu: usize) -> bool {
        self.scheduler
            .read()
            .as_ref()
            .map(|s| s.needs_reschedule(cpu))
            .unwrap_or(false)
    }

    /// Update thread priority
    pub fn set_priority(&self, id: ThreadId, priority: Priority) -> ExecResult<()> {
        let scheduler = self.scheduler.read();
        scheduler.as_ref()
            .ok_or(ExecError::Internal)?
            .set_priority(id, priority)
    }

    /// Move a thread to `target_cpu`
    pub fn migrate_thread(&self, id: ThreadId, target_cpu: usize) -> ExecResult<()> {
        let scheduler = self.scheduler.read();
        scheduler.as_ref()
            .ok_or(ExecError::Internal)?
            .migrate_thread(id, target_cpu)?;
        self.metrics.record_migration();
        Ok(())
    }

    /// Get scheduler metrics
    pub fn metrics(&self) -> &metrics::SchedulerMetrics {
        &self.metrics
    }

    /// Trigger load balancing
    pub fn balance_load(&self) {
        if let Some(balancer) = self.load_balancer.read().as_ref() {
            if let Some(scheduler) = self.scheduler.read().as_ref() {
                balancer.balance(scheduler.as_ref());
            }
        }
    }
}

impl Default for SchedulerFramework {
    fn default() -> Self {
        Self::new()
    }
}

/// Global scheduler framework
static FRAMEWORK: SchedulerFramework = SchedulerFramework::new();

/// Get the scheduler framework
pub fn framework() -> &'static SchedulerFramework {
    &FRAMEWORK
}
