//! # Scheduler Traits
//!
//! Defines the traits that scheduler implementations must implement.

use crate::{ThreadId, ExecResult};
use super::Priority;
use alloc::string::String;
use alloc::vec::Vec;

/// Thread information for scheduling
#[derive(Debug, Clone)]
pub struct SchedulableThread {
    /// Thread ID
    pub id: ThreadId,
    /// Thread this one was forked from, if any
    pub parent: Option<ThreadId>,
    /// Thread priority
    pub priority: Priority,
    /// Scheduling policy
    pub policy: SchedulingPolicy,
    /// CPU affinity mask (bit per CPU)
    pub affinity: u64,
    /// Thread name (for debugging)
    pub name: String,
}

impl SchedulableThread {
    /// Create a new schedulable thread
    pub fn new(id: ThreadId, priority: Priority) -> Self {
        Self {
            id,
            parent: None,
            priority,
            policy: SchedulingPolicy::Normal,
            affinity: u64::MAX, // All CPUs
            name: String::new(),
        }
    }

    /// Set the thread name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Record the forking parent
    pub fn forked_from(mut self, parent: ThreadId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Set the scheduling policy
    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set CPU affinity
    pub fn with_affinity(mut self, affinity: u64) -> Self {
        self.affinity = affinity;
        self
    }
}

/// The core scheduler trait
///
/// All scheduler implementations must implement this trait.
/// `pick_next`/`put_prev` follow the usual switch protocol: the host calls
/// `pick_next` whenever `needs_reschedule` is set or the running thread
/// blocked, and `put_prev` when the CPU leaves this scheduler's class.
pub trait Scheduler: Send + Sync {
    /// Get the scheduler name
    fn name(&self) -> &'static str;

    /// Get the scheduler version
    fn version(&self) -> &'static str;

    /// Initialize the scheduler
    fn init(&mut self, cpu_count: usize) -> ExecResult<()>;

    /// Pick the next thread to run on a CPU
    fn pick_next(&self, cpu: usize) -> Option<ThreadId>;

    /// Return the running thread of `cpu` to its queue without picking
    fn put_prev(&self, cpu: usize);

    /// Add a newly created thread and make it runnable
    fn add_thread(&self, thread: SchedulableThread) -> ExecResult<()>;

    /// Remove a thread that exited
    fn remove_thread(&self, id: ThreadId) -> ExecResult<()>;

    /// Mark a thread as ready
    fn thread_ready(&self, id: ThreadId) -> ExecResult<()>;

    /// Mark a thread as blocked
    fn thread_block(&self, id: ThreadId) -> ExecResult<()>;

    /// Yield the current thread (voluntary preemption)
    fn yield_thread(&self, cpu: usize);

    /// Timer tick - called periodically
    fn tick(&self, cpu: usize);

    /// Set thread priority
    fn set_priority(&self, id: ThreadId, priority: Priority) -> ExecResult<()>;

    /// Get thread priority
    fn get_priority(&self, id: ThreadId) -> Option<Priority>;

    /// Check if a reschedule is needed
    fn needs_reschedule(&self, cpu: usize) -> bool;

    /// Thread currently running on `cpu`
    fn current(&self, cpu: usize) -> Option<ThreadId>;

    /// Get scheduler statistics
    fn stats(&self) -> SchedulerStats;

    /// Set scheduling policy for a thread
    fn set_policy(&self, _id: ThreadId, _policy: SchedulingPolicy) -> ExecResult<()> {
        Err(crate::ExecError::InvalidArgument)
    }

    /// Restrict a thread to the CPUs in `affinity`
    fn set_affinity(&self, _id: ThreadId, _affinity: u64) -> ExecResult<()> {
        Err(crate::ExecError::InvalidArgument)
    }

    /// Migrate a thread to another CPU
    fn migrate_thread(&self, _id: ThreadId, _target_cpu: usize) -> ExecResult<()> {
        Err(crate::ExecError::InvalidArgument)
    }
}

/// Scheduling policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// Normal time-sharing
    #[default]
    Normal,
    /// First-in-first-out (for real-time)
    Fifo,
    /// Round-robin (for real-time)
    RoundRobin,
    /// Batch scheduling (never preempts on wakeup)
    Batch,
    /// Idle (only runs when nothing else to do)
    Idle,
    /// Deadline scheduling
    Deadline {
        /// Runtime in nanoseconds
        runtime: u64,
        /// Period in nanoseconds
        period: u64,
        /// Deadline in nanoseconds
        deadline: u64,
    },
}

impl SchedulingPolicy {
    /// Policies handled by a time-sharing (fair) scheduler
    pub fn is_fair(&self) -> bool {
        matches!(self, SchedulingPolicy::Normal | SchedulingPolicy::Batch | SchedulingPolicy::Idle)
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Total number of context switches
    pub context_switches: u64,
    /// Number of threads currently runnable
    pub runnable_threads: usize,
    /// Number of threads currently blocked
    pub blocked_threads: usize,
    /// Average wait time (nanoseconds)
    pub avg_wait_time: u64,
    /// Average run time (nanoseconds)
    pub avg_run_time: u64,
    /// Threads moved between CPUs
    pub migrations: u64,
    /// Queues currently throttled by bandwidth control
    pub throttled_queues: usize,
    /// Load per CPU (percent of capacity)
    pub cpu_load: Vec<u8>,
}

/// Load balancer trait for SMP systems
pub trait LoadBalancer: Send + Sync {
    /// Balance load across CPUs
    fn balance(&self, scheduler: &dyn Scheduler);

    /// Get load for a CPU
    fn cpu_load(&self, cpu: usize) -> u64;

    /// Suggest migration for a thread
    fn suggest_migration(&self, thread: ThreadId, current_cpu: usize) -> Option<usize>;
}
