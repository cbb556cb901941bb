//! # Task Metadata
//!
//! What the fair scheduler knows about a task outside of its run queue:
//! identity, policy, priority, affinity, where it lives and wakeup
//! history. Fields are atomics so placement can read them without a
//! run-queue lock.

use crate::entity::GroupId;
use crate::topology::CpuMask;
use alloc::string::String;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use helix_execution::scheduler::{Priority, SchedulingPolicy};
use helix_execution::ThreadId;
use spin::Mutex;

bitflags! {
    /// Enqueue flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnqueueFlags: u32 {
        /// Task is waking up from sleep
        const WAKEUP = 1 << 0;
        /// Vruntime was normalized while waking
        const WAKING = 1 << 1;
    }
}

bitflags! {
    /// Dequeue flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DequeueFlags: u32 {
        /// Task goes to sleep and keeps its absolute vruntime
        const SLEEP = 1 << 0;
    }
}

bitflags! {
    /// Wakeup flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WakeFlags: u32 {
        /// Waker goes to sleep right after the wakeup
        const SYNC = 1 << 0;
        /// Child being woken for the first time
        const FORK = 1 << 1;
        /// Woken task changed CPU
        const MIGRATED = 1 << 2;
    }
}

/// Lifecycle state of a task as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Forked, not woken yet
    New = 0,
    /// Queued or running
    Runnable = 1,
    /// Blocked
    Sleeping = 2,
    /// Being woken, placement in progress
    Waking = 3,
    /// Detached from one run queue, not attached to another yet
    Migrating = 4,
    /// Handed to another scheduling class
    Foreign = 5,
    /// Exited
    Dead = 6,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::New,
            1 => TaskState::Runnable,
            2 => TaskState::Sleeping,
            3 => TaskState::Waking,
            4 => TaskState::Migrating,
            5 => TaskState::Foreign,
            _ => TaskState::Dead,
        }
    }
}

/// Fair-class policy of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TaskPolicy {
    /// Time sharing
    #[default]
    Normal = 0,
    /// CPU-bound, never preempts on wakeup
    Batch = 1,
    /// Runs only when nothing else wants the CPU
    Idle = 2,
}

impl TaskPolicy {
    /// Map a framework policy, `None` for non-fair policies
    pub fn from_policy(policy: SchedulingPolicy) -> Option<Self> {
        match policy {
            SchedulingPolicy::Normal => Some(TaskPolicy::Normal),
            SchedulingPolicy::Batch => Some(TaskPolicy::Batch),
            SchedulingPolicy::Idle => Some(TaskPolicy::Idle),
            _ => None,
        }
    }

    /// Framework policy
    pub fn to_policy(self) -> SchedulingPolicy {
        match self {
            TaskPolicy::Normal => SchedulingPolicy::Normal,
            TaskPolicy::Batch => SchedulingPolicy::Batch,
            TaskPolicy::Idle => SchedulingPolicy::Idle,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskPolicy::Batch,
            2 => TaskPolicy::Idle,
            _ => TaskPolicy::Normal,
        }
    }
}

/// Who a task wakes and how often that changes
#[derive(Debug, Clone, Copy, Default)]
pub struct WakeeStats {
    /// Last task this one woke
    pub last_wakee: Option<ThreadId>,
    /// Decayed count of wakee switches
    pub wakee_flips: u32,
    /// Tick when `wakee_flips` was last halved
    pub wakee_flip_decay_ts: u64,
}

impl WakeeStats {
    /// Record that the owner woke `wakee` at tick `now`
    ///
    /// Flips halve once per second of ticks.
    pub fn record(&mut self, wakee: ThreadId, now: u64, hz: u64) {
        if now > self.wakee_flip_decay_ts + hz {
            self.wakee_flips >>= 1;
            self.wakee_flip_decay_ts = now;
        }
        if self.last_wakee != Some(wakee) {
            self.last_wakee = Some(wakee);
            self.wakee_flips += 1;
        }
    }
}

/// Per-node memory fault counts of a task, fed by the host
#[derive(Debug, Clone, Default)]
pub struct NumaFaults {
    /// Decayed fault count per node
    pub faults: alloc::vec::Vec<u64>,
    /// Node with the highest fault share, if any
    pub preferred_node: Option<usize>,
    /// Current scan period in ms
    pub scan_period_ms: u64,
}

/// Scheduler-side description of a task
#[derive(Debug)]
pub struct TaskRef {
    /// Task id
    pub id: ThreadId,
    /// Name, for diagnostics
    pub name: String,
    cpu: AtomicUsize,
    state: AtomicU8,
    policy: AtomicU8,
    static_prio: AtomicU8,
    affinity: AtomicU64,
    nr_cpus_allowed: AtomicU32,
    group: AtomicU64,
    /// Wakee history
    pub wakee: Mutex<WakeeStats>,
    /// Memory placement statistics
    pub numa: Mutex<NumaFaults>,
}

impl TaskRef {
    /// Create a task record
    pub fn new(
        id: ThreadId,
        name: String,
        policy: TaskPolicy,
        priority: Priority,
        affinity: CpuMask,
        group: GroupId,
        cpu: usize,
    ) -> Self {
        Self {
            id,
            name,
            cpu: AtomicUsize::new(cpu),
            state: AtomicU8::new(TaskState::New as u8),
            policy: AtomicU8::new(policy as u8),
            static_prio: AtomicU8::new(priority.static_priority()),
            affinity: AtomicU64::new(affinity.bits()),
            nr_cpus_allowed: AtomicU32::new(affinity.weight()),
            group: AtomicU64::new(group),
            wakee: Mutex::new(WakeeStats::default()),
            numa: Mutex::new(NumaFaults::default()),
        }
    }

    /// CPU whose run queue owns the task's entity
    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    /// Record a CPU change
    #[inline]
    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Set the state
    #[inline]
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; fails if the state was not `from`
    pub fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Fair-class policy
    #[inline]
    pub fn policy(&self) -> TaskPolicy {
        TaskPolicy::from_u8(self.policy.load(Ordering::Relaxed))
    }

    /// Change the policy
    pub fn set_policy(&self, policy: TaskPolicy) {
        self.policy.store(policy as u8, Ordering::Relaxed);
    }

    /// Static priority
    pub fn priority(&self) -> Priority {
        Priority::new(self.static_prio.load(Ordering::Relaxed))
    }

    /// Change the static priority
    pub fn set_priority(&self, priority: Priority) {
        self.static_prio.store(priority.static_priority(), Ordering::Relaxed);
    }

    /// CPUs the task may run on
    #[inline]
    pub fn affinity(&self) -> CpuMask {
        CpuMask::from_bits(self.affinity.load(Ordering::Acquire))
    }

    /// Number of CPUs in the affinity mask
    #[inline]
    pub fn nr_cpus_allowed(&self) -> u32 {
        self.nr_cpus_allowed.load(Ordering::Relaxed)
    }

    /// Whether the task may run on `cpu`
    #[inline]
    pub fn allows(&self, cpu: usize) -> bool {
        self.affinity().contains(cpu)
    }

    /// Replace the affinity mask
    pub fn set_affinity(&self, mask: CpuMask) {
        self.affinity.store(mask.bits(), Ordering::Release);
        self.nr_cpus_allowed.store(mask.weight(), Ordering::Relaxed);
    }

    /// Group the task belongs to
    #[inline]
    pub fn group(&self) -> GroupId {
        self.group.load(Ordering::Acquire)
    }

    /// Record a group move
    pub fn set_group(&self, group: GroupId) {
        self.group.store(group, Ordering::Release);
    }

    /// Weight the task's entity should carry
    pub fn weight(&self) -> u64 {
        match self.policy() {
            TaskPolicy::Idle => crate::weight::WEIGHT_IDLEPRIO,
            _ => crate::weight::LoadWeight::from_priority(self.priority()).weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskRef {
        TaskRef::new(
            ThreadId::from_raw(3),
            String::from("t"),
            TaskPolicy::Normal,
            Priority::normal(0),
            CpuMask::first(4),
            0,
            1,
        )
    }

    #[test]
    fn test_state_transition() {
        let t = task();
        assert_eq!(t.state(), TaskState::New);
        assert!(t.transition(TaskState::New, TaskState::Runnable));
        assert!(!t.transition(TaskState::Sleeping, TaskState::Waking));
        assert_eq!(t.state(), TaskState::Runnable);
    }

    #[test]
    fn test_weight_follows_policy() {
        let t = task();
        assert_eq!(t.weight(), 1024);
        t.set_priority(Priority::normal(5));
        assert_eq!(t.weight(), 335);
        t.set_policy(TaskPolicy::Idle);
        assert_eq!(t.weight(), 3);
    }

    #[test]
    fn test_affinity_count() {
        let t = task();
        assert_eq!(t.nr_cpus_allowed(), 4);
        t.set_affinity(CpuMask::single(2));
        assert_eq!(t.nr_cpus_allowed(), 1);
        assert!(t.allows(2));
        assert!(!t.allows(1));
    }

    #[test]
    fn test_wakee_flips_decay() {
        let mut w = WakeeStats::default();
        let a = ThreadId::from_raw(10);
        let b = ThreadId::from_raw(11);
        w.record(a, 0, 1000);
        w.record(b, 1, 1000);
        w.record(b, 2, 1000);
        assert_eq!(w.wakee_flips, 2);
        w.record(a, 2000, 1000);
        assert_eq!(w.wakee_flips, 2);
        assert_eq!(w.wakee_flip_decay_ts, 2000);
    }

    #[test]
    fn test_policy_mapping() {
        assert_eq!(TaskPolicy::from_policy(SchedulingPolicy::Batch), Some(TaskPolicy::Batch));
        assert_eq!(TaskPolicy::from_policy(SchedulingPolicy::Fifo), None);
        assert_eq!(TaskPolicy::Idle.to_policy(), SchedulingPolicy::Idle);
    }
}
