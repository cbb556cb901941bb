//! # Fair Queues
//!
//! One queue per (group, CPU). The running entity is checked out of the
//! timeline while it runs and is only tracked through `curr`.

use crate::entity::{CfsRqId, EntityId};
use crate::group::TaskGroup;
use crate::pelt::{RemovedLoad, RunnableAvg, SchedAvg, SeqCopy};
use crate::timeline::Timeline;
use crate::vtime::INITIAL_MIN_VRUNTIME;
use crate::weight::LoadWeight;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Part of a queue that other CPUs touch without its lock
#[derive(Debug)]
pub struct CfsRqShared {
    /// Load left behind by entities that moved away
    pub removed: RemovedLoad,
    /// `avg.last_update_time`, for aging departing entities
    pub last_update_time: SeqCopy,
    /// `min_vruntime`, for diagnostics
    pub min_vruntime: SeqCopy,
}

impl CfsRqShared {
    fn new() -> Self {
        Self {
            removed: RemovedLoad::new(),
            last_update_time: SeqCopy::new(0),
            min_vruntime: SeqCopy::new(INITIAL_MIN_VRUNTIME),
        }
    }
}

/// A fair queue
#[derive(Debug)]
pub struct CfsRq {
    /// Summed weight of queued entities, running one included
    pub load: LoadWeight,
    /// Entities queued here
    pub nr_running: u32,
    /// Tasks queued here and below
    pub h_nr_running: u32,
    /// Wall time the queue spent running entities
    pub exec_clock: u64,
    /// Floor for placing entities, never moves backwards
    pub min_vruntime: u64,
    /// Queued entities except the running one
    pub timeline: Timeline,

    /// Running entity
    pub curr: Option<EntityId>,
    /// Entity a wakeup asked to run next
    pub next: Option<EntityId>,
    /// Entity that was preempted by a wakeup
    pub last: Option<EntityId>,
    /// Entity that yielded
    pub skip: Option<EntityId>,

    /// Load and utilization including blocked entities
    pub avg: SchedAvg,
    /// Load of queued entities only
    pub runnable: RunnableAvg,
    /// `avg.load_avg` last folded into the group's total
    pub tg_load_avg_contrib: u64,
    /// Lock-free state
    pub shared: Arc<CfsRqShared>,

    /// Load of this queue as seen from the root
    pub h_load: u64,
    /// Child entity on the path being evaluated by the h_load walk
    pub h_load_next: Option<EntityId>,
    /// Tick of the last h_load computation
    pub last_h_load_update: u64,

    /// Owning group
    pub tg: Arc<TaskGroup>,
    /// Entity representing this queue in the parent queue
    pub se: Option<EntityId>,
    /// Parent queue on the same CPU
    pub parent: Option<CfsRqId>,
    /// Queues of child groups on the same CPU
    pub children: Vec<CfsRqId>,
    /// Linked in the CPU's leaf list
    pub on_list: bool,

    /// Bandwidth limited
    pub runtime_enabled: bool,
    /// Runtime left in the local slice, negative when overrun
    pub runtime_remaining: i64,
    /// When the local slice expires
    pub runtime_expires: u64,
    /// Removed from its parent for lack of runtime
    pub throttled: bool,
    /// Throttled ancestors, itself included
    pub throttle_count: u32,
    /// `throttle_count` has been synced from the parent
    pub throttle_uptodate: bool,
    /// Clock when last throttled
    pub throttled_clock: u64,
    /// Task clock when the hierarchy got throttled
    pub throttled_clock_task: u64,
    /// Task-clock time spent throttled
    pub throttled_clock_task_time: u64,

    /// Times an entity drifted far from `min_vruntime`
    pub nr_spread_over: u64,
}

impl CfsRq {
    /// Empty queue of `tg`
    pub fn new(tg: Arc<TaskGroup>, se: Option<EntityId>, parent: Option<CfsRqId>) -> Self {
        Self {
            load: LoadWeight::default(),
            nr_running: 0,
            h_nr_running: 0,
            exec_clock: 0,
            min_vruntime: INITIAL_MIN_VRUNTIME,
            timeline: Timeline::new(INITIAL_MIN_VRUNTIME),
            curr: None,
            next: None,
            last: None,
            skip: None,
            avg: SchedAvg::default(),
            runnable: RunnableAvg::default(),
            tg_load_avg_contrib: 0,
            shared: Arc::new(CfsRqShared::new()),
            h_load: 0,
            h_load_next: None,
            last_h_load_update: 0,
            tg,
            se,
            parent,
            children: Vec::new(),
            on_list: false,
            runtime_enabled: false,
            runtime_remaining: 0,
            runtime_expires: 0,
            throttled: false,
            throttle_count: 0,
            throttle_uptodate: false,
            throttled_clock: 0,
            throttled_clock_task: 0,
            throttled_clock_task_time: 0,
            nr_spread_over: 0,
        }
    }

    /// Whether this is a CPU's top-level queue
    #[inline]
    pub fn is_root(&self) -> bool {
        self.se.is_none()
    }

    /// Throttled itself
    #[inline]
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Throttled itself or through an ancestor
    #[inline]
    pub fn throttled_hierarchy(&self) -> bool {
        self.throttle_count > 0
    }

    /// Leftmost queued entity
    #[inline]
    pub fn first(&self) -> Option<EntityId> {
        self.timeline.first()
    }
}

/// Snapshot of a queue, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfsRqSnapshot {
    /// Group of the queue
    pub group: crate::entity::GroupId,
    /// Entities queued
    pub nr_running: u32,
    /// Tasks queued below
    pub h_nr_running: u32,
    /// Summed weight
    pub load: u64,
    /// Placement floor
    pub min_vruntime: u64,
    /// Decayed load including blocked entities
    pub load_avg: u64,
    /// Decayed load of queued entities
    pub runnable_load_avg: u64,
    /// Decayed utilization
    pub util_avg: u64,
    /// Throttled for bandwidth
    pub throttled: bool,
    /// Runtime left in the local slice
    pub runtime_remaining: i64,
    /// Times an entity drifted far from `min_vruntime`
    pub nr_spread_over: u64,
}

impl From<&CfsRq> for CfsRqSnapshot {
    fn from(cfs: &CfsRq) -> Self {
        Self {
            group: cfs.tg.id,
            nr_running: cfs.nr_running,
            h_nr_running: cfs.h_nr_running,
            load: cfs.load.weight,
            min_vruntime: cfs.min_vruntime,
            load_avg: cfs.avg.load_avg,
            runnable_load_avg: cfs.runnable.avg,
            util_avg: cfs.avg.util_avg,
            throttled: cfs.throttled,
            runtime_remaining: cfs.runtime_remaining,
            nr_spread_over: cfs.nr_spread_over,
        }
    }
}
