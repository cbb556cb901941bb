//! # Task Placement
//!
//! Choosing a CPU for a task that wakes up or is created. Placement runs
//! without any run-queue lock: it reads the figures each CPU publishes
//! in its [`RqShared`] and the per-CPU state groups publish, so its view
//! may be slightly stale. The scheduler re-validates the answer (allowed
//! and online) before moving anything.
//!
//! Strategies implement [`PlacementPolicy`]. [`FairPlacement`] is the
//! load-driven default; heterogeneous and multi-node machines can use
//! the capacity-aware or NUMA strategies, which fall back to it.

mod fair;

#[cfg(feature = "capacity-aware")]
mod capacity;
#[cfg(feature = "numa")]
mod numa;

pub use fair::FairPlacement;

#[cfg(feature = "capacity-aware")]
pub use capacity::{capacity_power_cost, CapacityParams, CapacityPlacement};
#[cfg(feature = "numa")]
pub use numa::{task_numa_placement, update_task_scan_period, NumaParams, NumaPlacement};

use crate::config::{SchedFeatures, Tunables};
use crate::group::{TaskGroup, MIN_SHARES};
use crate::rq::RqShared;
use crate::task::{TaskRef, WakeFlags};
use crate::topology::{CpuMask, SdFlags, Topology};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt::Debug;
use core::sync::atomic::Ordering;

// =============================================================================
// Inputs and result
// =============================================================================

/// The task doing the waking
#[derive(Debug, Clone)]
pub struct WakerInfo {
    /// Group of the waker
    pub group: Arc<TaskGroup>,
    /// Decayed load of the waker
    pub load_avg: u64,
    /// Decayed count of wakee switches of the waker
    pub wakee_flips: u32,
}

/// Everything known about a task being placed
#[derive(Debug, Clone)]
pub struct WakeContext {
    /// Task
    pub task: Arc<TaskRef>,
    /// Group of the task
    pub group: Arc<TaskGroup>,
    /// CPU the task last ran on
    pub prev_cpu: usize,
    /// CPU doing the wakeup or fork
    pub this_cpu: usize,
    /// `BALANCE_WAKE`, `BALANCE_FORK` or `BALANCE_EXEC`
    pub sd_flag: SdFlags,
    /// Wakeup flags
    pub wake_flags: WakeFlags,
    /// Decayed load of the task
    pub load_avg: u64,
    /// Decayed utilization of the task
    pub util_avg: u64,
    /// Decayed count of wakee switches of the task
    pub wakee_flips: u32,
    /// Waker, absent when the host wakes the task on its own behalf
    pub waker: Option<WakerInfo>,
}

impl WakeContext {
    /// Whether the waker is about to sleep
    #[inline]
    pub fn sync(&self) -> bool {
        self.wake_flags.contains(WakeFlags::SYNC)
    }

    /// Whether this is a wakeup rather than fork or exec placement
    #[inline]
    pub fn is_wakeup(&self) -> bool {
        self.sd_flag.contains(SdFlags::BALANCE_WAKE)
    }
}

/// Outcome of an affine-wakeup comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffineAttempt {
    /// Domain level of the comparison, on the waking CPU
    pub level: usize,
    /// Task pulled next to the waker
    pub pulled: bool,
}

/// Chosen CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Target CPU
    pub cpu: usize,
    /// Affine comparison made on the way, for statistics
    pub affine: Option<AffineAttempt>,
}

impl Placement {
    /// Plain choice of `cpu`
    #[inline]
    pub const fn at(cpu: usize) -> Self {
        Self { cpu, affine: None }
    }
}

/// Lock-free view of the machine
#[derive(Debug, Clone, Copy)]
pub struct PlacementEnv<'a> {
    /// Current knobs
    pub tun: &'a Tunables,
    /// Domain hierarchy
    pub topo: &'a Topology,
    /// Published figures, indexed by CPU
    pub rqs: &'a [Arc<RqShared>],
}

impl<'a> PlacementEnv<'a> {
    /// Published figures of `cpu`
    #[inline]
    pub fn rq(&self, cpu: usize) -> &'a RqShared {
        &self.rqs[cpu]
    }

    /// Online CPUs
    pub fn online_mask(&self) -> CpuMask {
        self.rqs
            .iter()
            .filter(|rq| rq.is_online())
            .fold(CpuMask::EMPTY, |m, rq| m.with(rq.cpu))
    }

    /// CPUs the task may be placed on right now
    pub fn allowed(&self, task: &TaskRef) -> CpuMask {
        task.affinity().and(self.online_mask())
    }

    /// Whether `cpu` is online and has nothing to run
    #[inline]
    pub fn idle_cpu(&self, cpu: usize) -> bool {
        self.rqs.get(cpu).is_some_and(|rq| rq.is_online() && rq.is_idle())
    }

    /// Current load
    #[inline]
    pub fn weighted_cpuload(&self, cpu: usize) -> u64 {
        self.rq(cpu).weighted_cpuload()
    }

    /// Low guess at the load of a migration source
    pub fn source_load(&self, cpu: usize, idx: usize) -> u64 {
        let total = self.weighted_cpuload(cpu);
        if idx == 0 || !self.tun.feat(SchedFeatures::LB_BIAS) {
            return total;
        }
        self.rq(cpu).cpu_load(idx).min(total)
    }

    /// High guess at the load of a migration target
    pub fn target_load(&self, cpu: usize, idx: usize) -> u64 {
        let total = self.weighted_cpuload(cpu);
        if idx == 0 || !self.tun.feat(SchedFeatures::LB_BIAS) {
            return total;
        }
        self.rq(cpu).cpu_load(idx).max(total)
    }

    /// Capacity left for fair tasks
    #[inline]
    pub fn capacity_of(&self, cpu: usize) -> u64 {
        self.rq(cpu).capacity().max(1)
    }

    /// Utilization, capped at full capacity
    #[inline]
    pub fn cpu_util(&self, cpu: usize) -> u64 {
        self.rq(cpu).util()
    }

    /// Change of the root queue's load on `cpu` when `wl` is added to
    /// the group queue of `tg` and `wg` to the group's total weight
    ///
    /// Adding load to a group changes the group entity's share at every
    /// level, so the delta is carried up through the ancestors. Only the
    /// bottom level gets extra weight; the levels above redistribute.
    pub fn effective_load(&self, tg: &TaskGroup, cpu: usize, mut wl: i64, mut wg: i64) -> i64 {
        let mut level = Some(tg);
        while let Some(g) = level {
            if g.is_root() {
                break;
            }
            let Some(state) = g.per_cpu.get(cpu) else {
                break;
            };
            let w = state.cfs_load_avg.load(Ordering::Relaxed) as i64;
            let contrib = state.load_avg_contrib.load(Ordering::Relaxed) as i64;
            let shares = g.shares() as i64;

            let big_w = wg + g.load_avg() - contrib + w;
            let w = w + wl;
            wl = if big_w > 0 && w < big_w { w * shares / big_w } else { shares };
            wl = wl.max(MIN_SHARES as i64);
            wl -= state.se_load_avg.load(Ordering::Relaxed) as i64;

            wg = 0;
            level = g.parent.as_deref();
        }
        wl
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// Placement strategy
pub trait PlacementPolicy: Send + Sync + Debug {
    /// Strategy name, for diagnostics
    fn name(&self) -> &'static str;

    /// Pick a CPU for `p`
    fn select_task_rq(&self, env: &PlacementEnv<'_>, p: &WakeContext) -> Placement;
}

/// Strategy selected at construction
#[derive(Debug, Clone, Default)]
pub enum PlacementKind {
    /// Load-driven placement
    #[default]
    Fair,
    /// Heterogeneous-capacity placement
    #[cfg(feature = "capacity-aware")]
    Capacity(CapacityParams),
    /// Memory-locality placement
    #[cfg(feature = "numa")]
    Numa(NumaParams),
}

impl PlacementKind {
    /// Instantiate the strategy
    pub fn build(&self) -> Box<dyn PlacementPolicy> {
        match self {
            PlacementKind::Fair => Box::new(FairPlacement),
            #[cfg(feature = "capacity-aware")]
            PlacementKind::Capacity(params) => Box::new(CapacityPlacement::new(params.clone())),
            #[cfg(feature = "numa")]
            PlacementKind::Numa(params) => Box::new(NumaPlacement::new(params.clone())),
        }
    }
}

/// Whether `load` on a CPU of `capacity` is below `pct` percent of it
#[inline]
pub(crate) fn fits_in(load: u64, capacity: u64, pct: u64) -> bool {
    load * 100 < capacity * pct
}
