//! # Fair Scheduler Configuration
//!
//! [`CfsConfig`] is what the host hands over at construction. The knobs
//! that the hot path reads are derived from it into an immutable
//! [`Tunables`] snapshot, recomputed and swapped whenever a knob is
//! written or the number of online CPUs changes.

use crate::error::{CfsError, CfsResult};
use crate::placement::PlacementKind;
use crate::topology::TopologySpec;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::RwLock;

const NSEC_PER_USEC: u64 = 1_000;
const NSEC_PER_MSEC: u64 = 1_000_000;
const NSEC_PER_SEC: u64 = 1_000_000_000;

/// How the latency knobs grow with the number of CPUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingPolicy {
    /// Use the values as given
    None,
    /// Multiply by `1 + ilog2(cpus)`
    #[default]
    Log,
    /// Multiply by the number of CPUs
    Linear,
}

impl ScalingPolicy {
    /// Scaling factor for `cpus` online CPUs (capped at 8)
    pub fn factor(self, cpus: usize) -> u64 {
        let cpus = cpus.clamp(1, 8) as u64;
        match self {
            ScalingPolicy::None => 1,
            ScalingPolicy::Log => 1 + cpus.ilog2() as u64,
            ScalingPolicy::Linear => cpus,
        }
    }
}

bitflags! {
    /// Heuristics that can be switched off individually
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SchedFeatures: u32 {
        /// New tasks start one virtual slice behind
        const START_DEBIT = 1 << 0;
        /// Sleepers get half a latency of credit instead of a full one
        const GENTLE_FAIR_SLEEPERS = 1 << 1;
        /// Wakeups may preempt the running task
        const WAKEUP_PREEMPTION = 1 << 2;
        /// Prefer the woken task on the next pick
        const NEXT_BUDDY = 1 << 3;
        /// Prefer the preempted task on the next pick
        const LAST_BUDDY = 1 << 4;
        /// Buddies count as cache hot for the balancer
        const CACHE_HOT_BUDDY = 1 << 5;
        /// Bias source/target load with the decayed cpu_load history
        const LB_BIAS = 1 << 6;
        /// Skip tiny tasks while balancing
        const LB_MIN = 1 << 7;
        /// Age a migrating entity's sample to its new queue's clock
        const ATTACH_AGE_LOAD = 1 << 8;
    }
}

impl Default for SchedFeatures {
    fn default() -> Self {
        SchedFeatures::START_DEBIT
            | SchedFeatures::GENTLE_FAIR_SLEEPERS
            | SchedFeatures::WAKEUP_PREEMPTION
            | SchedFeatures::LAST_BUDDY
            | SchedFeatures::CACHE_HOT_BUDDY
            | SchedFeatures::LB_BIAS
            | SchedFeatures::ATTACH_AGE_LOAD
    }
}

/// Configuration for the fair scheduler
#[derive(Debug, Clone)]
pub struct CfsConfig {
    /// Target preemption latency for CPU-bound tasks, before scaling
    pub latency_ns: u64,
    /// Minimal preemption granularity, before scaling
    pub min_granularity_ns: u64,
    /// Wakeup preemption granularity, before scaling
    pub wakeup_granularity_ns: u64,
    /// How latency knobs scale with CPU count
    pub scaling: ScalingPolicy,
    /// Forked children run before their parent
    pub child_runs_first: bool,
    /// Tasks that ran this recently are cache hot
    pub migration_cost_ns: u64,
    /// Runtime a queue withdraws from its group pool at a time
    pub bandwidth_slice_us: u64,
    /// Most tasks moved per balance attempt
    pub nr_migrate: u32,
    /// Failed balance attempts beyond `cache_nice_tries` before forcing
    pub active_balance_threshold: u32,
    /// Tick rate, in Hz, used for balance intervals
    pub hz: u64,
    /// Heuristic switches
    pub features: SchedFeatures,
    /// Number of CPUs
    pub cpu_count: usize,
    /// Capacity of each CPU (1024 = biggest), empty means all full
    pub capacities: Vec<u64>,
    /// Domain hierarchy
    pub topology: TopologySpec,
    /// Task placement strategy
    pub placement: PlacementKind,
}

macro_rules! config_setters {
    ($($field:ident: $ty:ty),* $(,)?) => {
        paste::paste! {
            impl CfsConfig {
                $(
                    #[doc = concat!("Set `", stringify!($field), "`")]
                    pub fn [<with_ $field>](mut self, value: $ty) -> Self {
                        self.$field = value;
                        self
                    }
                )*
            }
        }
    };
}

config_setters! {
    latency_ns: u64,
    min_granularity_ns: u64,
    wakeup_granularity_ns: u64,
    scaling: ScalingPolicy,
    child_runs_first: bool,
    migration_cost_ns: u64,
    bandwidth_slice_us: u64,
    nr_migrate: u32,
    active_balance_threshold: u32,
    hz: u64,
    features: SchedFeatures,
    capacities: Vec<u64>,
    topology: TopologySpec,
    placement: PlacementKind,
}

impl CfsConfig {
    /// Default target latency: 6ms
    pub const DEFAULT_LATENCY_NS: u64 = 6 * NSEC_PER_MSEC;
    /// Default minimal granularity: 0.75ms
    pub const DEFAULT_MIN_GRANULARITY_NS: u64 = 750 * NSEC_PER_USEC;
    /// Default wakeup granularity: 1ms
    pub const DEFAULT_WAKEUP_GRANULARITY_NS: u64 = NSEC_PER_MSEC;
    /// Default migration cost: 0.5ms
    pub const DEFAULT_MIGRATION_COST_NS: u64 = 500 * NSEC_PER_USEC;
    /// Default bandwidth slice: 5ms
    pub const DEFAULT_BANDWIDTH_SLICE_US: u64 = 5_000;
    /// Default tasks moved per balance attempt
    pub const DEFAULT_NR_MIGRATE: u32 = 32;
    /// Default active balance threshold
    pub const DEFAULT_ACTIVE_BALANCE_THRESHOLD: u32 = 10;
    /// Default tick rate
    pub const DEFAULT_HZ: u64 = 1000;

    /// Create default configuration for a single CPU
    pub fn new() -> Self {
        Self {
            latency_ns: Self::DEFAULT_LATENCY_NS,
            min_granularity_ns: Self::DEFAULT_MIN_GRANULARITY_NS,
            wakeup_granularity_ns: Self::DEFAULT_WAKEUP_GRANULARITY_NS,
            scaling: ScalingPolicy::Log,
            child_runs_first: false,
            migration_cost_ns: Self::DEFAULT_MIGRATION_COST_NS,
            bandwidth_slice_us: Self::DEFAULT_BANDWIDTH_SLICE_US,
            nr_migrate: Self::DEFAULT_NR_MIGRATE,
            active_balance_threshold: Self::DEFAULT_ACTIVE_BALANCE_THRESHOLD,
            hz: Self::DEFAULT_HZ,
            features: SchedFeatures::default(),
            cpu_count: 1,
            capacities: Vec::new(),
            topology: TopologySpec::flat(),
            placement: PlacementKind::Fair,
        }
    }

    /// Default configuration for `cpus` CPUs sharing one cache domain
    pub fn with_cpus(cpus: usize) -> Self {
        Self { cpu_count: cpus, ..Self::new() }
    }

    /// Throughput-oriented configuration: longer slices, fewer wakeup
    /// preemptions
    pub fn server(cpus: usize) -> Self {
        Self {
            latency_ns: 24 * NSEC_PER_MSEC,
            min_granularity_ns: 3 * NSEC_PER_MSEC,
            wakeup_granularity_ns: 4 * NSEC_PER_MSEC,
            migration_cost_ns: 5 * NSEC_PER_MSEC,
            ..Self::with_cpus(cpus)
        }
    }

    /// Latency-oriented configuration
    pub fn desktop(cpus: usize) -> Self {
        Self {
            latency_ns: 4 * NSEC_PER_MSEC,
            min_granularity_ns: 500 * NSEC_PER_USEC,
            wakeup_granularity_ns: 500 * NSEC_PER_USEC,
            features: SchedFeatures::default() | SchedFeatures::NEXT_BUDDY,
            ..Self::with_cpus(cpus)
        }
    }

    /// Capacity of `cpu`
    pub fn capacity_of(&self, cpu: usize) -> u64 {
        self.capacities.get(cpu).copied().unwrap_or(crate::weight::SCHED_CAPACITY_SCALE)
    }

    /// Check the configuration before a scheduler is built from it
    pub fn validate(&self) -> CfsResult<()> {
        if self.cpu_count == 0 || self.cpu_count > crate::topology::MAX_CPUS {
            return Err(CfsError::InvalidCpu);
        }
        if !self.capacities.is_empty() && self.capacities.len() != self.cpu_count {
            return Err(CfsError::InvalidTopology);
        }
        if self.hz == 0 || self.nr_migrate == 0 {
            return Err(CfsError::InvalidTunable);
        }
        for (tunable, value) in [
            (Tunable::Latency, self.latency_ns),
            (Tunable::MinGranularity, self.min_granularity_ns),
            (Tunable::WakeupGranularity, self.wakeup_granularity_ns),
            (Tunable::BandwidthSliceUs, self.bandwidth_slice_us),
        ] {
            tunable.check(value)?;
        }
        Ok(())
    }

    /// Write a tunable as seen by the administrator (already scaled for
    /// `cpus` CPUs); the stored value is normalized back
    pub fn set_tunable(&mut self, tunable: Tunable, value: u64, cpus: usize) -> CfsResult<()> {
        tunable.check(value)?;
        let factor = self.scaling.factor(cpus);
        match tunable {
            Tunable::Latency => self.latency_ns = value / factor,
            Tunable::MinGranularity => self.min_granularity_ns = value / factor,
            Tunable::WakeupGranularity => self.wakeup_granularity_ns = value / factor,
            Tunable::MigrationCost => self.migration_cost_ns = value,
            Tunable::ChildRunsFirst => self.child_runs_first = value != 0,
            Tunable::BandwidthSliceUs => self.bandwidth_slice_us = value,
            Tunable::NrMigrate => self.nr_migrate = value as u32,
        }
        Ok(())
    }
}

impl Default for CfsConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Knobs writable at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tunable {
    /// Target latency (ns)
    Latency,
    /// Minimal granularity (ns)
    MinGranularity,
    /// Wakeup granularity (ns)
    WakeupGranularity,
    /// Migration cost (ns)
    MigrationCost,
    /// Child runs first (0 or 1)
    ChildRunsFirst,
    /// Bandwidth slice (us)
    BandwidthSliceUs,
    /// Tasks moved per balance attempt
    NrMigrate,
}

impl Tunable {
    fn check(self, value: u64) -> CfsResult<()> {
        let ok = match self {
            Tunable::Latency | Tunable::MinGranularity => {
                (100 * NSEC_PER_USEC..=NSEC_PER_SEC).contains(&value)
            }
            Tunable::WakeupGranularity => value <= NSEC_PER_SEC,
            Tunable::MigrationCost => true,
            Tunable::ChildRunsFirst => value <= 1,
            Tunable::BandwidthSliceUs => value >= 1,
            Tunable::NrMigrate => (1..=u32::MAX as u64).contains(&value),
        };
        if ok { Ok(()) } else { Err(CfsError::InvalidTunable) }
    }
}

/// Derived knobs read on the hot path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    /// Scaled target latency
    pub latency_ns: u64,
    /// Scaled minimal granularity
    pub min_granularity_ns: u64,
    /// Scaled wakeup granularity
    pub wakeup_granularity_ns: u64,
    /// Entities per latency period before the period stretches
    pub nr_latency: u64,
    /// Forked children run first
    pub child_runs_first: bool,
    /// Cache-hot threshold
    pub migration_cost_ns: u64,
    /// Bandwidth withdrawal size in ns
    pub bandwidth_slice_ns: u64,
    /// Tasks moved per balance attempt
    pub nr_migrate: u32,
    /// Forced-migration threshold
    pub active_balance_threshold: u32,
    /// Tick rate
    pub hz: u64,
    /// Heuristic switches
    pub features: SchedFeatures,
    /// Scaling factor in effect
    pub factor: u64,
}

impl Tunables {
    /// Derive the snapshot for `cpus` online CPUs
    pub fn derive(config: &CfsConfig, cpus: usize) -> Self {
        let factor = config.scaling.factor(cpus);
        let latency_ns = config.latency_ns * factor;
        let min_granularity_ns = (config.min_granularity_ns * factor).max(1);
        Self {
            latency_ns,
            min_granularity_ns,
            wakeup_granularity_ns: config.wakeup_granularity_ns * factor,
            nr_latency: latency_ns.div_ceil(min_granularity_ns),
            child_runs_first: config.child_runs_first,
            migration_cost_ns: config.migration_cost_ns,
            bandwidth_slice_ns: config.bandwidth_slice_us * NSEC_PER_USEC,
            nr_migrate: config.nr_migrate,
            active_balance_threshold: config.active_balance_threshold,
            hz: config.hz,
            features: config.features,
            factor,
        }
    }

    /// Whether `feature` is enabled
    #[inline]
    pub fn feat(&self, feature: SchedFeatures) -> bool {
        self.features.contains(feature)
    }

    /// Nanoseconds per tick
    pub fn tick_ns(&self) -> u64 {
        NSEC_PER_SEC / self.hz
    }

    /// Convert a clock value into ticks
    pub fn ticks(&self, now_ns: u64) -> u64 {
        now_ns / self.tick_ns()
    }
}

/// Atomically swappable [`Tunables`] snapshot
#[derive(Debug)]
pub struct TunablesCell {
    current: RwLock<Arc<Tunables>>,
}

impl TunablesCell {
    /// Create with an initial snapshot
    pub fn new(tunables: Tunables) -> Self {
        Self { current: RwLock::new(Arc::new(tunables)) }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<Tunables> {
        self.current.read().clone()
    }

    /// Install a new snapshot
    pub fn store(&self, tunables: Tunables) {
        log::info!(
            "[cfs] tunables: latency {}ns, min_gran {}ns, wakeup_gran {}ns, nr_latency {}",
            tunables.latency_ns,
            tunables.min_granularity_ns,
            tunables.wakeup_granularity_ns,
            tunables.nr_latency
        );
        *self.current.write() = Arc::new(tunables);
    }
}
