//! Placement for machines whose CPUs differ in capacity.
//!
//! Tasks are sorted by demand. Big ones only fit the largest CPUs, small
//! ones are packed onto CPUs that are already awake, and the rest go to
//! the cheapest CPU that fits them. Anything that finds no candidate is
//! handed to [`FairPlacement`].

use super::{fits_in, FairPlacement, Placement, PlacementEnv, PlacementPolicy, WakeContext};
use crate::topology::CpuMask;

/// Cost of running a task of `demand` on a CPU of `capacity`
pub type PowerCostFn = fn(capacity: u64, demand: u64) -> u64;

/// Default cost model: bigger CPUs cost more
pub fn capacity_power_cost(capacity: u64, _demand: u64) -> u64 {
    capacity
}

/// Thresholds of [`CapacityPlacement`]
#[derive(Debug, Clone)]
pub struct CapacityParams {
    /// A task fits a CPU while its demand stays below this percentage
    /// of the CPU's capacity
    pub upmigrate_pct: u64,
    /// Tasks below this percentage of the largest capacity are small
    pub small_task_pct: u64,
    /// Small tasks are not packed onto CPUs running this many tasks
    pub spill_nr_run: u32,
    /// Cost model
    pub power_cost: PowerCostFn,
}

impl Default for CapacityParams {
    fn default() -> Self {
        Self { upmigrate_pct: 80, small_task_pct: 10, spill_nr_run: 10, power_cost: capacity_power_cost }
    }
}

/// Heterogeneous-capacity placement
#[derive(Debug, Clone)]
pub struct CapacityPlacement {
    params: CapacityParams,
}

impl CapacityPlacement {
    /// Create with the given thresholds
    pub fn new(params: CapacityParams) -> Self {
        Self { params }
    }

    /// Whether a task of `demand` fits `cpu`; the largest CPUs fit all
    pub fn task_fits(&self, env: &PlacementEnv<'_>, demand: u64, cpu: usize) -> bool {
        let capacity = env.topo.capacity_orig(cpu);
        capacity == env.topo.max_capacity() || fits_in(demand, capacity, self.params.upmigrate_pct)
    }

    /// Whether `demand` is small enough to pack
    pub fn is_small(&self, env: &PlacementEnv<'_>, demand: u64) -> bool {
        fits_in(demand, env.topo.max_capacity(), self.params.small_task_pct)
    }

    fn cost(&self, env: &PlacementEnv<'_>, cpu: usize, demand: u64) -> u64 {
        (self.params.power_cost)(env.topo.capacity_orig(cpu), demand)
    }

    /// Awake CPU that can absorb a small task, else the cheapest idle one
    fn best_small_task_cpu(&self, env: &PlacementEnv<'_>, p: &WakeContext, allowed: CpuMask) -> Option<usize> {
        let demand = p.util_avg;
        let busy = allowed
            .iter()
            .filter(|&cpu| !env.idle_cpu(cpu))
            .filter(|&cpu| env.rq(cpu).nr_running() < self.params.spill_nr_run)
            .filter(|&cpu| {
                let capacity = env.topo.capacity_orig(cpu);
                fits_in(env.cpu_util(cpu) + demand, capacity, self.params.upmigrate_pct)
            })
            .min_by_key(|&cpu| (self.cost(env, cpu, demand), env.cpu_util(cpu), cpu != p.prev_cpu));
        if busy.is_some() {
            return busy;
        }
        allowed
            .iter()
            .filter(|&cpu| env.idle_cpu(cpu))
            .min_by_key(|&cpu| (self.cost(env, cpu, demand), cpu != p.prev_cpu))
    }

    /// Cheapest CPU the task fits, preferring room to spare and idleness
    fn best_fit_cpu(&self, env: &PlacementEnv<'_>, p: &WakeContext, allowed: CpuMask) -> Option<usize> {
        let demand = p.util_avg;
        allowed
            .iter()
            .filter(|&cpu| self.task_fits(env, demand, cpu))
            .min_by_key(|&cpu| {
                let util = env.cpu_util(cpu);
                let room = util + demand <= env.topo.capacity_orig(cpu);
                (self.cost(env, cpu, demand), !room, !env.idle_cpu(cpu), util, cpu != p.prev_cpu)
            })
    }
}

impl PlacementPolicy for CapacityPlacement {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn select_task_rq(&self, env: &PlacementEnv<'_>, p: &WakeContext) -> Placement {
        if p.task.nr_cpus_allowed() == 1 {
            return Placement::at(p.prev_cpu);
        }
        let allowed = env.allowed(&p.task);
        let chosen = if self.is_small(env, p.util_avg) && !p.sync() {
            self.best_small_task_cpu(env, p, allowed)
        } else {
            self.best_fit_cpu(env, p, allowed)
        };
        match chosen {
            Some(cpu) => {
                log::debug!("[cfs] place {} (demand {}): cpu{}", p.task.id, p.util_avg, cpu);
                Placement::at(cpu)
            }
            None => FairPlacement.select_task_rq(env, p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Machine;
    use crate::topology::{SdFlags, TopologySpec};

    fn little_big() -> Machine {
        Machine::new(TopologySpec::flat(), 4, &[512, 512, 1024, 1024])
    }

    #[test]
    fn test_classification() {
        let m = little_big();
        let shared = m.shared();
        let env = m.env(&shared);
        let policy = CapacityPlacement::new(CapacityParams::default());
        assert!(policy.is_small(&env, 50));
        assert!(!policy.is_small(&env, 200));
        assert!(policy.task_fits(&env, 300, 0));
        assert!(!policy.task_fits(&env, 600, 0));
        assert!(policy.task_fits(&env, 1000, 2));
    }

    #[test]
    fn test_big_task_goes_big() {
        let mut m = little_big();
        m.set_load(2, 1, 1024);
        m.set_util(2, 900);
        let shared = m.shared();
        let env = m.env(&shared);
        let mut p = m.wake_context(1, CpuMask::first(4), 0, 0, SdFlags::BALANCE_WAKE);
        p.util_avg = 600;
        let policy = CapacityPlacement::new(CapacityParams::default());
        assert_eq!(policy.select_task_rq(&env, &p).cpu, 3);
    }

    #[test]
    fn test_small_task_packs_onto_busy_cpu() {
        let mut m = little_big();
        m.set_load(1, 1, 1024);
        m.set_util(1, 200);
        let shared = m.shared();
        let env = m.env(&shared);
        let mut p = m.wake_context(1, CpuMask::first(4), 3, 3, SdFlags::BALANCE_WAKE);
        p.util_avg = 40;
        let policy = CapacityPlacement::new(CapacityParams::default());
        assert_eq!(policy.select_task_rq(&env, &p).cpu, 1);
    }

    #[test]
    fn test_small_task_spills_when_crowded() {
        let mut m = little_big();
        m.set_load(1, 2, 2048);
        m.set_util(1, 200);
        let shared = m.shared();
        let env = m.env(&shared);
        let mut p = m.wake_context(1, CpuMask::first(4), 3, 3, SdFlags::BALANCE_WAKE);
        p.util_avg = 40;
        let params = CapacityParams { spill_nr_run: 2, ..CapacityParams::default() };
        // cpu1 is at the spill limit; the cheapest idle CPU takes it
        assert_eq!(CapacityPlacement::new(params).select_task_rq(&env, &p).cpu, 0);
    }

    #[test]
    fn test_regular_task_prefers_idle_little() {
        let mut m = little_big();
        m.set_load(0, 1, 1024);
        m.set_util(0, 100);
        let shared = m.shared();
        let env = m.env(&shared);
        let mut p = m.wake_context(1, CpuMask::first(4), 2, 2, SdFlags::BALANCE_WAKE);
        p.util_avg = 300;
        let policy = CapacityPlacement::new(CapacityParams::default());
        assert_eq!(policy.select_task_rq(&env, &p).cpu, 1);
    }
}
