//! Memory-locality placement.
//!
//! The host reports, per task, how many memory faults hit each node.
//! The decayed counts elect a preferred node, and wakeups look for an
//! idle CPU there before falling back to [`FairPlacement`]. How often the
//! host samples a task's faults adapts to how local its accesses are.

use super::{FairPlacement, Placement, PlacementEnv, PlacementPolicy, WakeContext};
use crate::task::NumaFaults;

/// Scan period adjustment granularity
pub const NUMA_PERIOD_SLOTS: u64 = 10;
/// Local-fault ratio, in slots, at which the scan period stays put
pub const NUMA_PERIOD_THRESHOLD: u64 = 7;

/// Knobs of [`NumaPlacement`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaParams {
    /// Shortest scan period (ms)
    pub scan_period_min_ms: u64,
    /// Longest scan period (ms)
    pub scan_period_max_ms: u64,
    /// A new node must beat the preferred one by this many eighths
    pub hysteresis_eighths: u64,
}

impl Default for NumaParams {
    fn default() -> Self {
        Self { scan_period_min_ms: 1000, scan_period_max_ms: 60_000, hysteresis_eighths: 3 }
    }
}

/// Fold a scan window of per-node faults into `stats` and re-elect the
/// preferred node
///
/// Older counts halve every window. The preferred node only changes
/// when another node clearly has more faults.
pub fn task_numa_placement(stats: &mut NumaFaults, window: &[u64], params: &NumaParams) -> Option<usize> {
    if stats.faults.len() < window.len() {
        stats.faults.resize(window.len(), 0);
    }
    for (node, faults) in stats.faults.iter_mut().enumerate() {
        *faults = *faults / 2 + window.get(node).copied().unwrap_or(0);
    }

    let mut max_node = None;
    let mut max_faults = 0;
    for (node, &faults) in stats.faults.iter().enumerate() {
        if faults > max_faults {
            max_faults = faults;
            max_node = Some(node);
        }
    }
    let Some(max_node) = max_node else {
        return stats.preferred_node;
    };

    let switch = match stats.preferred_node {
        None => true,
        Some(cur) if cur == max_node => false,
        Some(cur) => {
            let cur_faults = stats.faults.get(cur).copied().unwrap_or(0);
            max_faults * 8 > cur_faults * (8 + params.hysteresis_eighths)
        }
    };
    if switch {
        log::debug!("[cfs] numa: preferred node {:?} -> {}", stats.preferred_node, max_node);
        stats.preferred_node = Some(max_node);
    }
    stats.preferred_node
}

/// Adapt the scan period to the locality of the last window
///
/// Mostly local faults slow scanning down; mostly remote ones speed it
/// up, less so when the faults hit shared memory. No faults at all
/// doubles the period.
pub fn update_task_scan_period(
    stats: &mut NumaFaults,
    local: u64,
    remote: u64,
    shared: u64,
    private: u64,
    params: &NumaParams,
) -> u64 {
    let min = params.scan_period_min_ms;
    let max = params.scan_period_max_ms.max(min);
    if stats.scan_period_ms == 0 {
        stats.scan_period_ms = min;
    }
    let period = stats.scan_period_ms;

    if local + shared == 0 {
        stats.scan_period_ms = (period * 2).min(max);
        return stats.scan_period_ms;
    }

    let period_slot = period.div_ceil(NUMA_PERIOD_SLOTS) as i64;
    let ratio = local * NUMA_PERIOD_SLOTS / (local + remote).max(1);
    let diff: i64 = if ratio >= NUMA_PERIOD_THRESHOLD {
        let slot = (ratio - NUMA_PERIOD_THRESHOLD).max(1) as i64;
        slot * period_slot
    } else {
        let diff = -((NUMA_PERIOD_THRESHOLD - ratio) as i64) * period_slot;
        let private_ratio = (private * NUMA_PERIOD_SLOTS).div_ceil(private + shared + 1) as i64;
        diff * private_ratio / NUMA_PERIOD_SLOTS as i64
    };

    stats.scan_period_ms = (period as i64 + diff).clamp(min as i64, max as i64) as u64;
    stats.scan_period_ms
}

/// Placement towards the preferred memory node
#[derive(Debug, Clone)]
pub struct NumaPlacement {
    params: NumaParams,
}

impl NumaPlacement {
    /// Create with the given knobs
    pub fn new(params: NumaParams) -> Self {
        Self { params }
    }

    /// Knobs in use
    pub fn params(&self) -> &NumaParams {
        &self.params
    }
}

impl PlacementPolicy for NumaPlacement {
    fn name(&self) -> &'static str {
        "numa"
    }

    fn select_task_rq(&self, env: &PlacementEnv<'_>, p: &WakeContext) -> Placement {
        let fair = FairPlacement.select_task_rq(env, p);
        if p.task.nr_cpus_allowed() == 1 {
            return fair;
        }
        let Some(node) = p.task.numa.lock().preferred_node else {
            return fair;
        };
        if node >= env.topo.nr_nodes() || env.topo.node_of(fair.cpu) == node {
            return fair;
        }

        let candidates = env.allowed(&p.task).and(env.topo.node_mask(node));
        if candidates.contains(p.prev_cpu) && env.idle_cpu(p.prev_cpu) {
            return Placement { cpu: p.prev_cpu, affine: fair.affine };
        }
        let idle = candidates
            .iter()
            .filter(|&cpu| env.idle_cpu(cpu))
            .max_by_key(|&cpu| (env.rq(cpu).idle_stamp(), core::cmp::Reverse(cpu)));
        match idle {
            Some(cpu) => Placement { cpu, affine: fair.affine },
            None => fair,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Machine;
    use crate::topology::{CpuMask, SdFlags, TopologySpec};
    use alloc::vec;

    #[test]
    fn test_preferred_node_hysteresis() {
        let params = NumaParams::default();
        let mut stats = NumaFaults::default();
        assert_eq!(task_numa_placement(&mut stats, &[10, 40], &params), Some(1));
        // Node 0 catches up but not by 3/8
        assert_eq!(task_numa_placement(&mut stats, &[30, 12], &params), Some(1));
        assert_eq!(stats.faults, vec![35, 32]);
        assert_eq!(task_numa_placement(&mut stats, &[60, 0], &params), Some(0));
    }

    #[test]
    fn test_no_faults_keeps_preference() {
        let params = NumaParams::default();
        let mut stats = NumaFaults { preferred_node: Some(1), ..Default::default() };
        assert_eq!(task_numa_placement(&mut stats, &[0, 0], &params), Some(1));
    }

    #[test]
    fn test_scan_period_adapts() {
        let params = NumaParams::default();
        let mut stats = NumaFaults::default();
        assert_eq!(update_task_scan_period(&mut stats, 0, 0, 0, 0, &params), 2000);
        // All local: slow down by three slots
        assert_eq!(update_task_scan_period(&mut stats, 100, 0, 0, 100, &params), 2600);
        // All remote and private: speed up by seven slots, down to the floor
        assert_eq!(update_task_scan_period(&mut stats, 0, 100, 1, 100, &params), 1000);
        stats.scan_period_ms = 59_000;
        assert_eq!(update_task_scan_period(&mut stats, 0, 0, 0, 0, &params), 60_000);
    }

    #[test]
    fn test_wakeup_moves_to_preferred_node() {
        let m = Machine::new(TopologySpec::symmetric(2, 2, 1), 4, &[]);
        let shared = m.shared();
        let env = m.env(&shared);
        let p = m.wake_context(1, CpuMask::first(4), 0, 0, SdFlags::BALANCE_WAKE);
        let policy = NumaPlacement::new(NumaParams::default());
        assert_eq!(policy.select_task_rq(&env, &p).cpu, 0);

        p.task.numa.lock().preferred_node = Some(1);
        let cpu = policy.select_task_rq(&env, &p).cpu;
        assert_eq!(env.topo.node_of(cpu), 1);
    }
}
