//! Domain statistics and the busiest-group search.
//!
//! Everything here reads the lock-free figures of [`PlacementEnv`]: a
//! balance attempt decides what to move before it takes the lock of the
//! CPU it moves from.

use super::LbEnv;
use crate::placement::PlacementEnv;
use crate::rq::CpuIdleType;
use crate::topology::{SchedDomain, SchedGroup};
use crate::weight::{NICE_0_LOAD, SCHED_CAPACITY_SCALE};
use core::sync::atomic::Ordering;

/// Classification of a group, in increasing order of urgency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupType {
    /// Nothing special
    #[default]
    Other = 0,
    /// Left imbalanced by an earlier attempt because of affinity
    Imbalanced = 1,
    /// More tasks than CPUs and no spare capacity
    Overloaded = 2,
}

/// Figures of one group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgLbStats {
    /// Load scaled by the group's capacity
    pub avg_load: u64,
    /// Summed (biased) load of the member CPUs
    pub group_load: u64,
    /// Summed current load of the member CPUs
    pub sum_weighted_load: u64,
    /// Average load of one task
    pub load_per_task: u64,
    /// Capacity of the group
    pub group_capacity: u64,
    /// Summed utilization
    pub group_util: u64,
    /// Tasks queued in the group
    pub sum_nr_running: u32,
    /// Idle member CPUs
    pub idle_cpus: u32,
    /// Member CPUs
    pub group_weight: u32,
    /// Classification
    pub group_type: GroupType,
    /// No spare capacity left
    pub group_no_capacity: bool,
}

/// Figures of a whole domain
#[derive(Debug, Clone, Default)]
pub struct SdLbStats {
    /// Index of the busiest group in the domain's group list
    pub busiest: Option<usize>,
    /// Index of the group holding the destination CPU
    pub local: Option<usize>,
    /// Figures of the local group
    pub local_stat: SgLbStats,
    /// Figures of the busiest group
    pub busiest_stat: SgLbStats,
    /// Summed load of all groups
    pub total_load: u64,
    /// Summed capacity of all groups
    pub total_capacity: u64,
    /// Domain-wide load per capacity unit
    pub avg_load: u64,
}

/// Load index of `sd` for a balance of type `idle`
pub fn get_sd_load_idx(sd: &SchedDomain, idle: CpuIdleType) -> usize {
    match idle {
        CpuIdleType::NotIdle => sd.busy_idx,
        CpuIdleType::NewlyIdle => sd.newidle_idx,
        CpuIdleType::Idle => sd.idle_idx,
    }
}

/// Whether the group could take on more work
pub fn group_has_capacity(sd: &SchedDomain, sgs: &SgLbStats) -> bool {
    if sgs.sum_nr_running < sgs.group_weight {
        return true;
    }
    sgs.group_capacity * 100 > sgs.group_util * sd.imbalance_pct
}

/// Whether the group has more tasks than CPUs and no capacity to spare
pub fn group_is_overloaded(sd: &SchedDomain, sgs: &SgLbStats) -> bool {
    if sgs.sum_nr_running <= sgs.group_weight {
        return false;
    }
    sgs.group_capacity * 100 < sgs.group_util * sd.imbalance_pct
}

fn group_classify(group: &SchedGroup, sgs: &SgLbStats) -> GroupType {
    if sgs.group_no_capacity {
        GroupType::Overloaded
    } else if group.sgc.is_imbalanced() {
        GroupType::Imbalanced
    } else {
        GroupType::Other
    }
}

/// Refresh the capacity of the group holding `cpu` from what its CPUs
/// have left for fair tasks
pub fn update_group_capacity(penv: &PlacementEnv<'_>, sd: &SchedDomain, cpu: usize) {
    let Some(group) = sd.group_of(cpu) else {
        return;
    };
    let capacity: u64 = group.span.iter().map(|c| penv.capacity_of(c)).sum();
    group.sgc.capacity.store(capacity.max(1), Ordering::Relaxed);
}

/// Gather the figures of `group`
///
/// `overload` is raised when any member CPU has more than one task.
pub fn update_sg_lb_stats(
    penv: &PlacementEnv<'_>,
    env: &LbEnv<'_>,
    group: &SchedGroup,
    load_idx: usize,
    local_group: bool,
    overload: &mut bool,
) -> SgLbStats {
    let mut sgs = SgLbStats::default();
    for cpu in group.span.and(env.cpus).iter() {
        // Bias towards keeping load where it is
        let load = if local_group { penv.target_load(cpu, load_idx) } else { penv.source_load(cpu, load_idx) };
        let rq = penv.rq(cpu);
        sgs.group_load += load;
        sgs.group_util += penv.cpu_util(cpu);
        sgs.sum_nr_running += rq.h_nr_running();
        if rq.nr_running() > 1 {
            *overload = true;
        }
        sgs.sum_weighted_load += penv.weighted_cpuload(cpu);
        if penv.idle_cpu(cpu) {
            sgs.idle_cpus += 1;
        }
    }

    sgs.group_capacity = group.capacity().max(1);
    sgs.avg_load = sgs.group_load * SCHED_CAPACITY_SCALE / sgs.group_capacity;
    if sgs.sum_nr_running > 0 {
        sgs.load_per_task = sgs.sum_weighted_load / sgs.sum_nr_running as u64;
    }
    sgs.group_weight = group.span.weight();
    sgs.group_no_capacity = group_is_overloaded(env.sd, &sgs);
    sgs.group_type = group_classify(group, &sgs);
    sgs
}

/// Whether `sgs` beats the busiest group found so far
fn update_sd_pick_busiest(sds: &SdLbStats, sgs: &SgLbStats) -> bool {
    let busiest = &sds.busiest_stat;
    if sgs.group_type != busiest.group_type {
        return sgs.group_type > busiest.group_type;
    }
    sgs.avg_load > busiest.avg_load
}

/// Gather the figures of every group of the domain
///
/// Sets `env.overload` when some CPU in the domain has work to spare.
pub fn update_sd_lb_stats(penv: &PlacementEnv<'_>, env: &mut LbEnv<'_>) -> SdLbStats {
    let sd = env.sd;
    let load_idx = get_sd_load_idx(sd, env.idle);
    let mut sds = SdLbStats::default();
    let mut overload = false;

    for (idx, group) in sd.groups.iter().enumerate() {
        let local_group = group.span.contains(env.dst_cpu);
        if local_group {
            update_group_capacity(penv, sd, env.dst_cpu);
        }
        let mut sgs = update_sg_lb_stats(penv, env, group, load_idx, local_group, &mut overload);

        if local_group {
            sds.local = Some(idx);
            sds.total_load += sgs.group_load;
            sds.total_capacity += sgs.group_capacity;
            sds.local_stat = sgs;
            continue;
        }

        // Siblings first: move excess tasks away while the local group
        // has room for them
        if sd.child_prefers_sibling
            && sds.local.is_some()
            && group_has_capacity(sd, &sds.local_stat)
            && sgs.sum_nr_running > 1
        {
            sgs.group_no_capacity = true;
            sgs.group_type = group_classify(group, &sgs);
        }

        sds.total_load += sgs.group_load;
        sds.total_capacity += sgs.group_capacity;
        if update_sd_pick_busiest(&sds, &sgs) {
            sds.busiest = Some(idx);
            sds.busiest_stat = sgs;
        }
    }

    env.overload = overload;
    sds
}

/// Imbalance too small for the averages to justify a move: move one
/// task if that raises the capacity used
fn fix_small_imbalance(penv: &PlacementEnv<'_>, env: &mut LbEnv<'_>, sds: &mut SdLbStats) {
    let local = &mut sds.local_stat;
    let busiest = &sds.busiest_stat;
    let mut imbn = 2;

    if local.sum_nr_running == 0 {
        local.load_per_task = penv.rq(env.dst_cpu).load_per_task();
    } else if busiest.load_per_task > local.load_per_task {
        imbn = 1;
    }

    let scaled_busy_load_per_task = busiest.load_per_task * SCHED_CAPACITY_SCALE / busiest.group_capacity;
    if busiest.avg_load + scaled_busy_load_per_task >= local.avg_load + scaled_busy_load_per_task * imbn {
        env.imbalance = busiest.load_per_task as i64;
        return;
    }

    let mut capa_now = busiest.group_capacity * busiest.load_per_task.min(busiest.avg_load);
    capa_now += local.group_capacity * local.load_per_task.min(local.avg_load);
    capa_now /= SCHED_CAPACITY_SCALE;

    // Load taken off the busiest group
    let mut capa_move = 0;
    if busiest.avg_load > scaled_busy_load_per_task {
        capa_move +=
            busiest.group_capacity * busiest.load_per_task.min(busiest.avg_load - scaled_busy_load_per_task);
    }

    // Load added to the local group
    let tmp = if busiest.avg_load * busiest.group_capacity < busiest.load_per_task * SCHED_CAPACITY_SCALE {
        busiest.avg_load * busiest.group_capacity / local.group_capacity
    } else {
        busiest.load_per_task * SCHED_CAPACITY_SCALE / local.group_capacity
    };
    capa_move += local.group_capacity * local.load_per_task.min(local.avg_load + tmp);
    capa_move /= SCHED_CAPACITY_SCALE;

    if capa_move > capa_now {
        env.imbalance = busiest.load_per_task as i64;
    }
}

/// Load to move so that neither side crosses the domain average
fn calculate_imbalance(penv: &PlacementEnv<'_>, env: &mut LbEnv<'_>, sds: &mut SdLbStats) {
    if sds.busiest_stat.group_type == GroupType::Imbalanced {
        // Group-wide averages are meaningless here
        sds.busiest_stat.load_per_task = sds.busiest_stat.load_per_task.min(sds.avg_load);
    }

    let local = &sds.local_stat;
    let busiest = &sds.busiest_stat;
    if busiest.avg_load <= sds.avg_load || local.avg_load >= sds.avg_load {
        env.imbalance = 0;
        return fix_small_imbalance(penv, env, sds);
    }

    // Between overloaded groups, do not create idle CPUs
    let mut load_above_capacity = u64::MAX;
    if busiest.group_type == GroupType::Overloaded && local.group_type == GroupType::Overloaded {
        let load = busiest.sum_nr_running as u64 * NICE_0_LOAD;
        if load > busiest.group_capacity {
            load_above_capacity = load - busiest.group_capacity;
        }
    }

    let max_pull = (busiest.avg_load - sds.avg_load).min(load_above_capacity);
    let imbalance = max_pull
        .saturating_mul(busiest.group_capacity)
        .min((sds.avg_load - local.avg_load) * local.group_capacity)
        / SCHED_CAPACITY_SCALE;
    env.imbalance = imbalance as i64;

    if imbalance < busiest.load_per_task {
        fix_small_imbalance(penv, env, sds);
    }
}

/// Find the group to pull from and set `env.imbalance`; `None` when
/// the domain is balanced
pub fn find_busiest_group(penv: &PlacementEnv<'_>, env: &mut LbEnv<'_>) -> Option<usize> {
    let mut sds = update_sd_lb_stats(penv, env);
    let sd = env.sd;

    let Some(busiest_idx) = sds.busiest else {
        env.imbalance = 0;
        return None;
    };
    if sds.busiest_stat.sum_nr_running == 0 {
        env.imbalance = 0;
        return None;
    }
    sds.avg_load = SCHED_CAPACITY_SCALE * sds.total_load / sds.total_capacity.max(1);

    let local = &sds.local_stat;
    let busiest = &sds.busiest_stat;
    let force = busiest.group_type == GroupType::Imbalanced
        // A newly idle CPU with room takes from a group without any
        || (env.idle == CpuIdleType::NewlyIdle && group_has_capacity(sd, local) && busiest.group_no_capacity);

    if !force {
        let balanced = if local.avg_load >= busiest.avg_load || local.avg_load >= sds.avg_load {
            true
        } else if env.idle == CpuIdleType::Idle {
            busiest.group_type != GroupType::Overloaded && local.idle_cpus <= busiest.idle_cpus + 1
        } else {
            100 * busiest.avg_load <= sd.imbalance_pct * local.avg_load
        };
        if balanced {
            env.imbalance = 0;
            return None;
        }
    }

    calculate_imbalance(penv, env, &mut sds);
    log::trace!(
        "[cfs] cpu{}: busiest group {:?} of level {}, imbalance {}",
        env.dst_cpu,
        sd.groups[busiest_idx].span,
        sd.level,
        env.imbalance
    );
    Some(busiest_idx)
}

/// Whether `cpu` lost a noticeable part of its capacity
pub fn check_cpu_capacity(penv: &PlacementEnv<'_>, cpu: usize, sd: &SchedDomain) -> bool {
    let rq = penv.rq(cpu);
    rq.capacity() * sd.imbalance_pct < rq.capacity_orig() * 100
}

/// CPU of `group` with the most load per capacity unit
///
/// A CPU running a single task heavier than the imbalance is left alone
/// unless it lost capacity: moving that task would only move the
/// imbalance.
pub fn find_busiest_queue(penv: &PlacementEnv<'_>, env: &LbEnv<'_>, group: &SchedGroup) -> Option<usize> {
    let mut busiest = None;
    let mut busiest_load: u64 = 0;
    let mut busiest_capacity: u64 = 1;
    for cpu in group.span.and(env.cpus).iter() {
        let capacity = penv.capacity_of(cpu);
        let wl = penv.weighted_cpuload(cpu);
        if penv.rq(cpu).nr_running() == 1 && wl as i64 > env.imbalance && !check_cpu_capacity(penv, cpu, env.sd) {
            continue;
        }
        if wl * busiest_capacity > busiest_load * capacity {
            busiest_load = wl;
            busiest_capacity = capacity;
            busiest = Some(cpu);
        }
    }
    busiest
}

/// Whether the destination CPU is the one of its group that balances
/// this domain: its first idle CPU, or the group's balance CPU when
/// none is idle
pub fn should_we_balance(penv: &PlacementEnv<'_>, env: &LbEnv<'_>) -> bool {
    if env.idle == CpuIdleType::NewlyIdle {
        return true;
    }
    let Some(group) = env.sd.groups.first() else {
        return false;
    };
    let balance_cpu = group
        .span
        .and(env.cpus)
        .iter()
        .find(|&cpu| penv.idle_cpu(cpu))
        .unwrap_or_else(|| group.balance_cpu());
    balance_cpu == env.dst_cpu
}

/// Whether a failed attempt should escalate to pushing the running task
pub fn need_active_balance(penv: &PlacementEnv<'_>, env: &LbEnv<'_>, threshold: u32) -> bool {
    let sd = env.sd;
    if env.idle != CpuIdleType::NotIdle
        && penv.rq(env.src_cpu).h_nr_running() == 1
        && check_cpu_capacity(penv, env.src_cpu, sd)
        && penv.capacity_of(env.src_cpu) * sd.imbalance_pct < penv.capacity_of(env.dst_cpu) * 100
    {
        return true;
    }
    env.nr_balance_failed > sd.cache_nice_tries + threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Machine;
    use crate::topology::{CpuMask, LevelKind, TopologySpec};
    use alloc::vec;

    fn env_for<'a>(m: &'a Machine, cpu: usize, level: usize, idle: CpuIdleType) -> LbEnv<'a> {
        let sd = m.topo().domain(cpu, level).unwrap();
        LbEnv::new(sd, cpu, idle, sd.span)
    }

    #[test]
    fn test_load_idx_by_idle_type() {
        let m = Machine::new(TopologySpec::symmetric(2, 2, 1), 4, &[]);
        let numa = m.topo().domain(0, 1).unwrap();
        assert_eq!(get_sd_load_idx(numa, CpuIdleType::NotIdle), 3);
        assert_eq!(get_sd_load_idx(numa, CpuIdleType::Idle), 2);
        assert_eq!(get_sd_load_idx(numa, CpuIdleType::NewlyIdle), 0);
    }

    #[test]
    fn test_overloaded_group_found_by_idle_cpu() {
        let mut m = Machine::new(TopologySpec::flat(), 2, &[]);
        m.set_load(0, 2, 2048);
        m.set_util(0, 1024);
        let shared = m.shared();
        let penv = m.env(&shared);
        let mut env = env_for(&m, 1, 0, CpuIdleType::Idle);

        let sds = update_sd_lb_stats(&penv, &mut env);
        assert_eq!(sds.local, Some(0));
        assert_eq!(sds.busiest, Some(1));
        assert_eq!(sds.busiest_stat.group_type, GroupType::Overloaded);
        assert_eq!(sds.local_stat.idle_cpus, 1);
        assert!(env.overload);

        let group = find_busiest_group(&penv, &mut env).unwrap();
        // Half of the 2048 brings both sides to the average
        assert_eq!(env.imbalance, 1024);
        assert_eq!(find_busiest_queue(&penv, &env, &env.sd.groups[group]), Some(0));
    }

    #[test]
    fn test_small_difference_is_balanced() {
        let mut m = Machine::new(TopologySpec::flat(), 2, &[]);
        m.set_load(0, 1, 1100);
        m.set_load(1, 1, 1000);
        let shared = m.shared();
        let penv = m.env(&shared);
        let mut env = env_for(&m, 1, 0, CpuIdleType::NewlyIdle);
        assert_eq!(find_busiest_group(&penv, &mut env), None);
        assert_eq!(env.imbalance, 0);
    }

    #[test]
    fn test_imbalanced_group_wins_over_load() {
        let mut m = Machine::new(TopologySpec::flat(), 3, &[]);
        m.set_load(0, 1, 1024);
        m.set_load(1, 1, 1500);
        let sd = m.topo().domain(2, 0).unwrap();
        let pinned = sd.group_of(0).unwrap();
        pinned.sgc.set_imbalanced(true);
        let shared = m.shared();
        let penv = m.env(&shared);
        let mut env = env_for(&m, 2, 0, CpuIdleType::Idle);
        let sds = update_sd_lb_stats(&penv, &mut env);
        let busiest = sds.busiest.unwrap();
        assert!(sd.groups[busiest].span.contains(0));
        assert_eq!(sds.busiest_stat.group_type, GroupType::Imbalanced);
        pinned.sgc.set_imbalanced(false);
    }

    #[test]
    fn test_fix_small_imbalance_moves_one_task() {
        let mut m = Machine::new(TopologySpec::flat(), 2, &[]);
        // Two tasks against one: the averages ask for half a task
        m.set_load(0, 2, 2048);
        m.set_load(1, 1, 1024);
        let shared = m.shared();
        let penv = m.env(&shared);
        let mut env = env_for(&m, 1, 0, CpuIdleType::NewlyIdle);
        find_busiest_group(&penv, &mut env).unwrap();
        assert_eq!(env.imbalance, 1024);
    }

    #[test]
    fn test_single_heavy_task_not_busiest_queue() {
        let spec = TopologySpec::flat()
            .level(LevelKind::Smt, vec![vec![0, 1], vec![2, 3]])
            .level(LevelKind::Mc, vec![vec![0, 1, 2, 3]]);
        let mut m = Machine::new(spec, 4, &[]);
        m.set_load(0, 1, 3000);
        m.set_load(1, 2, 1500);
        let shared = m.shared();
        let penv = m.env(&shared);
        let mut env = env_for(&m, 2, 1, CpuIdleType::Idle);
        env.imbalance = 1000;
        let remote = env.sd.group_of(0).unwrap();
        assert_eq!(find_busiest_queue(&penv, &env, remote), Some(1));
    }

    #[test]
    fn test_should_we_balance_elects_one_cpu() {
        let spec = TopologySpec::flat()
            .level(LevelKind::Smt, vec![vec![0, 1], vec![2, 3]])
            .level(LevelKind::Mc, vec![vec![0, 1, 2, 3]]);
        let mut m = Machine::new(spec, 4, &[]);
        for cpu in 0..4 {
            m.set_load(cpu, 1, 1024);
        }
        {
            let shared = m.shared();
            let penv = m.env(&shared);
            // Nobody idle: the group's first CPU balances
            assert!(should_we_balance(&penv, &env_for(&m, 2, 1, CpuIdleType::NotIdle)));
            assert!(!should_we_balance(&penv, &env_for(&m, 3, 1, CpuIdleType::NotIdle)));
            assert!(should_we_balance(&penv, &env_for(&m, 3, 1, CpuIdleType::NewlyIdle)));
        }
        m.set_load(3, 0, 0);
        let shared = m.shared();
        let penv = m.env(&shared);
        assert!(should_we_balance(&penv, &env_for(&m, 3, 1, CpuIdleType::Idle)));
        assert!(!should_we_balance(&penv, &env_for(&m, 2, 1, CpuIdleType::NotIdle)));
    }

    #[test]
    fn test_capacity_pressure() {
        let mut m = Machine::new(TopologySpec::flat(), 2, &[]);
        m.set_load(0, 1, 1024);
        m.rqs[0].capacity = 600;
        m.rqs[0].publish();
        let shared = m.shared();
        let penv = m.env(&shared);
        let sd = m.topo().domain(1, 0).unwrap();
        assert!(check_cpu_capacity(&penv, 0, sd));
        assert!(!check_cpu_capacity(&penv, 1, sd));

        let mut env = LbEnv::new(sd, 1, CpuIdleType::Idle, CpuMask::first(2));
        env.src_cpu = 0;
        // A lone task on a squeezed CPU is pushed to a full one
        assert!(need_active_balance(&penv, &env, 10));
        env.idle = CpuIdleType::NotIdle;
        assert!(!need_active_balance(&penv, &env, 10));
        env.nr_balance_failed = sd.cache_nice_tries + 11;
        assert!(need_active_balance(&penv, &env, 10));
    }
}
