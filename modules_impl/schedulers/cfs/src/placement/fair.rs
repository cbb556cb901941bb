//! Load-driven placement.
//!
//! Wakeups are pulled next to the waker when the waker's CPU can take
//! the load ("affine" wakeups), then moved to an idle sibling sharing
//! the cache. Forks and wakeups in domains that ask for it descend the
//! domain tree towards the idlest group and CPU.

use super::{AffineAttempt, Placement, PlacementEnv, PlacementPolicy, WakeContext};
use crate::topology::{CpuMask, SchedDomain, SchedGroup, SdFlags};
use crate::weight::SCHED_CAPACITY_SCALE;

/// Default placement
#[derive(Debug, Clone, Copy, Default)]
pub struct FairPlacement;

impl PlacementPolicy for FairPlacement {
    fn name(&self) -> &'static str {
        "fair"
    }

    fn select_task_rq(&self, env: &PlacementEnv<'_>, p: &WakeContext) -> Placement {
        let prev_cpu = p.prev_cpu;
        let mut cpu = p.this_cpu;
        let mut new_cpu = prev_cpu;

        if p.task.nr_cpus_allowed() == 1 {
            return Placement::at(prev_cpu);
        }

        let want_affine = p.is_wakeup() && !wake_wide(env, p) && p.task.allows(cpu);

        let mut affine_sd: Option<&SchedDomain> = None;
        let mut sd: Option<usize> = None;
        for tmp in env.topo.domains(cpu) {
            if !tmp.has(SdFlags::LOAD_BALANCE) {
                break;
            }
            // Both CPUs in the domain: the waker's CPU is a valid target
            if want_affine && tmp.has(SdFlags::WAKE_AFFINE) && tmp.span.contains(prev_cpu) {
                affine_sd = Some(tmp);
                break;
            }
            if tmp.has(p.sd_flag) {
                sd = Some(tmp.level);
            } else if !want_affine {
                break;
            }
        }

        let mut affine = None;
        if let Some(asd) = affine_sd {
            sd = None;
            if cpu != prev_cpu {
                let pulled = wake_affine(env, asd, p);
                affine = Some(AffineAttempt { level: asd.level, pulled });
                if pulled {
                    new_cpu = cpu;
                }
            }
        }

        if sd.is_none() {
            if p.is_wakeup() {
                new_cpu = select_idle_sibling(env, p, new_cpu);
            }
            return Placement { cpu: new_cpu, affine };
        }

        while let Some(level) = sd {
            let domains = env.topo.domains(cpu);
            let Some(domain) = domains.get(level) else {
                break;
            };
            let child = level.checked_sub(1);
            if !domain.has(p.sd_flag) {
                sd = child;
                continue;
            }
            let Some(group) = find_idlest_group(env, domain, p, cpu) else {
                sd = child;
                continue;
            };
            let target = find_idlest_cpu(env, group, p, cpu);
            if target == cpu {
                sd = child;
                continue;
            }

            // Continue below the level just balanced, on the new CPU
            new_cpu = target;
            cpu = target;
            let weight = domain.weight();
            sd = None;
            for tmp in env.topo.domains(cpu) {
                if weight <= tmp.weight() {
                    break;
                }
                if tmp.has(p.sd_flag) {
                    sd = Some(tmp.level);
                }
            }
        }

        log::debug!("[cfs] place {}: prev cpu{} -> cpu{}", p.task.id, prev_cpu, new_cpu);
        Placement { cpu: new_cpu, affine }
    }
}

/// Whether waker and wakee form a many-to-many relationship wider than
/// the cache domain, in which case the wakee should not be pulled
pub fn wake_wide(env: &PlacementEnv<'_>, p: &WakeContext) -> bool {
    let Some(waker) = &p.waker else {
        return false;
    };
    let mut master = waker.wakee_flips;
    let mut slave = p.wakee_flips;
    let factor = env.topo.llc_size(p.this_cpu);
    if master < slave {
        core::mem::swap(&mut master, &mut slave);
    }
    !(slave < factor || master < slave.saturating_mul(factor))
}

/// Whether the waking CPU can take the task without becoming busier
/// than the previous CPU, within half the domain's imbalance margin
pub fn wake_affine(env: &PlacementEnv<'_>, sd: &SchedDomain, p: &WakeContext) -> bool {
    let idx = sd.wake_idx;
    let this_cpu = p.this_cpu;
    let prev_cpu = p.prev_cpu;
    let mut load = env.source_load(prev_cpu, idx) as i64;
    let mut this_load = env.target_load(this_cpu, idx) as i64;

    // A sync waker is about to sleep; discount it from its CPU
    if p.sync() {
        if let Some(waker) = &p.waker {
            let weight = waker.load_avg as i64;
            this_load += env.effective_load(&waker.group, this_cpu, -weight, -weight);
            load += env.effective_load(&waker.group, prev_cpu, 0, -weight);
        }
    }

    let weight = p.load_avg as i64;
    let mut this_eff_load = 100 * env.capacity_of(prev_cpu) as i64;
    let mut prev_eff_load = (100 + (sd.imbalance_pct as i64 - 100) / 2) * env.capacity_of(this_cpu) as i64;

    if this_load > 0 {
        this_eff_load *= this_load + env.effective_load(&p.group, this_cpu, weight, weight);
        prev_eff_load *= load + env.effective_load(&p.group, prev_cpu, 0, weight);
    }

    this_eff_load <= prev_eff_load
}

/// Least loaded group of `sd` that is clearly less loaded than the
/// local group, if any
pub fn find_idlest_group<'d>(
    env: &PlacementEnv<'_>,
    sd: &'d SchedDomain,
    p: &WakeContext,
    this_cpu: usize,
) -> Option<&'d SchedGroup> {
    let allowed = env.allowed(&p.task);
    let load_idx = if p.is_wakeup() { sd.wake_idx } else { sd.forkexec_idx };
    let imbalance = 100 + (sd.imbalance_pct - 100) / 2;

    let mut idlest = None;
    let mut min_load = u64::MAX;
    let mut this_load = 0;
    for group in &sd.groups {
        if !group.span.intersects(allowed) {
            continue;
        }
        let local = group.span.contains(this_cpu);

        let mut avg_load: u64 = group
            .span
            .iter()
            .map(|i| if local { env.source_load(i, load_idx) } else { env.target_load(i, load_idx) })
            .sum();
        avg_load = avg_load * SCHED_CAPACITY_SCALE / group.capacity().max(1);

        if local {
            this_load = avg_load;
        } else if avg_load < min_load {
            min_load = avg_load;
            idlest = Some(group);
        }
    }

    match idlest {
        Some(g) if 100 * this_load >= imbalance * min_load => Some(g),
        _ => None,
    }
}

/// Idlest allowed CPU of `group`: the most recently idled idle CPU, else
/// the least loaded one, preferring `this_cpu` on ties
pub fn find_idlest_cpu(env: &PlacementEnv<'_>, group: &SchedGroup, p: &WakeContext, this_cpu: usize) -> usize {
    if group.span.weight() == 1 {
        return group.span.first_cpu().unwrap_or(this_cpu);
    }

    let mut min_load = u64::MAX;
    let mut least_loaded = this_cpu;
    let mut latest_idle_stamp = 0;
    let mut shallowest_idle: Option<usize> = None;

    for i in group.span.and(env.allowed(&p.task)).iter() {
        if env.idle_cpu(i) {
            let stamp = env.rq(i).idle_stamp();
            if shallowest_idle.is_none() || stamp > latest_idle_stamp {
                latest_idle_stamp = stamp;
                shallowest_idle = Some(i);
            }
        } else {
            let load = env.weighted_cpuload(i);
            if load < min_load || (load == min_load && i == this_cpu) {
                min_load = load;
                least_loaded = i;
            }
        }
    }

    shallowest_idle.unwrap_or(least_loaded)
}

/// Idle CPU near `target`: `target` itself, the previous CPU if it
/// shares the cache, or a fully idle group of the cache domain
pub fn select_idle_sibling(env: &PlacementEnv<'_>, p: &WakeContext, target: usize) -> usize {
    if env.idle_cpu(target) {
        return target;
    }

    let prev = p.prev_cpu;
    if prev != target && env.topo.cpus_share_cache(prev, target) && env.idle_cpu(prev) && p.task.allows(prev) {
        return prev;
    }

    let Some(llc) = env.topo.llc_level(target) else {
        return target;
    };
    let allowed: CpuMask = env.allowed(&p.task);
    let domains = env.topo.domains(target);
    for level in (0..=llc).rev() {
        let Some(sd) = domains.get(level) else {
            continue;
        };
        for sg in &sd.groups {
            if !sg.span.intersects(allowed) {
                continue;
            }
            if sg.span.iter().any(|i| i == target || !env.idle_cpu(i)) {
                continue;
            }
            if let Some(cpu) = sg.span.and(allowed).first_cpu() {
                return cpu;
            }
        }
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::WakerInfo;
    use crate::task::WakeFlags;
    use crate::test_support::Machine;
    use crate::topology::TopologySpec;

    #[test]
    fn test_pinned_task_stays() {
        let mut m = Machine::new(TopologySpec::flat(), 4, &[]);
        m.set_load(2, 3, 3072);
        let shared = m.shared();
        let env = m.env(&shared);
        let p = m.wake_context(1, CpuMask::single(2), 2, 0, SdFlags::BALANCE_WAKE);
        assert_eq!(FairPlacement.select_task_rq(&env, &p).cpu, 2);
    }

    #[test]
    fn test_wakeup_prefers_idle_target() {
        let mut m = Machine::new(TopologySpec::flat(), 4, &[]);
        m.set_load(0, 1, 1024);
        m.set_load(1, 2, 2048);
        let shared = m.shared();
        let env = m.env(&shared);
        // prev cpu1 busy, waker cpu0 busy: an idle cpu in the cache wins
        let p = m.wake_context(1, CpuMask::first(4), 1, 0, SdFlags::BALANCE_WAKE);
        let cpu = FairPlacement.select_task_rq(&env, &p).cpu;
        assert!(cpu == 2 || cpu == 3, "picked cpu{}", cpu);
    }

    #[test]
    fn test_idle_prev_sharing_cache_wins() {
        let mut m = Machine::new(TopologySpec::flat(), 4, &[]);
        for cpu in [0, 2, 3] {
            m.set_load(cpu, 1, 1024);
        }
        let shared = m.shared();
        let env = m.env(&shared);
        let p = m.wake_context(1, CpuMask::first(4), 1, 0, SdFlags::BALANCE_WAKE);
        assert_eq!(select_idle_sibling(&env, &p, 0), 1);
    }

    #[test]
    fn test_wake_wide_needs_both_sides() {
        let m = Machine::new(TopologySpec::flat(), 4, &[]);
        let shared = m.shared();
        let env = m.env(&shared);
        let mut p = m.wake_context(1, CpuMask::first(4), 1, 0, SdFlags::BALANCE_WAKE);
        p.waker = Some(WakerInfo { group: m.table.root(), load_avg: 1024, wakee_flips: 40 });
        p.wakee_flips = 2;
        assert!(!wake_wide(&env, &p));
        p.wakee_flips = 8;
        assert!(wake_wide(&env, &p));
        p.waker = None;
        assert!(!wake_wide(&env, &p));
    }

    #[test]
    fn test_sync_wakeup_pulls_to_waker() {
        let mut m = Machine::new(TopologySpec::flat(), 2, &[]);
        // Waker alone on cpu0, prev cpu1 busy with two tasks
        m.set_load(0, 1, 1024);
        m.set_load(1, 2, 2048);
        let shared = m.shared();
        let env = m.env(&shared);
        let mut p = m.wake_context(9, CpuMask::first(2), 1, 0, SdFlags::BALANCE_WAKE);
        p.wake_flags = WakeFlags::SYNC;
        p.waker = Some(WakerInfo { group: m.table.root(), load_avg: 1024, wakee_flips: 0 });
        let sd = &env.topo.domains(0)[0];
        assert!(wake_affine(&env, sd, &p));
    }

    #[test]
    fn test_affine_rejected_when_waker_cpu_heavy() {
        let mut m = Machine::new(TopologySpec::flat(), 2, &[]);
        m.set_load(0, 4, 4096);
        m.set_load(1, 1, 1024);
        let shared = m.shared();
        let env = m.env(&shared);
        let p = m.wake_context(9, CpuMask::first(2), 1, 0, SdFlags::BALANCE_WAKE);
        let sd = &env.topo.domains(0)[0];
        assert!(!wake_affine(&env, sd, &p));
    }

    #[test]
    fn test_fork_descends_to_idle_package() {
        // Two packages of two cores
        let mut m = Machine::new(TopologySpec::symmetric(2, 2, 1), 4, &[]);
        m.set_load(0, 2, 2048);
        m.set_load(1, 2, 2048);
        m.set_idle(3, 5_000);
        m.set_idle(2, 1_000);
        let shared = m.shared();
        let env = m.env(&shared);
        let p = m.wake_context(1, CpuMask::first(4), 0, 0, SdFlags::BALANCE_FORK);
        let cpu = FairPlacement.select_task_rq(&env, &p).cpu;
        assert!(cpu == 2 || cpu == 3, "picked cpu{}", cpu);
    }

    #[test]
    fn test_idlest_cpu_never_busy_qualifies() {
        let mut m = Machine::new(TopologySpec::flat(), 3, &[]);
        m.set_load(0, 1, 1024);
        let shared = m.shared();
        let env = m.env(&shared);
        let p = m.wake_context(1, CpuMask::first(3), 0, 0, SdFlags::BALANCE_FORK);
        let group = SchedGroup { span: CpuMask::first(3), sgc: env.topo.domains(0)[0].groups[0].sgc.clone() };
        let cpu = find_idlest_cpu(&env, &group, &p, 0);
        assert_eq!(cpu, 1);
    }
}
