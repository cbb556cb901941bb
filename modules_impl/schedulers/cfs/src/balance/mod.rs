//! # Load Balancing
//!
//! Each CPU periodically walks its domains from the lowest level up and,
//! at every level where it is the elected balancer of its group, pulls
//! load from the busiest CPU of the busiest group. The decision is made
//! from published figures; tasks are then detached under the source
//! queue's lock and attached under the destination's, never holding both.
//!
//! A CPU about to go idle runs the same walk with [`CpuIdleType::NewlyIdle`]
//! and stops at the first task pulled. When only the running task of a
//! busy CPU could be moved, the balancer asks that CPU to push it out
//! ([`CfsScheduler::active_load_balance`]).

mod nohz;
mod stats;

pub use nohz::NohzState;
pub use stats::{
    check_cpu_capacity, find_busiest_group, find_busiest_queue, get_sd_load_idx, group_has_capacity,
    group_is_overloaded, need_active_balance, should_we_balance, update_group_capacity, update_sd_lb_stats,
    update_sg_lb_stats, GroupType, SdLbStats, SgLbStats,
};

use crate::config::{SchedFeatures, Tunables};
use crate::group::TaskGroup;
use crate::rq::{CpuIdleType, Ctx, DomainState, MovingTask, Rq};
use crate::scheduler::CfsScheduler;
use crate::task::{TaskPolicy, TaskRef};
use crate::topology::{CpuMask, SchedDomain, SdFlags, Topology};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::Ordering;
use helix_execution::scheduler::{LoadBalancer, Scheduler};
use helix_execution::ThreadId;

/// Tasks examined before the source queue's lock is dropped and retaken
pub const SCHED_NR_MIGRATE_BREAK: u32 = 32;

/// Ceiling of the interval backoff after affinity got in the way (ms)
pub const MAX_PINNED_INTERVAL: u64 = 512;

/// Tasks below this load are left alone unless balancing keeps failing
const LB_MIN_LOAD: u64 = 16;

bitflags! {
    /// Outcome bits of one detach pass
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LbFlags: u32 {
        /// Every task examined was pinned away from the destination
        const ALL_PINNED = 1 << 0;
        /// Loop budget ran out; drop the lock and continue
        const NEED_BREAK = 1 << 1;
        /// Some task could go to another CPU of the destination group
        const DST_PINNED = 1 << 2;
        /// At least one task was pinned away from the destination
        const SOME_PINNED = 1 << 3;
    }
}

/// State of one balance attempt
#[derive(Debug, Clone)]
pub struct LbEnv<'a> {
    /// Domain being balanced
    pub sd: &'a SchedDomain,
    /// CPU pulled from
    pub src_cpu: usize,
    /// CPU pulling
    pub dst_cpu: usize,
    /// CPUs of the destination's group, `None` when newly idle
    pub dst_grpmask: Option<CpuMask>,
    /// Alternative destination found for a pinned task
    pub new_dst_cpu: usize,
    /// Idle state of the destination
    pub idle: CpuIdleType,
    /// Load still to move
    pub imbalance: i64,
    /// CPUs still considered
    pub cpus: CpuMask,
    /// Outcome bits
    pub flags: LbFlags,
    /// Tasks examined so far
    pub loop_count: u32,
    /// Examined-task count at which the lock is dropped
    pub loop_break: u32,
    /// Tasks examined at most
    pub loop_max: u32,
    /// Consecutive failures at this level
    pub nr_balance_failed: u32,
    /// Tasks on the destination when the pass started
    pub dst_nr_running: u32,
    /// Some CPU of the domain has more than one task
    pub overload: bool,
    /// Cache-hot tasks moved anyway
    pub hot_gained: u64,
}

impl<'a> LbEnv<'a> {
    /// Fresh attempt for `dst_cpu` in `sd`, limited to `cpus`
    pub fn new(sd: &'a SchedDomain, dst_cpu: usize, idle: CpuIdleType, cpus: CpuMask) -> Self {
        let dst_grpmask = match idle {
            CpuIdleType::NewlyIdle => None,
            _ => sd.groups.first().map(|g| g.span),
        };
        Self {
            sd,
            src_cpu: dst_cpu,
            dst_cpu,
            dst_grpmask,
            new_dst_cpu: dst_cpu,
            idle,
            imbalance: 0,
            cpus,
            flags: LbFlags::empty(),
            loop_count: 0,
            loop_break: SCHED_NR_MIGRATE_BREAK,
            loop_max: 0,
            nr_balance_failed: 0,
            dst_nr_running: 0,
            overload: false,
            hot_gained: 0,
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "numa")] {
        /// Whether moving `task` would take it away from (`Some(true)`) or
        /// towards (`Some(false)`) its memory; `None` when it does not apply
        fn migrate_degrades_locality(task: &TaskRef, env: &LbEnv<'_>, topo: &Topology) -> Option<bool> {
            if !env.sd.has(SdFlags::NUMA) {
                return None;
            }
            let numa = task.numa.lock();
            if numa.faults.is_empty() {
                return None;
            }
            let src = topo.node_of(env.src_cpu);
            let dst = topo.node_of(env.dst_cpu);
            if src == dst {
                return None;
            }
            if numa.preferred_node == Some(src) {
                return Some(true);
            }
            if numa.preferred_node == Some(dst) {
                return Some(false);
            }
            let faults = |node: usize| numa.faults.get(node).copied().unwrap_or(0);
            Some(faults(src) > faults(dst))
        }
    } else {
        fn migrate_degrades_locality(_task: &TaskRef, _env: &LbEnv<'_>, _topo: &Topology) -> Option<bool> {
            None
        }
    }
}

// =============================================================================
// Source side
// =============================================================================

impl Rq {
    /// Whether task `id` ran here too recently to be worth moving
    pub fn task_hot(&self, ctx: &Ctx<'_>, env: &LbEnv<'_>, id: ThreadId) -> bool {
        let Some(se) = self.task_se(id) else {
            return false;
        };
        if self.task_ref(id).is_some_and(|t| t.policy() == TaskPolicy::Idle) {
            return false;
        }
        let cfs = self.cfs(self.cfs_of(se));
        if ctx.tun.feat(SchedFeatures::CACHE_HOT_BUDDY)
            && env.dst_nr_running > 0
            && (cfs.next == Some(se) || cfs.last == Some(se))
        {
            return true;
        }
        let cost = ctx.tun.migration_cost_ns;
        if cost == 0 {
            return false;
        }
        self.clock_task.saturating_sub(self.se(se).exec_start) < cost
    }

    /// Whether task `id` may move from this CPU to `env.dst_cpu`
    ///
    /// Records in `env.flags` why a task could not move, and may propose
    /// another CPU of the destination group for a pinned task.
    pub fn can_migrate_task(&mut self, ctx: &Ctx<'_>, env: &mut LbEnv<'_>, id: ThreadId) -> bool {
        let Some(se) = self.task_se(id) else {
            return false;
        };
        let Some(task) = self.task_ref(id).cloned() else {
            return false;
        };
        let tg = self.cfs(self.cfs_of(se)).tg.clone();
        if tg.throttled_on(env.src_cpu) || tg.throttled_on(env.dst_cpu) {
            return false;
        }

        if !task.allows(env.dst_cpu) {
            self.se_mut(se).stats.nr_failed_migrations_affine += 1;
            env.flags |= LbFlags::SOME_PINNED;
            let Some(grpmask) = env.dst_grpmask else {
                return false;
            };
            if env.flags.contains(LbFlags::DST_PINNED) {
                return false;
            }
            if let Some(cpu) = grpmask.and(env.cpus).iter().find(|&c| task.allows(c)) {
                env.flags |= LbFlags::DST_PINNED;
                env.new_dst_cpu = cpu;
            }
            return false;
        }
        env.flags.remove(LbFlags::ALL_PINNED);

        if self.curr == Some(id) {
            self.se_mut(se).stats.nr_failed_migrations_running += 1;
            return false;
        }

        let hot = match migrate_degrades_locality(&task, env, ctx.topo) {
            Some(degrades) => degrades,
            None => self.task_hot(ctx, env, id),
        };
        if !hot || env.nr_balance_failed > env.sd.cache_nice_tries {
            if hot {
                env.hot_gained += 1;
                self.se_mut(se).stats.nr_forced_migrations += 1;
            }
            return true;
        }
        self.se_mut(se).stats.nr_failed_migrations_hot += 1;
        false
    }

    /// Detach up to `env.imbalance` worth of load, coldest tasks first
    pub fn detach_tasks(&mut self, ctx: &Ctx<'_>, env: &mut LbEnv<'_>) -> Vec<(MovingTask, Arc<TaskGroup>)> {
        let mut detached = Vec::new();
        if env.imbalance <= 0 {
            return detached;
        }
        while let Some(&id) = self.cfs_tasks.back() {
            // Leave the last task to its CPU
            if env.idle != CpuIdleType::NotIdle && self.nr_running <= 1 {
                break;
            }
            env.loop_count += 1;
            if env.loop_count > env.loop_max {
                break;
            }
            if env.loop_count > env.loop_break {
                env.loop_break += SCHED_NR_MIGRATE_BREAK;
                env.flags |= LbFlags::NEED_BREAK;
                break;
            }

            if !self.can_migrate_task(ctx, env, id) {
                self.cfs_tasks.rotate_right(1);
                continue;
            }
            let load = self.task_h_load(ctx, id);
            if ctx.tun.feat(SchedFeatures::LB_MIN) && load < LB_MIN_LOAD && env.nr_balance_failed == 0 {
                self.cfs_tasks.rotate_right(1);
                continue;
            }
            if (load / 2) as i64 > env.imbalance {
                self.cfs_tasks.rotate_right(1);
                continue;
            }

            let Some(moved) = self.detach_task(ctx, id) else {
                self.cfs_tasks.rotate_right(1);
                continue;
            };
            detached.push(moved);
            env.imbalance -= load as i64;

            // One task is enough for a CPU about to go idle
            if env.idle == CpuIdleType::NewlyIdle || env.imbalance <= 0 {
                break;
            }
        }
        if !detached.is_empty() {
            log::trace!("[cfs] cpu{}: detached {} for cpu{}", self.cpu, detached.len(), env.dst_cpu);
        }
        detached
    }

    /// Detach the first task that may move, ignoring load
    pub fn detach_one_task(&mut self, ctx: &Ctx<'_>, env: &mut LbEnv<'_>) -> Option<(MovingTask, Arc<TaskGroup>)> {
        let candidates: Vec<ThreadId> = self.cfs_tasks.iter().rev().copied().collect();
        for id in candidates {
            if !self.can_migrate_task(ctx, env, id) {
                continue;
            }
            if let Some(moved) = self.detach_task(ctx, id) {
                return Some(moved);
            }
        }
        None
    }
}

// =============================================================================
// Driver
// =============================================================================

/// How a balance attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LbExit {
    /// Went through the whole attempt, moving tasks or not
    Done,
    /// Nothing worth moving, or another CPU balances this level
    Balanced,
    /// Every candidate CPU's tasks were pinned
    AllPinned,
    /// The one task left to push may not run on the destination
    OnePinned,
}

/// Back off after an attempt that found nothing it could move
fn back_off(state: &mut DomainState, sd: &SchedDomain, flags: LbFlags) {
    if (flags.contains(LbFlags::ALL_PINNED) && state.balance_interval < MAX_PINNED_INTERVAL)
        || state.balance_interval < sd.max_interval
    {
        state.balance_interval *= 2;
    }
}

impl CfsScheduler {
    /// Queue detached tasks on `dst_cpu`, or back on `src_cpu` when the
    /// destination went offline meanwhile
    fn attach_tasks(&self, ctx: &Ctx<'_>, dst_cpu: usize, src_cpu: usize, tasks: Vec<(MovingTask, Arc<TaskGroup>)>) {
        if tasks.is_empty() {
            return;
        }
        let mut rq = self.rq(dst_cpu);
        if !rq.online {
            log::warn!("[cfs] cpu{} went offline during balance, returning tasks to cpu{}", dst_cpu, src_cpu);
            drop(rq);
            rq = self.rq(src_cpu);
        }
        rq.update_clock(ctx);
        for (moving, tg) in tasks {
            rq.attach_task(ctx, moving, &tg);
        }
    }

    /// Balance `this_cpu`'s domain at `level`; returns the number of
    /// tasks pulled
    ///
    /// Clears `continue_balancing` when another CPU of the local group is
    /// the elected balancer, so higher levels are skipped too.
    pub fn load_balance(&self, this_cpu: usize, level: usize, idle: CpuIdleType, continue_balancing: &mut bool) -> usize {
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let penv = self.placement_env(&tun);
        let Some(sd) = self.topology.domain(this_cpu, level) else {
            return 0;
        };
        let sd_parent = self.topology.domain(this_cpu, level + 1);
        let idx = idle as usize;

        let mut env = LbEnv::new(sd, this_cpu, idle, sd.span.and(penv.online_mask()));
        env.nr_balance_failed = self.rq(this_cpu).domains.get(level).map_or(0, |d| d.nr_balance_failed);

        let mut ld_moved = 0;
        let mut busiest = this_cpu;
        let mut active_balance = false;
        let mut nobusyg = false;
        let mut nobusyq = false;
        let mut lb_imbalance = 0u64;

        let exit = 'out: {
            loop {
                if !should_we_balance(&penv, &env) {
                    *continue_balancing = false;
                    break 'out LbExit::Balanced;
                }
                let group = find_busiest_group(&penv, &mut env);
                if sd_parent.is_none() {
                    self.overload.store(env.overload, Ordering::Relaxed);
                }
                let Some(group) = group else {
                    nobusyg = true;
                    break 'out LbExit::Balanced;
                };
                let Some(src) = find_busiest_queue(&penv, &env, &sd.groups[group]) else {
                    nobusyq = true;
                    break 'out LbExit::Balanced;
                };
                lb_imbalance += env.imbalance.max(0) as u64;
                busiest = src;
                env.src_cpu = src;
                ld_moved = 0;

                let nr = penv.rq(src).nr_running();
                if nr > 1 {
                    env.flags |= LbFlags::ALL_PINNED;
                    env.loop_max = tun.nr_migrate.min(nr);
                    loop {
                        env.dst_nr_running = penv.rq(env.dst_cpu).nr_running();
                        let detached = {
                            let mut rq = self.rq(src);
                            rq.update_clock(&ctx);
                            rq.detach_tasks(&ctx, &mut env)
                        };
                        ld_moved += detached.len();
                        self.attach_tasks(&ctx, env.dst_cpu, src, detached);

                        if env.flags.contains(LbFlags::NEED_BREAK) {
                            env.flags.remove(LbFlags::NEED_BREAK);
                            continue;
                        }
                        // Some task may go to a sibling of the destination
                        if env.flags.contains(LbFlags::DST_PINNED) && env.imbalance > 0 {
                            env.cpus = env.cpus.without(env.dst_cpu);
                            env.dst_cpu = env.new_dst_cpu;
                            env.flags.remove(LbFlags::DST_PINNED);
                            env.loop_count = 0;
                            env.loop_break = SCHED_NR_MIGRATE_BREAK;
                            continue;
                        }
                        break;
                    }

                    if let Some(parent) = sd_parent {
                        if env.flags.contains(LbFlags::SOME_PINNED) && env.imbalance > 0 {
                            if let Some(g) = parent.groups.first() {
                                g.sgc.set_imbalanced(true);
                            }
                        }
                    }

                    if env.flags.contains(LbFlags::ALL_PINNED) {
                        env.cpus = env.cpus.without(src);
                        if !env.cpus.is_empty() {
                            env.loop_count = 0;
                            env.loop_break = SCHED_NR_MIGRATE_BREAK;
                            continue;
                        }
                        break 'out LbExit::AllPinned;
                    }
                }
                break;
            }

            if ld_moved == 0 {
                if idle != CpuIdleType::NewlyIdle {
                    env.nr_balance_failed += 1;
                }
                if need_active_balance(&penv, &env, tun.active_balance_threshold) {
                    let mut rq = self.rq(busiest);
                    let pinned = rq.curr.and_then(|c| rq.task_ref(c)).is_some_and(|t| !t.allows(this_cpu));
                    if pinned {
                        drop(rq);
                        env.flags |= LbFlags::ALL_PINNED;
                        break 'out LbExit::OnePinned;
                    }
                    if !rq.active_balance {
                        rq.active_balance = true;
                        rq.push_cpu = this_cpu;
                        active_balance = true;
                    }
                    drop(rq);
                    if active_balance {
                        log::debug!("[cfs] cpu{}: active balance requested from cpu{}", this_cpu, busiest);
                        self.host.notifier.request_active_balance(busiest);
                    }
                    // Stay eligible for another push soon
                    env.nr_balance_failed = (sd.cache_nice_tries + tun.active_balance_threshold).saturating_sub(1);
                }
            } else {
                env.nr_balance_failed = 0;
            }
            LbExit::Done
        };

        if exit == LbExit::Balanced {
            if let Some(g) = sd_parent.and_then(|p| p.groups.first()) {
                if g.sgc.is_imbalanced() {
                    g.sgc.set_imbalanced(false);
                }
            }
        }
        if ld_moved > 0 {
            log::debug!("[cfs] cpu{}: pulled {} from cpu{} at level {} ({:?})", this_cpu, ld_moved, busiest, level, idle);
        }

        let mut rq = self.rq(this_cpu);
        let Some(state) = rq.domains.get_mut(level) else {
            return ld_moved;
        };
        let s = &mut state.stats;
        s.lb_count[idx] += 1;
        s.lb_nobusyg[idx] += u64::from(nobusyg);
        s.lb_nobusyq[idx] += u64::from(nobusyq);
        s.lb_imbalance[idx] += lb_imbalance;
        s.lb_gained[idx] += ld_moved as u64;
        s.lb_hot_gained[idx] += env.hot_gained;
        match exit {
            LbExit::Done => {
                if ld_moved == 0 {
                    s.lb_failed[idx] += 1;
                }
                state.nr_balance_failed = env.nr_balance_failed;
                if !active_balance {
                    state.balance_interval = sd.min_interval;
                } else if state.balance_interval < sd.max_interval {
                    state.balance_interval *= 2;
                }
                ld_moved
            }
            LbExit::Balanced | LbExit::AllPinned => {
                s.lb_balanced[idx] += 1;
                state.nr_balance_failed = 0;
                back_off(state, sd, env.flags);
                0
            }
            LbExit::OnePinned => {
                s.lb_failed[idx] += 1;
                state.nr_balance_failed = env.nr_balance_failed;
                back_off(state, sd, env.flags);
                0
            }
        }
    }

    /// Push the running task of `busiest_cpu` to the CPU that asked for it
    ///
    /// Runs on `busiest_cpu` in answer to a request the balancer sent.
    /// Quietly does nothing when the situation changed since.
    pub fn active_load_balance(&self, busiest_cpu: usize) {
        if busiest_cpu >= self.nr_cpus() {
            return;
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let target_cpu = {
            let rq = self.rq(busiest_cpu);
            if !rq.active_balance {
                return;
            }
            rq.push_cpu
        };
        let online = self.online_mask();
        let sd = self
            .topology
            .domains(target_cpu)
            .iter()
            .find(|sd| sd.has(SdFlags::LOAD_BALANCE) && sd.span.contains(busiest_cpu));
        let nr_balance_failed =
            sd.and_then(|sd| self.rq(target_cpu).domains.get(sd.level).map(|d| d.nr_balance_failed)).unwrap_or(0);

        let (moved, hot_gained) = {
            let mut rq = self.rq(busiest_cpu);
            let mut result = (None, 0);
            let viable = target_cpu != busiest_cpu
                && online.contains(target_cpu)
                && rq.online
                && rq.nr_running > 1;
            if let (true, Some(sd)) = (viable, sd) {
                rq.update_clock(&ctx);
                // The push preempts whatever runs here
                if rq.curr.is_some() {
                    rq.put_prev_task(&ctx);
                    rq.resched_curr(&ctx);
                }
                let mut env = LbEnv::new(sd, target_cpu, CpuIdleType::Idle, online);
                env.src_cpu = busiest_cpu;
                env.nr_balance_failed = nr_balance_failed;
                result = (rq.detach_one_task(&ctx, &mut env), env.hot_gained);
            }
            rq.active_balance = false;
            result
        };

        let Some(sd) = sd else {
            return;
        };
        let pushed = moved.is_some();
        if let Some(moved) = moved {
            self.attach_tasks(&ctx, target_cpu, busiest_cpu, vec![moved]);
        }
        let idx = CpuIdleType::Idle as usize;
        let mut rq = self.rq(target_cpu);
        if let Some(state) = rq.domains.get_mut(sd.level) {
            state.stats.alb_count += 1;
            if pushed {
                state.stats.alb_pushed += 1;
                state.stats.lb_gained[idx] += 1;
                state.stats.lb_hot_gained[idx] += hot_gained;
            } else {
                state.stats.alb_failed += 1;
            }
        }
        log::debug!("[cfs] cpu{}: active push to cpu{} {}", busiest_cpu, target_cpu, if pushed { "done" } else { "failed" });
    }

    /// Balance interval of a domain in ticks
    fn sd_balance_interval(&self, tun: &Tunables, balance_interval: u64, sd: &SchedDomain, cpu_busy: bool) -> u64 {
        let mut interval = balance_interval;
        if cpu_busy {
            interval *= sd.busy_factor;
        }
        let ticks = (interval * tun.hz).div_ceil(1000);
        let max = (tun.hz * u64::from(self.online_mask().weight()) / 10).max(1);
        ticks.clamp(1, max)
    }

    /// Try to pull a task before `this_cpu` goes idle; returns how many
    /// tasks were pulled, or 1 when work showed up meanwhile
    pub fn idle_balance(&self, this_cpu: usize) -> i32 {
        if this_cpu >= self.nr_cpus() {
            return 0;
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let now = tun.ticks(self.now());
        let mut next_balance = now + tun.hz;
        let mut pulled = 0i32;

        let avg_idle = {
            let mut rq = self.rq(this_cpu);
            rq.update_clock(&ctx);
            rq.idle_stamp = rq.clock;
            rq.avg_idle
        };

        if avg_idle < tun.migration_cost_ns || !self.overload.load(Ordering::Relaxed) {
            if let Some(sd) = self.topology.domain(this_cpu, 0) {
                if let Some(state) = self.rq(this_cpu).domains.first().cloned() {
                    let interval = self.sd_balance_interval(&tun, state.balance_interval, sd, false);
                    next_balance = next_balance.min(state.last_balance + interval);
                }
            }
        } else {
            self.rq(this_cpu).update_blocked_averages(&ctx);
            let mut curr_cost = 0u64;
            for sd in self.topology.domains(this_cpu) {
                if !sd.has(SdFlags::LOAD_BALANCE) {
                    continue;
                }
                let Some(state) = self.rq(this_cpu).domains.get(sd.level).cloned() else {
                    break;
                };
                if avg_idle < curr_cost + state.max_newidle_lb_cost {
                    let interval = self.sd_balance_interval(&tun, state.balance_interval, sd, false);
                    next_balance = next_balance.min(state.last_balance + interval);
                    break;
                }
                if sd.has(SdFlags::BALANCE_NEWIDLE) {
                    let t0 = self.host.clock.now(this_cpu);
                    let mut continue_balancing = true;
                    pulled = self.load_balance(this_cpu, sd.level, CpuIdleType::NewlyIdle, &mut continue_balancing) as i32;
                    let cost = self.host.clock.now(this_cpu).saturating_sub(t0);
                    if let Some(st) = self.rq(this_cpu).domains.get_mut(sd.level) {
                        st.max_newidle_lb_cost = st.max_newidle_lb_cost.max(cost);
                    }
                    curr_cost += cost;
                }
                let interval = self.sd_balance_interval(&tun, state.balance_interval, sd, false);
                next_balance = next_balance.min(state.last_balance + interval);
                if pulled > 0 || self.shared[this_cpu].nr_running() > 0 {
                    break;
                }
            }
            let mut rq = self.rq(this_cpu);
            if curr_cost > rq.max_idle_balance_cost {
                rq.max_idle_balance_cost = curr_cost;
            }
            // A task arrived while balancing
            if rq.root().h_nr_running > 0 && pulled == 0 {
                pulled = 1;
            }
        }

        let mut rq = self.rq(this_cpu);
        if rq.next_balance > next_balance {
            rq.next_balance = next_balance;
        }
        if pulled > 0 {
            rq.idle_stamp = 0;
        }
        pulled
    }

    /// Balance every due domain of `cpu`, lowest level first
    ///
    /// `force` ignores the intervals.
    pub fn rebalance_domains(&self, cpu: usize, mut idle: CpuIdleType, force: bool) {
        if cpu >= self.nr_cpus() {
            return;
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let now = tun.ticks(self.now());
        let mut next_balance = now + 60 * tun.hz;
        let mut update_next_balance = false;
        let mut need_decay = false;
        let mut max_cost = 0u64;
        let mut continue_balancing = true;

        {
            let mut rq = self.rq(cpu);
            if !rq.online {
                return;
            }
            rq.update_clock(&ctx);
            rq.update_blocked_averages(&ctx);
        }

        for sd in self.topology.domains(cpu) {
            let level = sd.level;
            let state = {
                let mut rq = self.rq(cpu);
                let Some(st) = rq.domains.get_mut(level) else {
                    break;
                };
                // Newly-idle cost estimates fade by about 1% a second
                if now > st.next_decay_max_lb_cost {
                    st.max_newidle_lb_cost = st.max_newidle_lb_cost * 253 / 256;
                    st.next_decay_max_lb_cost = now + tun.hz;
                    need_decay = true;
                }
                st.clone()
            };
            max_cost += state.max_newidle_lb_cost;

            if !sd.has(SdFlags::LOAD_BALANCE) {
                continue;
            }
            if !continue_balancing {
                if need_decay {
                    continue;
                }
                break;
            }

            let mut interval = self.sd_balance_interval(&tun, state.balance_interval, sd, idle != CpuIdleType::Idle);
            let mut last_balance = state.last_balance;
            let serialize = if sd.has(SdFlags::SERIALIZE) {
                match self.balancing.try_lock() {
                    Some(guard) => Some(guard),
                    None => {
                        if next_balance > last_balance + interval {
                            next_balance = last_balance + interval;
                            update_next_balance = true;
                        }
                        continue;
                    }
                }
            } else {
                None
            };

            if force || now >= last_balance + interval {
                if self.load_balance(cpu, level, idle, &mut continue_balancing) > 0 {
                    idle = if self.shared[cpu].is_idle() { CpuIdleType::Idle } else { CpuIdleType::NotIdle };
                }
                last_balance = now;
                let balance_interval = {
                    let mut rq = self.rq(cpu);
                    match rq.domains.get_mut(level) {
                        Some(st) => {
                            st.last_balance = now;
                            st.balance_interval
                        }
                        None => state.balance_interval,
                    }
                };
                interval = self.sd_balance_interval(&tun, balance_interval, sd, idle != CpuIdleType::Idle);
            }
            drop(serialize);

            if next_balance > last_balance + interval {
                next_balance = last_balance + interval;
                update_next_balance = true;
            }
        }

        let mut rq = self.rq(cpu);
        if need_decay {
            rq.max_idle_balance_cost = tun.migration_cost_ns.max(max_cost);
        }
        if update_next_balance {
            rq.next_balance = next_balance;
            drop(rq);
            if idle == CpuIdleType::Idle {
                self.nohz.pull_next_balance(next_balance);
            }
        }
    }

    /// Tick hook: balance `cpu` when due and kick an idle CPU if others
    /// need help
    pub fn trigger_load_balance(&self, cpu: usize) {
        if self.topology.domains(cpu).is_empty() {
            return;
        }
        let tun = self.tunables.load();
        let now = tun.ticks(self.now());
        if now >= self.shared[cpu].next_balance() {
            let idle = if self.shared[cpu].is_idle() { CpuIdleType::Idle } else { CpuIdleType::NotIdle };
            self.rebalance_domains(cpu, idle, false);
        }
        if self.nohz_kick_needed(cpu, now) {
            self.nohz_balancer_kick();
        }
    }
}

impl LoadBalancer for CfsScheduler {
    fn balance(&self, _scheduler: &dyn Scheduler) {
        for cpu in self.online_mask().iter() {
            let idle = if self.shared[cpu].is_idle() { CpuIdleType::Idle } else { CpuIdleType::NotIdle };
            self.rebalance_domains(cpu, idle, true);
        }
    }

    fn cpu_load(&self, cpu: usize) -> u64 {
        self.shared.get(cpu).map_or(0, |rq| rq.weighted_cpuload())
    }

    fn suggest_migration(&self, thread: ThreadId, current_cpu: usize) -> Option<usize> {
        let cpu = self.suggest_cpu(thread, current_cpu)?;
        (cpu != current_cpu).then_some(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{thread, Bench, Sim, MS};
    use crate::topology::TopologySpec;

    /// Two CPUs with `n` tasks started pinned on cpu0, then let loose
    fn crowded_cpu0(n: u64) -> (Sim, Vec<ThreadId>) {
        let sim = Sim::cpus(2);
        let ids: Vec<ThreadId> = (1..=n)
            .map(|id| {
                sim.sched.add_thread(thread(id, 0).with_affinity(0b01)).unwrap();
                ThreadId::from_raw(id)
            })
            .collect();
        sim.run_for(30 * MS);
        for &id in &ids {
            sim.sched.set_task_affinity(id, CpuMask::first(2)).unwrap();
        }
        (sim, ids)
    }

    fn on_cpu(sim: &Sim, ids: &[ThreadId], cpu: usize) -> usize {
        ids.iter().filter(|&&id| sim.sched.task_info(id).unwrap().cpu == cpu).count()
    }

    #[test]
    fn test_idle_cpu_pulls_half() {
        let (sim, ids) = crowded_cpu0(4);
        assert_eq!(on_cpu(&sim, &ids, 0), 4);

        let mut cont = true;
        let moved = sim.sched.load_balance(1, 0, CpuIdleType::Idle, &mut cont);
        assert_eq!(moved, 2);
        assert_eq!(on_cpu(&sim, &ids, 1), 2);
        let stats = sim.sched.domain_stats(1, 0).unwrap();
        assert_eq!(stats.lb_gained[CpuIdleType::Idle as usize], 2);
    }

    #[test]
    fn test_newly_idle_pulls_one() {
        let (sim, ids) = crowded_cpu0(4);
        assert_eq!(sim.sched.idle_balance(1), 1);
        assert_eq!(on_cpu(&sim, &ids, 1), 1);
    }

    #[test]
    fn test_pinned_tasks_stay() {
        let sim = Sim::cpus(2);
        for id in 1..=3 {
            sim.sched.add_thread(thread(id, 0).with_affinity(0b01)).unwrap();
        }
        sim.run_for(20 * MS);
        let idx = CpuIdleType::Idle as usize;
        let before = sim.sched.domain_stats(1, 0).unwrap();
        let mut cont = true;
        assert_eq!(sim.sched.load_balance(1, 0, CpuIdleType::Idle, &mut cont), 0);
        let after = sim.sched.domain_stats(1, 0).unwrap();
        assert_eq!(after.lb_balanced[idx], before.lb_balanced[idx] + 1);
        assert_eq!(after.lb_failed[idx], 0);
        assert_eq!(on_cpu(&sim, &[1, 2, 3].map(ThreadId::from_raw), 0), 3);
        assert!(sim.host.notifier.active_requests().is_empty());
    }

    #[test]
    fn test_active_balance_pushes_running_task() {
        let sim = Sim::cpus(2);
        sim.sched.add_thread(thread(1, 0).with_affinity(0b01)).unwrap();
        sim.sched.add_thread(thread(2, 0).with_affinity(0b01)).unwrap();
        sim.run_for(10 * MS);
        let running = sim.sched.current(0).unwrap();
        sim.sched.set_task_affinity(running, CpuMask::first(2)).unwrap();

        let idx = CpuIdleType::Idle as usize;
        let mut cont = true;
        for attempt in 1..=11 {
            assert_eq!(sim.sched.load_balance(1, 0, CpuIdleType::Idle, &mut cont), 0);
            assert!(sim.host.notifier.active_requests().is_empty(), "requested after {} failures", attempt);
        }
        sim.sched.load_balance(1, 0, CpuIdleType::Idle, &mut cont);
        assert_eq!(sim.host.notifier.take_active(), [0]);
        let stats = sim.sched.domain_stats(1, 0).unwrap();
        assert_eq!(stats.lb_failed[idx], 12);
        // Mc: one cache_nice_try plus the threshold of ten, minus one
        assert_eq!(sim.sched.domain_state(1, 0).unwrap().nr_balance_failed, 10);

        sim.sched.active_load_balance(0);
        assert_eq!(sim.sched.task_info(running).unwrap().cpu, 1);
        let stats = sim.sched.domain_stats(1, 0).unwrap();
        assert_eq!(stats.alb_count, 1);
        assert_eq!(stats.alb_pushed, 1);
    }

    #[test]
    fn test_stale_active_request_is_ignored() {
        let sim = Sim::cpus(2);
        sim.spawn(1, 0);
        sim.run_for(5 * MS);
        sim.sched.active_load_balance(0);
        sim.sched.active_load_balance(7);
        assert_eq!(sim.sched.domain_stats(1, 0).unwrap().alb_count, 0);
    }

    #[test]
    fn test_affinity_blocks_and_marks_pinned() {
        let mut b = Bench::new();
        let a = b.spawn(1, 0);
        let c = b.spawn(2, 0);
        b.run(2 * MS);
        let topo = Topology::build(&TopologySpec::flat(), 2, &[]).unwrap();
        let sd = topo.domain(1, 0).unwrap();
        let mut env = LbEnv::new(sd, 1, CpuIdleType::Idle, CpuMask::first(2));
        env.src_cpu = 0;
        env.flags = LbFlags::ALL_PINNED;

        let (rq, ctx) = b.split();
        let queued = if rq.curr == Some(a) { c } else { a };
        assert!(!rq.can_migrate_task(&ctx, &mut env, queued));
        assert!(env.flags.contains(LbFlags::SOME_PINNED | LbFlags::ALL_PINNED));
        assert!(!env.flags.contains(LbFlags::DST_PINNED));
        let se = rq.task_se(queued).unwrap();
        assert_eq!(rq.se(se).stats.nr_failed_migrations_affine, 1);
    }

    #[test]
    fn test_recently_run_task_is_hot() {
        let mut b = Bench::new();
        let a = b.spawn(1, 0);
        let c = b.spawn(2, 0);
        b.run(2 * MS);
        let topo = Topology::build(&TopologySpec::flat(), 2, &[]).unwrap();
        let sd = topo.domain(1, 0).unwrap();
        let env = LbEnv::new(sd, 1, CpuIdleType::Idle, CpuMask::first(2));

        let (rq, ctx) = b.split();
        let queued = if rq.curr == Some(a) { c } else { a };
        let se = rq.task_se(queued).unwrap();
        rq.se_mut(se).exec_start = rq.clock_task;
        assert!(rq.task_hot(&ctx, &env, queued));
        rq.se_mut(se).exec_start = rq.clock_task.saturating_sub(ctx.tun.migration_cost_ns);
        assert!(!rq.task_hot(&ctx, &env, queued));

        rq.se_mut(se).exec_start = rq.clock_task;
        rq.task_ref(queued).unwrap().set_policy(TaskPolicy::Idle);
        assert!(!rq.task_hot(&ctx, &env, queued));
    }

    #[test]
    fn test_interval_backs_off_when_balanced() {
        let sim = Sim::cpus(2);
        let sd_min = sim.sched.topology().domain(0, 0).unwrap().min_interval;
        let mut cont = true;
        sim.sched.load_balance(0, 0, CpuIdleType::Idle, &mut cont);
        sim.sched.load_balance(0, 0, CpuIdleType::Idle, &mut cont);
        assert_eq!(sim.sched.domain_state(0, 0).unwrap().balance_interval, sd_min * 2);
    }
}
