//! # Bandwidth Control
//!
//! A limited group owns a runtime pool refilled to `quota` every
//! `period`. Each of its per-CPU queues withdraws slices from the pool as
//! it runs; a queue that runs dry and finds the pool empty is throttled,
//! which takes its group entity out of the parent queue. The period
//! timer refills the pool and hands runtime to throttled queues; the
//! slack timer redistributes runtime returned early by queues that went
//! idle.
//!
//! Lock order is run queue, then pool. Distribution drops the pool lock
//! before touching any run queue.

use crate::entity::{CfsRqId, GroupId};
use crate::error::{CfsError, CfsResult};
use crate::group::TaskGroup;
use crate::rq::{Ctx, Rq};
use crate::scheduler::CfsScheduler;
use crate::task::{DequeueFlags, EnqueueFlags};
use crate::vtime::vdiff;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use helix_execution::scheduler::{TimerKey, TimerService};
use spin::MutexGuard;

const NSEC_PER_MSEC: u64 = 1_000_000;

/// Shortest accepted period
pub const MIN_CFS_QUOTA_PERIOD_NS: u64 = NSEC_PER_MSEC;
/// Longest accepted period
pub const MAX_CFS_QUOTA_PERIOD_NS: u64 = 1_000 * NSEC_PER_MSEC;
/// Smallest accepted quota
pub const MIN_CFS_QUOTA_NS: u64 = NSEC_PER_MSEC;
/// Period of a newly created group
pub const DEFAULT_CFS_PERIOD_NS: u64 = 100 * NSEC_PER_MSEC;
/// Delay before returned runtime is redistributed
pub const CFS_SLACK_PERIOD_NS: u64 = 5 * NSEC_PER_MSEC;
/// Runtime a queue keeps when returning its slack
pub const MIN_CFS_RQ_RUNTIME_NS: u64 = NSEC_PER_MSEC;
/// No slack distribution this close to a refill
pub const MIN_BANDWIDTH_EXPIRATION_NS: u64 = 2 * NSEC_PER_MSEC;
/// Overruns in one timer activation before the period is stretched
pub const MAX_PERIOD_OVERRUNS: u32 = 3;

/// Fixed-point shift of [`to_ratio`]
pub const BW_SHIFT: u32 = 20;
/// Ratio standing for an unlimited quota
pub const RUNTIME_INF_RATIO: u64 = u64::MAX;

/// `runtime / period` in `2^BW_SHIFT` units
pub fn to_ratio(period: u64, runtime: u64) -> u64 {
    if period == 0 {
        return 0;
    }
    let ratio = ((runtime as u128) << BW_SHIFT) / period as u128;
    u64::try_from(ratio).unwrap_or(u64::MAX)
}

// ===== Timers =====

/// The two timers of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Refill and distribution at every period boundary
    Period,
    /// Delayed distribution of returned runtime
    Slack,
}

/// Timer key of one of a group's timers
pub fn timer_key(group: GroupId, kind: TimerKind) -> TimerKey {
    let bit = match kind {
        TimerKind::Period => 0,
        TimerKind::Slack => 1,
    };
    TimerKey((group << 1) | bit)
}

/// Inverse of [`timer_key`]
pub fn decode_timer_key(key: TimerKey) -> (GroupId, TimerKind) {
    let kind = if key.0 & 1 == 0 { TimerKind::Period } else { TimerKind::Slack };
    (key.0 >> 1, kind)
}

/// State of a pool's period timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodTimer {
    /// Not armed; the pool saw no demand for a full period
    Idle,
    /// Armed for `timer_expires`
    Armed,
    /// Handler in progress, with the overruns seen in this activation
    Running {
        /// Consecutive overruns
        overruns: u32,
    },
}

// ===== Pool =====

/// Runtime pool of a group
#[derive(Debug)]
pub struct CfsBandwidth {
    /// Runtime per period, `None` when unlimited
    pub quota: Option<u64>,
    /// Refill period
    pub period: u64,
    /// Runtime left in the pool
    pub runtime: u64,
    /// When the current pool runtime expires
    pub runtime_expires: u64,
    /// Period timer state
    pub timer: PeriodTimer,
    /// Expiry the period timer is (or was last) armed for
    pub timer_expires: u64,
    /// No runtime was requested during the last period
    pub idle: bool,
    /// Slack timer armed
    pub slack_armed: bool,
    /// A distribution is in flight
    pub distribute_running: bool,
    /// CPUs on which the group's queue is throttled, in throttle order
    pub throttled: VecDeque<usize>,
    /// Periods elapsed while active
    pub nr_periods: u64,
    /// Periods that ended with a throttled queue
    pub nr_throttled: u64,
    /// Total time queues spent throttled
    pub throttled_time: u64,
}

impl CfsBandwidth {
    /// Unlimited pool with the default period
    pub fn new() -> Self {
        Self {
            quota: None,
            period: DEFAULT_CFS_PERIOD_NS,
            runtime: 0,
            runtime_expires: 0,
            timer: PeriodTimer::Idle,
            timer_expires: 0,
            idle: false,
            slack_armed: false,
            distribute_running: false,
            throttled: VecDeque::new(),
            nr_periods: 0,
            nr_throttled: 0,
            throttled_time: 0,
        }
    }

    /// Whether the period timer is armed or running
    #[inline]
    pub fn period_active(&self) -> bool {
        self.timer != PeriodTimer::Idle
    }

    /// Refill to quota for a period starting at `now`
    pub fn refill(&mut self, now: u64) {
        if let Some(quota) = self.quota {
            self.runtime = quota;
            self.runtime_expires = now + self.period;
        }
    }

    /// Push the timer expiry past `now`; returns the periods skipped
    pub fn forward(&mut self, now: u64) -> u64 {
        if now < self.timer_expires {
            return 0;
        }
        let overrun = (now - self.timer_expires) / self.period + 1;
        self.timer_expires += overrun * self.period;
        overrun
    }

    /// Arm the period timer if it is idle
    pub fn start(&mut self, group: GroupId, now: u64, timers: &dyn TimerService) {
        if self.period_active() {
            return;
        }
        if self.timer_expires == 0 {
            self.timer_expires = now;
        }
        let overrun = self.forward(now);
        self.runtime_expires += (overrun + 1) * self.period;
        self.timer = PeriodTimer::Armed;
        timers.arm(timer_key(group, TimerKind::Period), self.timer_expires);
    }

    /// Whether the next refill is less than `min_expire` away
    pub fn refresh_within(&self, group: GroupId, min_expire: u64, timers: &dyn TimerService) -> bool {
        if matches!(self.timer, PeriodTimer::Running { .. }) {
            return true;
        }
        timers
            .remaining(timer_key(group, TimerKind::Period))
            .is_none_or(|left| left < min_expire)
    }

    /// Arm the slack timer unless a refill comes soon anyway
    pub fn start_slack(&mut self, group: GroupId, now: u64, timers: &dyn TimerService) {
        if self.refresh_within(group, CFS_SLACK_PERIOD_NS + MIN_BANDWIDTH_EXPIRATION_NS, timers) {
            return;
        }
        self.slack_armed = true;
        timers.arm(timer_key(group, TimerKind::Slack), now + CFS_SLACK_PERIOD_NS);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> BandwidthStats {
        BandwidthStats {
            quota: self.quota,
            period: self.period,
            runtime: self.runtime,
            nr_periods: self.nr_periods,
            nr_throttled: self.nr_throttled,
            throttled_time: self.throttled_time,
            throttled_cpus: self.throttled.len(),
        }
    }
}

impl Default for CfsBandwidth {
    fn default() -> Self {
        Self::new()
    }
}

/// Bandwidth figures of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthStats {
    /// Runtime per period, `None` when unlimited
    pub quota: Option<u64>,
    /// Refill period
    pub period: u64,
    /// Runtime left in the pool
    pub runtime: u64,
    /// Periods elapsed while active
    pub nr_periods: u64,
    /// Periods that ended with a throttled queue
    pub nr_throttled: u64,
    /// Total time queues spent throttled
    pub throttled_time: u64,
    /// Queues currently throttled
    pub throttled_cpus: usize,
}

// ===== Queue side =====

impl Rq {
    /// Charge `delta` to a limited queue, withdrawing more runtime when
    /// it runs out
    pub fn account_cfs_rq_runtime(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, delta: u64) {
        if !self.cfs(cfs).runtime_enabled {
            return;
        }
        self.cfs_mut(cfs).runtime_remaining -= delta as i64;
        self.expire_cfs_rq_runtime(ctx, cfs);
        if self.cfs(cfs).runtime_remaining > 0 {
            return;
        }
        // Throttling happens at the next put or pick
        if !self.assign_cfs_rq_runtime(ctx, cfs) && self.cfs(cfs).curr.is_some() {
            self.resched_curr(ctx);
        }
    }

    /// Withdraw up to a slice from the pool; true if runtime is left
    fn assign_cfs_rq_runtime(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId) -> bool {
        let tg = self.cfs(cfs).tg.clone();
        let min_amount = (ctx.tun.bandwidth_slice_ns as i64 - self.cfs(cfs).runtime_remaining).max(0) as u64;
        let now = self.clock;
        let (amount, expires) = {
            let mut pool = tg.bandwidth.lock();
            let amount = if pool.quota.is_none() {
                min_amount
            } else {
                pool.start(tg.id, now, &*ctx.host.timers);
                if pool.runtime > 0 {
                    let amount = pool.runtime.min(min_amount);
                    pool.runtime -= amount;
                    pool.idle = false;
                    amount
                } else {
                    0
                }
            };
            (amount, pool.runtime_expires)
        };
        let q = self.cfs_mut(cfs);
        q.runtime_remaining += amount as i64;
        if vdiff(expires, q.runtime_expires) > 0 {
            q.runtime_expires = expires;
        }
        q.runtime_remaining > 0
    }

    /// Drop local runtime that belongs to a period already refilled
    fn expire_cfs_rq_runtime(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId) {
        let q = self.cfs(cfs);
        if vdiff(self.clock, q.runtime_expires) < 0 || q.runtime_remaining < 0 {
            return;
        }
        let pool_expires = q.tg.bandwidth.lock().runtime_expires;
        let q = self.cfs_mut(cfs);
        if vdiff(q.runtime_expires, pool_expires) >= 0 {
            // Clock drift against the refill: extend by a tick
            q.runtime_expires += ctx.tun.tick_ns();
        } else {
            q.runtime_remaining = 0;
        }
    }

    /// Throttle a queue that is out of runtime; true if it is throttled
    pub fn check_cfs_rq_runtime(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId) -> bool {
        let q = self.cfs(cfs);
        if !q.runtime_enabled || q.runtime_remaining > 0 {
            return false;
        }
        if q.throttled {
            return true;
        }
        self.throttle_cfs_rq(ctx, cfs);
        true
    }

    /// Throttle a queue that becomes non-empty without runtime
    pub fn check_enqueue_throttle(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId) {
        let q = self.cfs(cfs);
        if !q.runtime_enabled || q.curr.is_some() || q.throttled {
            return;
        }
        self.account_cfs_rq_runtime(ctx, cfs, 0);
        if self.cfs(cfs).runtime_remaining <= 0 {
            self.throttle_cfs_rq(ctx, cfs);
        }
    }

    /// Give runtime above the retained minimum back to the pool when a
    /// queue goes empty
    pub fn return_cfs_rq_runtime(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId) {
        let q = self.cfs(cfs);
        if !q.runtime_enabled || q.nr_running != 0 {
            return;
        }
        let slack = q.runtime_remaining - MIN_CFS_RQ_RUNTIME_NS as i64;
        if slack <= 0 {
            return;
        }
        let tg = q.tg.clone();
        let expires = q.runtime_expires;
        let now = self.clock;
        {
            let mut pool = tg.bandwidth.lock();
            if pool.quota.is_some() && expires == pool.runtime_expires {
                pool.runtime += slack as u64;
                // Unthrottling needs other run queues: defer to the timer
                if pool.runtime > ctx.tun.bandwidth_slice_ns && !pool.throttled.is_empty() {
                    pool.start_slack(tg.id, now, &*ctx.host.timers);
                }
            }
        }
        self.cfs_mut(cfs).runtime_remaining -= slack;
    }

    /// Apply `f` to `cfs` and every queue below it on this CPU
    fn walk_queues_from(&mut self, cfs: CfsRqId, mut f: impl FnMut(&mut Self, CfsRqId)) {
        let mut stack = Vec::new();
        stack.push(cfs);
        while let Some(c) = stack.pop() {
            f(self, c);
            stack.extend(self.cfs(c).children.iter().copied());
        }
    }

    fn publish_throttle_count(&self, cfs: CfsRqId) {
        let q = self.cfs(cfs);
        if let Some(state) = q.tg.per_cpu.get(self.cpu) {
            state.throttle_count.store(q.throttle_count, Ordering::Release);
        }
    }

    /// Take a queue's group entity out of the hierarchy and park the
    /// queue on its pool's throttled list
    pub fn throttle_cfs_rq(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId) {
        let Some(se) = self.cfs(cfs).se else {
            return;
        };

        // Freeze the task clock of the whole subtree
        let clock_task = self.clock_task;
        self.walk_queues_from(cfs, |rq, c| {
            let q = rq.cfs_mut(c);
            if q.throttle_count == 0 {
                q.throttled_clock_task = clock_task;
            }
            q.throttle_count += 1;
            rq.publish_throttle_count(c);
        });

        let task_delta = self.cfs(cfs).h_nr_running;
        let mut dequeue = true;
        let mut cur = Some(se);
        while let Some(s) = cur {
            if !self.se(s).on_rq {
                break;
            }
            let qcfs = self.cfs_of(s);
            if dequeue {
                self.dequeue_entity(ctx, qcfs, s, DequeueFlags::SLEEP);
            }
            let q = self.cfs_mut(qcfs);
            assert!(q.h_nr_running >= task_delta, "h_nr_running underflow on throttle");
            q.h_nr_running -= task_delta;
            if q.load.weight != 0 {
                dequeue = false;
            }
            cur = self.parent_of(s);
        }
        if cur.is_none() {
            assert!(self.nr_running >= task_delta, "nr_running underflow on throttle");
            self.nr_running -= task_delta;
        }

        let now = self.clock;
        let q = self.cfs_mut(cfs);
        q.throttled = true;
        q.throttled_clock = now;
        let tg = q.tg.clone();
        {
            let mut pool = tg.bandwidth.lock();
            let empty = pool.throttled.is_empty();
            pool.throttled.push_back(self.cpu);
            if empty {
                pool.start(tg.id, now, &*ctx.host.timers);
            }
        }
        log::debug!("[cfs] cpu{}: throttled group {} ({} tasks)", self.cpu, tg.id, task_delta);
    }

    /// Put a throttled queue's group entity back into the hierarchy
    pub fn unthrottle_cfs_rq(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId) {
        let Some(se) = self.cfs(cfs).se else {
            return;
        };
        self.update_clock(ctx);
        let now = self.clock;
        let tg = self.cfs(cfs).tg.clone();
        let throttled_clock = self.cfs(cfs).throttled_clock;
        self.cfs_mut(cfs).throttled = false;
        {
            let mut pool = tg.bandwidth.lock();
            pool.throttled_time += now.saturating_sub(throttled_clock);
            let cpu = self.cpu;
            pool.throttled.retain(|&c| c != cpu);
        }

        let clock_task = self.clock_task;
        self.walk_queues_from(cfs, |rq, c| {
            let q = rq.cfs_mut(c);
            q.throttle_count = q.throttle_count.saturating_sub(1);
            if q.throttle_count == 0 {
                q.throttled_clock_task_time += clock_task.saturating_sub(q.throttled_clock_task);
            }
            rq.publish_throttle_count(c);
        });
        log::debug!("[cfs] cpu{}: unthrottled group {}", self.cpu, tg.id);

        if self.cfs(cfs).load.weight == 0 {
            return;
        }

        let task_delta = self.cfs(cfs).h_nr_running;
        let mut enqueue = true;
        let mut cur = Some(se);
        while let Some(s) = cur {
            if self.se(s).on_rq {
                enqueue = false;
            }
            let qcfs = self.cfs_of(s);
            if enqueue {
                self.enqueue_entity(ctx, qcfs, s, EnqueueFlags::WAKEUP);
            }
            self.cfs_mut(qcfs).h_nr_running += task_delta;
            if self.cfs(qcfs).is_throttled() {
                break;
            }
            cur = self.parent_of(s);
        }
        if cur.is_none() {
            self.nr_running += task_delta;
        }

        // An idle CPU has work again
        if self.curr.is_none() && self.root().nr_running > 0 {
            self.resched_curr(ctx);
        }
    }

    /// Inherit the parent's throttle state in a freshly created queue
    pub fn sync_throttle(&mut self, cfs: CfsRqId) {
        if self.cfs(cfs).throttle_uptodate {
            return;
        }
        let Some(parent) = self.cfs(cfs).parent else {
            return;
        };
        let count = self.cfs(parent).throttle_count;
        let now = self.clock_task;
        let q = self.cfs_mut(cfs);
        q.throttle_count = count;
        q.throttle_uptodate = true;
        q.throttled_clock_task = now;
        self.publish_throttle_count(cfs);
    }

    /// Group queues of this CPU, parents first
    fn group_queues(&self) -> Vec<CfsRqId> {
        let mut queues: Vec<CfsRqId> =
            self.groups.values().filter(|s| s.se.is_some()).map(|s| s.cfs_rq).collect();
        queues.sort_by_key(|&c| self.queue_depth(c));
        queues
    }

    /// Re-read whether each group queue here is limited
    pub fn update_runtime_enabled(&mut self) {
        for cfs in self.group_queues() {
            let tg = self.cfs(cfs).tg.clone();
            let enabled = tg.bandwidth.lock().quota.is_some();
            self.cfs_mut(cfs).runtime_enabled = enabled;
        }
    }

    /// Release every throttled queue of a CPU going offline so its tasks
    /// can be moved away
    pub fn unthrottle_offline_cfs_rqs(&mut self, ctx: &Ctx<'_>) {
        for cfs in self.group_queues() {
            if !self.cfs(cfs).runtime_enabled {
                continue;
            }
            let q = self.cfs_mut(cfs);
            q.runtime_remaining = 1;
            q.runtime_enabled = false;
            if q.throttled {
                self.unthrottle_cfs_rq(ctx, cfs);
            }
        }
    }

    /// Number of group queues throttled here
    pub fn nr_throttled(&self) -> usize {
        self.queues.iter().filter(|(_, q)| q.throttled).count()
    }
}

// ===== Pool side =====

impl CfsScheduler {
    /// Set the quota (`None` for unlimited) and period of a group
    ///
    /// Rejected without any change when the values are out of range or
    /// the group's limit would exceed an ancestor's.
    pub fn set_group_bandwidth(&self, group: GroupId, quota: Option<u64>, period: u64) -> CfsResult<()> {
        let tg = self.groups.get(group)?;
        if tg.is_root() {
            return Err(CfsError::RootGroup);
        }
        if !(MIN_CFS_QUOTA_PERIOD_NS..=MAX_CFS_QUOTA_PERIOD_NS).contains(&period) {
            return Err(CfsError::InvalidPeriod);
        }
        if quota.is_some_and(|q| q < MIN_CFS_QUOTA_NS) {
            return Err(CfsError::InvalidQuota);
        }
        self.groups.check_schedulable(group, quota, period)?;

        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let now = self.now();
        {
            let mut pool = tg.bandwidth.lock();
            pool.period = period;
            pool.quota = quota;
            pool.refill(now);
            if quota.is_some() {
                pool.start(group, now, &*self.host.timers);
            }
        }

        for cpu in 0..self.nr_cpus() {
            let mut rq = self.rq(cpu);
            let Some(slot) = rq.groups.get(&group).cloned() else {
                continue;
            };
            let q = rq.cfs_mut(slot.cfs_rq);
            q.runtime_enabled = quota.is_some();
            q.runtime_remaining = 0;
            if q.throttled {
                rq.unthrottle_cfs_rq(&ctx, slot.cfs_rq);
            }
        }
        log::info!("[cfs] group {}: bandwidth quota {:?} period {}ns", group, quota, period);
        Ok(())
    }

    /// Quota and period of a group
    pub fn group_bandwidth(&self, group: GroupId) -> CfsResult<(Option<u64>, u64)> {
        let tg = self.groups.get(group)?;
        let pool = tg.bandwidth.lock();
        Ok((pool.quota, pool.period))
    }

    /// Bandwidth statistics of a group
    pub fn group_bandwidth_stats(&self, group: GroupId) -> CfsResult<BandwidthStats> {
        let tg = self.groups.get(group)?;
        let stats = tg.bandwidth.lock().stats();
        Ok(stats)
    }

    /// Entry point for an expired scheduler timer
    pub fn timer_fired(&self, key: TimerKey) {
        let (group, kind) = decode_timer_key(key);
        let Ok(tg) = self.groups.get(group) else {
            return;
        };
        match kind {
            TimerKind::Period => self.period_timer_fired(&tg),
            TimerKind::Slack => self.slack_timer_fired(&tg),
        }
    }

    /// Hand up to `remaining` runtime to the throttled queues of `tg`,
    /// unthrottling those that end up positive; returns what was used
    fn distribute_cfs_runtime(&self, tg: &Arc<TaskGroup>, cpus: &[usize], remaining: u64, expires: u64) -> u64 {
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let starting = remaining;
        let mut remaining = remaining;
        for &cpu in cpus {
            if cpu >= self.nr_cpus() {
                continue;
            }
            let mut rq = self.rq(cpu);
            let Some(slot) = rq.groups.get(&tg.id).cloned() else {
                continue;
            };
            let cfs = slot.cfs_rq;
            if !rq.cfs(cfs).throttled {
                continue;
            }
            let q = rq.cfs_mut(cfs);
            let runtime = ((1 - q.runtime_remaining).max(0) as u64).min(remaining);
            remaining -= runtime;
            q.runtime_remaining += runtime as i64;
            q.runtime_expires = expires;
            if q.runtime_remaining > 0 {
                rq.unthrottle_cfs_rq(&ctx, cfs);
            }
            drop(rq);
            if remaining == 0 {
                break;
            }
        }
        starting - remaining
    }

    /// Refill one period's worth and distribute it; true when the pool
    /// went idle
    fn do_sched_cfs_period_timer<'a>(
        &self,
        tg: &'a Arc<TaskGroup>,
        mut pool: MutexGuard<'a, CfsBandwidth>,
        overrun: u64,
        now: u64,
    ) -> (MutexGuard<'a, CfsBandwidth>, bool) {
        if pool.quota.is_none() {
            return (pool, true);
        }
        let mut throttled = !pool.throttled.is_empty();
        pool.nr_periods += overrun;
        pool.refill(now);

        if pool.idle && !throttled {
            return (pool, true);
        }
        if !throttled {
            // Stays armed for one more period to see whether demand returns
            pool.idle = true;
            return (pool, false);
        }

        pool.nr_throttled += overrun;
        let expires = pool.runtime_expires;
        while throttled && pool.runtime > 0 && !pool.distribute_running {
            let runtime = pool.runtime;
            let cpus: Vec<usize> = pool.throttled.iter().copied().collect();
            pool.distribute_running = true;
            drop(pool);

            let used = self.distribute_cfs_runtime(tg, &cpus, runtime, expires);

            pool = tg.bandwidth.lock();
            pool.distribute_running = false;
            throttled = !pool.throttled.is_empty();
            pool.runtime -= used.min(pool.runtime);
        }
        pool.idle = false;
        (pool, false)
    }

    /// Period timer of a group fired
    pub fn period_timer_fired(&self, tg: &Arc<TaskGroup>) {
        let now = self.now();
        let mut pool = tg.bandwidth.lock();
        let mut count: u32 = 0;
        let mut idle = false;
        pool.timer = PeriodTimer::Running { overruns: 0 };
        loop {
            let overrun = pool.forward(now);
            if overrun == 0 {
                break;
            }
            count += 1;
            if count > MAX_PERIOD_OVERRUNS {
                let old = pool.period;
                let new = old.saturating_mul(2);
                if new <= MAX_CFS_QUOTA_PERIOD_NS {
                    pool.period = new;
                    pool.quota = pool.quota.map(|q| q.saturating_mul(2));
                    log::warn!(
                        "[cfs] group {}: period timer overran, period raised to {}ns quota {:?}",
                        tg.id,
                        new,
                        pool.quota
                    );
                } else {
                    log::warn!("[cfs] group {}: period timer overran at the maximum period", tg.id);
                }
                count = 0;
            }
            pool.timer = PeriodTimer::Running { overruns: count };
            let (p, went_idle) = self.do_sched_cfs_period_timer(tg, pool, overrun, now);
            pool = p;
            idle = went_idle;
        }

        if idle {
            pool.timer = PeriodTimer::Idle;
        } else {
            pool.timer = PeriodTimer::Armed;
            self.host.timers.arm(timer_key(tg.id, TimerKind::Period), pool.timer_expires);
        }
    }

    /// Slack timer of a group fired
    pub fn slack_timer_fired(&self, tg: &Arc<TaskGroup>) {
        let tun = self.tunables.load();
        let (runtime, expires, cpus) = {
            let mut pool = tg.bandwidth.lock();
            pool.slack_armed = false;
            if pool.distribute_running {
                return;
            }
            if pool.refresh_within(tg.id, MIN_BANDWIDTH_EXPIRATION_NS, &*self.host.timers) {
                return;
            }
            let runtime = if pool.quota.is_some() && pool.runtime > tun.bandwidth_slice_ns { pool.runtime } else { 0 };
            if runtime == 0 {
                return;
            }
            pool.distribute_running = true;
            (runtime, pool.runtime_expires, pool.throttled.iter().copied().collect::<Vec<_>>())
        };

        let used = self.distribute_cfs_runtime(tg, &cpus, runtime, expires);

        let mut pool = tg.bandwidth.lock();
        if expires == pool.runtime_expires {
            pool.runtime -= used.min(pool.runtime);
        }
        pool.distribute_running = false;
    }
}
