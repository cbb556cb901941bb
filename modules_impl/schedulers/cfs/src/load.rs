//! # Load Accounting
//!
//! Per-entity averages are folded into their queue's averages on attach
//! and detach; a queue's load is folded into its group's total and from
//! there into the group entity's weight on every CPU. Hierarchical load
//! (`h_load`) expresses a queue's share of the root's load for the
//! balancer.

use crate::config::SchedFeatures;
use crate::entity::{CfsRqId, EntityId};
use crate::group::MIN_SHARES;
use crate::rq::{Ctx, Rq, CPU_LOAD_IDX_MAX};
use crate::weight::LoadWeight;
use core::sync::atomic::Ordering;
use helix_execution::ThreadId;

/// Shift of the `cpu_load` degrade factors
const DEGRADE_SHIFT: u32 = 7;

/// Missed ticks after which a `cpu_load` sample reads as zero
const DEGRADE_ZERO_TICKS: [u64; CPU_LOAD_IDX_MAX] = [0, 8, 32, 64, 128];

/// `(1 - 1/2^idx)^(2^j)` in 1/128 units
const DEGRADE_FACTOR: [[u64; DEGRADE_SHIFT as usize + 1]; CPU_LOAD_IDX_MAX] = [
    [0, 0, 0, 0, 0, 0, 0, 0],
    [64, 32, 8, 0, 0, 0, 0, 0],
    [96, 72, 40, 12, 1, 0, 0, 0],
    [112, 98, 75, 43, 15, 1, 0, 0],
    [120, 112, 98, 76, 45, 16, 2, 0],
];

/// Decay a `cpu_load[idx]` sample over `missed` ticks without updates
pub fn decay_load_missed(mut load: u64, mut missed: u64, idx: usize) -> u64 {
    if missed == 0 {
        return load;
    }
    if missed >= DEGRADE_ZERO_TICKS[idx] {
        return 0;
    }
    if idx == 1 {
        return load >> missed;
    }
    let mut j = 0;
    while missed != 0 {
        if missed % 2 == 1 {
            load = (load * DEGRADE_FACTOR[idx][j]) >> DEGRADE_SHIFT;
        }
        missed >>= 1;
        j += 1;
    }
    load
}

/// Running average with a 1/8 weight for the new sample
#[inline]
pub fn update_avg(avg: &mut u64, sample: u64) {
    let diff = sample as i64 - *avg as i64;
    *avg = (*avg as i64 + (diff >> 3)).max(0) as u64;
}

impl Rq {
    // =========================================================================
    // Entity and queue averages
    // =========================================================================

    /// Bring a queue's sample up to `now`, applying load removed by other
    /// CPUs; returns whether anything changed
    pub fn update_cfs_rq_load_avg(&mut self, now: u64, cfs: CfsRqId) -> bool {
        let scale = self.capacity_scale();
        let q = self.cfs_mut(cfs);
        let removed = q.shared.removed.drain_into(&mut q.avg);
        let weight = q.load.weight;
        let running = q.curr.is_some();
        let decayed = q.avg.update(now, weight, running, Some(&mut q.runnable), scale);
        q.shared.last_update_time.store(q.avg.last_update_time);
        decayed || removed
    }

    /// Bring an entity and its queue up to date
    pub fn update_load_avg(&mut self, _ctx: &Ctx<'_>, se: EntityId, update_tg: bool) {
        let cfs = self.cfs_of(se);
        let now = self.cfs_clock_task(cfs);
        let scale = self.capacity_scale();
        let running = self.cfs(cfs).curr == Some(se);
        let e = self.se_mut(se);
        let weight = if e.on_rq { e.load.weight } else { 0 };
        e.avg.update(now, weight, running, None, scale);
        if self.update_cfs_rq_load_avg(now, cfs) && update_tg {
            self.update_tg_load_avg(cfs, false);
        }
    }

    /// Fold a queue's load change into its group's total
    ///
    /// Skipped for small changes to keep the shared counter quiet.
    pub fn update_tg_load_avg(&mut self, cfs: CfsRqId, force: bool) {
        let q = self.cfs_mut(cfs);
        if q.is_root() {
            return;
        }
        let delta = q.avg.load_avg as i64 - q.tg_load_avg_contrib as i64;
        if force || delta.unsigned_abs() > q.tg_load_avg_contrib / 64 {
            q.tg.load_avg.fetch_add(delta, Ordering::AcqRel);
            q.tg_load_avg_contrib = q.avg.load_avg;
        }
    }

    /// Add an entity's history to the queue it joins
    pub fn attach_entity_load_avg(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId) {
        let cfs_last = self.cfs(cfs).avg.last_update_time;
        let scale = self.capacity_scale();
        let e = self.se_mut(se);
        if ctx.tun.feat(SchedFeatures::ATTACH_AGE_LOAD) && e.avg.last_update_time != 0 {
            // Decay the time spent away
            e.avg.update(cfs_last, 0, false, None, scale);
        }
        e.avg.last_update_time = cfs_last;
        let avg = e.avg;
        self.cfs_mut(cfs).avg.attach(&avg);
    }

    /// Remove an entity's history from its queue
    pub fn detach_entity_load_avg(&mut self, cfs: CfsRqId, se: EntityId) {
        let cfs_last = self.cfs(cfs).avg.last_update_time;
        let scale = self.capacity_scale();
        let running = self.cfs(cfs).curr == Some(se);
        let e = self.se_mut(se);
        let weight = if e.on_rq { e.load.weight } else { 0 };
        e.avg.update(cfs_last, weight, running, None, scale);
        let avg = e.avg;
        self.cfs_mut(cfs).avg.detach(&avg);
    }

    /// Account an entity joining the queue's runnable load
    ///
    /// An entity with `last_update_time == 0` arrived from another CPU
    /// and its history is attached here.
    pub fn enqueue_entity_load_avg(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId) {
        let now = self.cfs_clock_task(cfs);
        let migrated = self.se(se).avg.last_update_time == 0;
        if !migrated {
            let scale = self.capacity_scale();
            let running = self.cfs(cfs).curr == Some(se);
            let e = self.se_mut(se);
            let weight = if e.on_rq { e.load.weight } else { 0 };
            e.avg.update(now, weight, running, None, scale);
        }
        let decayed = self.update_cfs_rq_load_avg(now, cfs);
        let avg = self.se(se).avg;
        self.cfs_mut(cfs).runnable.add(&avg);
        if migrated {
            self.attach_entity_load_avg(ctx, cfs, se);
        }
        if decayed || migrated {
            self.update_tg_load_avg(cfs, false);
        }
    }

    /// Account an entity leaving the queue's runnable load; its history
    /// stays as blocked load
    pub fn dequeue_entity_load_avg(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId) {
        self.update_load_avg(ctx, se, true);
        let avg = self.se(se).avg;
        self.cfs_mut(cfs).runnable.sub(&avg);
    }

    /// Hand a departing entity's blocked load to its queue's removal
    /// accumulator, aged to the queue's last update
    pub fn remove_entity_load_avg(&mut self, se: EntityId) {
        let cfs = self.cfs_of(se);
        let shared = self.cfs(cfs).shared.clone();
        let last = shared.last_update_time.load();
        let scale = self.capacity_scale();
        let e = self.se_mut(se);
        e.avg.update(last, 0, false, None, scale);
        shared.removed.add(&e.avg);
    }

    // =========================================================================
    // Group shares
    // =========================================================================

    /// Weight the group entity of `cfs` should carry
    ///
    /// The group's shares split by this queue's part of the group load,
    /// using the instantaneous local weight in place of the stale local
    /// contribution.
    pub fn calc_cfs_shares(&self, cfs: CfsRqId) -> u64 {
        let q = self.cfs(cfs);
        let tg_shares = q.tg.shares();
        let load = q.load.weight;
        let tg_weight = (q.tg.load_avg() - q.tg_load_avg_contrib as i64 + load as i64).max(0) as u64;
        let mut shares = tg_shares * load;
        if tg_weight != 0 {
            shares /= tg_weight;
        }
        shares.clamp(MIN_SHARES, tg_shares)
    }

    /// Recompute the weight of the group entity of `cfs`
    pub fn update_cfs_shares(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId) {
        let q = self.cfs(cfs);
        let Some(se) = q.se else {
            return;
        };
        if q.throttled_hierarchy() {
            return;
        }
        let shares = self.calc_cfs_shares(cfs);
        let parent = self.cfs_of(se);
        self.reweight_entity(ctx, parent, se, shares);
    }

    /// Change an entity's weight, keeping its queue's sum consistent
    pub fn reweight_entity(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId, weight: u64) {
        let on_rq = self.se(se).on_rq;
        if on_rq {
            if self.cfs(cfs).curr == Some(se) {
                self.update_curr(ctx, cfs);
            }
            let old = self.se(se).load.weight;
            self.cfs_mut(cfs).load.sub(old);
        }
        self.se_mut(se).load = LoadWeight::new(weight);
        if on_rq {
            self.cfs_mut(cfs).load.add(weight);
        }
    }

    // =========================================================================
    // Blocked load
    // =========================================================================

    /// Decay the averages of every queue on this CPU, including those
    /// with only blocked load, and forget fully decayed idle queues
    pub fn update_blocked_averages(&mut self, ctx: &Ctx<'_>) {
        self.update_clock(ctx);
        let leaves = self.leaf_list.clone();
        for cfs in leaves {
            if self.cfs(cfs).throttled_hierarchy() {
                continue;
            }
            let now = self.cfs_clock_task(cfs);
            if self.update_cfs_rq_load_avg(now, cfs) {
                self.update_tg_load_avg(cfs, false);
            }
            if let Some(se) = self.cfs(cfs).se {
                self.update_load_avg(ctx, se, false);
            }

            let q = self.cfs(cfs);
            if !q.is_root() && q.nr_running == 0 && q.avg.load_sum == 0 && q.avg.util_sum == 0 {
                self.list_del_leaf(cfs);
            }
        }
    }

    /// Unlink a decayed queue from the leaf list
    pub fn list_del_leaf(&mut self, cfs: CfsRqId) {
        if !self.cfs(cfs).on_list {
            return;
        }
        self.leaf_list.retain(|&c| c != cfs);
        let cpu = self.cpu;
        let q = self.cfs_mut(cfs);
        q.on_list = false;
        if let Some(state) = q.tg.per_cpu.get(cpu) {
            state.cfs_load_avg.store(0, Ordering::Relaxed);
            state.load_avg_contrib.store(q.tg_load_avg_contrib, Ordering::Relaxed);
            state.se_load_avg.store(0, Ordering::Relaxed);
        }
    }

    // =========================================================================
    // Hierarchical load
    // =========================================================================

    /// Compute `h_load` from the root down to `cfs`, once per tick
    pub fn update_cfs_rq_h_load(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId) {
        // Offset so a zero stamp means never computed
        let now = self.jiffies(ctx) + 1;
        if self.cfs(cfs).last_h_load_update == now {
            return;
        }

        self.cfs_mut(cfs).h_load_next = None;
        let mut q = cfs;
        let mut se = self.cfs(cfs).se;
        while let Some(s) = se {
            q = self.cfs_of(s);
            self.cfs_mut(q).h_load_next = Some(s);
            if self.cfs(q).last_h_load_update == now {
                break;
            }
            se = self.parent_of(s);
        }
        if se.is_none() {
            let root = self.cfs_mut(q);
            root.h_load = root.avg.load_avg;
            root.last_h_load_update = now;
        }

        while let Some(s) = self.cfs(q).h_load_next {
            let parent = self.cfs(q);
            let load = parent.h_load * self.se(s).avg.load_avg / (parent.avg.load_avg + 1);
            let Some(child) = self.se(s).my_q else {
                break;
            };
            let c = self.cfs_mut(child);
            c.h_load = load;
            c.last_h_load_update = now;
            q = child;
        }
    }

    /// Load a task contributes as seen from the root queue
    pub fn task_h_load(&mut self, ctx: &Ctx<'_>, id: ThreadId) -> u64 {
        let Some(se) = self.task_se(id) else {
            return 0;
        };
        let cfs = self.cfs_of(se);
        self.update_cfs_rq_h_load(ctx, cfs);
        let q = self.cfs(cfs);
        self.se(se).avg.load_avg * q.h_load / (q.avg.load_avg + 1)
    }

    // =========================================================================
    // CPU load history
    // =========================================================================

    /// Fold the current runnable load into the decayed `cpu_load` samples,
    /// catching up on ticks missed while idle
    pub fn update_cpu_load(&mut self, ctx: &Ctx<'_>) {
        let now = self.jiffies(ctx);
        let pending = now.saturating_sub(self.last_load_update_tick);
        if pending == 0 {
            return;
        }
        self.last_load_update_tick = now;
        let this_load = self.root().runnable.avg;

        self.cpu_load[0] = this_load;
        let mut scale: u64 = 2;
        for i in 1..CPU_LOAD_IDX_MAX {
            let old = decay_load_missed(self.cpu_load[i], pending - 1, i);
            let mut new = this_load;
            // Round up so the sample can reach the new load
            if new > old {
                new += scale - 1;
            }
            self.cpu_load[i] = (old * (scale - 1) + new) >> i;
            scale += scale;
        }
    }

    /// Fold the idle period that just ended into `avg_idle`
    pub fn account_idle_wakeup(&mut self) {
        if self.idle_stamp == 0 {
            return;
        }
        let delta = self.clock.saturating_sub(self.idle_stamp);
        let max = 2 * self.max_idle_balance_cost;
        update_avg(&mut self.avg_idle, delta);
        if self.avg_idle > max {
            self.avg_idle = max;
        }
        self.idle_stamp = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_load_missed() {
        assert_eq!(decay_load_missed(1000, 0, 2), 1000);
        assert_eq!(decay_load_missed(1000, 3, 1), 125);
        assert_eq!(decay_load_missed(1000, 8, 1), 0);
        // One missed tick at idx 2 keeps 3/4
        assert_eq!(decay_load_missed(1024, 1, 2), 768);
        // Three missed ticks: 96/128 * 72/128
        assert_eq!(decay_load_missed(1024, 3, 2), (((1024 * 96) >> 7) * 72) >> 7);
        assert_eq!(decay_load_missed(1024, 200, 4), 0);
    }

    #[test]
    fn test_update_avg_moves_an_eighth() {
        let mut avg = 800;
        update_avg(&mut avg, 0);
        assert_eq!(avg, 700);
        update_avg(&mut avg, 1500);
        assert_eq!(avg, 800);
    }
}
