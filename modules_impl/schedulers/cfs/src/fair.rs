//! # Fair Class Core
//!
//! Entity-level enqueue, dequeue, pick and preemption on one run queue.
//! Every function here runs with the run queue locked.
//!
//! Vruntime of a queued or running entity is absolute within its queue.
//! An entity leaving for good has its queue's `min_vruntime` subtracted
//! so it can be re-based on another queue; a sleeping entity keeps its
//! absolute value and is normalized when it wakes.

use crate::entity::{CfsRqId, EntityId};
use crate::group::TaskGroup;
use crate::rq::{Ctx, MovingTask, Rq};
use crate::task::{DequeueFlags, EnqueueFlags, TaskPolicy, TaskState, WakeFlags};
use crate::vtime::{before, max_vruntime, min_vruntime, sched_period, vdiff};
use crate::weight::{calc_delta, calc_delta_fair, LoadWeight};
use crate::config::SchedFeatures;
use alloc::sync::Arc;
use helix_execution::ThreadId;

impl Rq {
    // =========================================================================
    // Virtual time
    // =========================================================================

    /// Move `min_vruntime` up to the smallest vruntime in the queue
    pub fn update_min_vruntime(&mut self, cfs: CfsRqId) {
        let q = self.cfs(cfs);
        let mut vruntime = q.min_vruntime;
        let curr = q.curr.map(|c| self.se(c).vruntime);
        if let Some(v) = curr {
            vruntime = v;
        }
        if let Some(left) = q.first() {
            let lv = self.se(left).vruntime;
            vruntime = match curr {
                None => lv,
                Some(_) => min_vruntime(vruntime, lv),
            };
        }
        let q = self.cfs_mut(cfs);
        q.min_vruntime = max_vruntime(q.min_vruntime, vruntime);
        q.shared.min_vruntime.store(q.min_vruntime);
    }

    /// Wall-clock slice `se` gets in one period, walking up the hierarchy
    /// to scale by its share at every level
    pub fn sched_slice(&self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId) -> u64 {
        let on_rq = self.se(se).on_rq;
        let nr = self.cfs(cfs).nr_running as u64 + u64::from(!on_rq);
        let mut slice = sched_period(nr, ctx.tun);
        let mut cur = Some(se);
        while let Some(s) = cur {
            let e = self.se(s);
            let mut load: LoadWeight = self.cfs(e.cfs_rq).load;
            if !e.on_rq {
                load.add(e.load.weight);
            }
            slice = calc_delta(slice, e.load.weight, &load);
            cur = e.parent;
        }
        slice
    }

    /// `sched_slice` in virtual time
    pub fn sched_vslice(&self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId) -> u64 {
        calc_delta_fair(self.sched_slice(ctx, cfs, se), &self.se(se).load)
    }

    /// Position an entity joining the queue
    ///
    /// New entities start a virtual slice behind `min_vruntime`; waking
    /// ones get at most half a latency (one with gentle sleepers off) of
    /// credit, and never move backwards.
    pub fn place_entity(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId, initial: bool) {
        let mut vruntime = self.cfs(cfs).min_vruntime;
        if initial && ctx.tun.feat(SchedFeatures::START_DEBIT) {
            vruntime = vruntime.wrapping_add(self.sched_vslice(ctx, cfs, se));
        }
        if !initial {
            let mut thresh = ctx.tun.latency_ns;
            if ctx.tun.feat(SchedFeatures::GENTLE_FAIR_SLEEPERS) {
                thresh >>= 1;
            }
            vruntime = vruntime.wrapping_sub(thresh);
        }
        let e = self.se_mut(se);
        e.vruntime = max_vruntime(e.vruntime, vruntime);
    }

    /// Charge the running entity of `cfs` for the time since it was last
    /// charged
    pub fn update_curr(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId) {
        let Some(curr) = self.cfs(cfs).curr else {
            return;
        };
        let now = self.clock_task;
        let delta = vdiff(now, self.se(curr).exec_start);
        if delta <= 0 {
            return;
        }
        let delta = delta as u64;
        {
            let se = self.se_mut(curr);
            se.exec_start = now;
            se.stats.exec_max = se.stats.exec_max.max(delta);
            se.sum_exec_runtime += delta;
            let vdelta = calc_delta_fair(delta, &se.load);
            se.vruntime = se.vruntime.wrapping_add(vdelta);
        }
        self.cfs_mut(cfs).exec_clock += delta;
        self.update_min_vruntime(cfs);
        self.account_cfs_rq_runtime(ctx, cfs, delta);
    }

    // =========================================================================
    // Timeline and statistics
    // =========================================================================

    fn timeline_insert(&mut self, cfs: CfsRqId, se: EntityId) {
        let v = self.se(se).vruntime;
        let key = self.cfs_mut(cfs).timeline.insert(v, se);
        self.se_mut(se).run_node = Some(key);
    }

    fn timeline_remove(&mut self, cfs: CfsRqId, se: EntityId) {
        if let Some(key) = self.se_mut(se).run_node.take() {
            self.cfs_mut(cfs).timeline.remove(key);
        }
    }

    /// Entity following `se` in its queue's timeline
    pub fn next_entity(&self, se: EntityId) -> Option<EntityId> {
        let e = self.se(se);
        let key = e.run_node?;
        self.cfs(e.cfs_rq).timeline.next_after(key)
    }

    fn update_stats_wait_start(&mut self, se: EntityId) {
        let now = self.clock;
        self.se_mut(se).stats.wait_start = now;
    }

    fn update_stats_wait_end(&mut self, se: EntityId) {
        let now = self.clock;
        let stats = &mut self.se_mut(se).stats;
        let delta = now.saturating_sub(stats.wait_start);
        stats.wait_max = stats.wait_max.max(delta);
        stats.wait_count += 1;
        stats.wait_sum += delta;
        stats.wait_start = 0;
    }

    fn update_stats_enqueue(&mut self, cfs: CfsRqId, se: EntityId) {
        if self.cfs(cfs).curr != Some(se) {
            self.update_stats_wait_start(se);
        }
    }

    fn update_stats_dequeue(&mut self, cfs: CfsRqId, se: EntityId, flags: DequeueFlags) {
        if self.cfs(cfs).curr != Some(se) {
            self.update_stats_wait_end(se);
        }
        if flags.contains(DequeueFlags::SLEEP) && self.se(se).is_task() {
            let now = self.clock;
            self.se_mut(se).stats.sleep_start = now;
        }
    }

    fn enqueue_sleeper(&mut self, se: EntityId) {
        let now = self.clock;
        let stats = &mut self.se_mut(se).stats;
        if stats.sleep_start != 0 {
            let delta = now.saturating_sub(stats.sleep_start);
            stats.sleep_max = stats.sleep_max.max(delta);
            stats.sleep_start = 0;
        }
        if stats.block_start != 0 {
            let delta = now.saturating_sub(stats.block_start);
            stats.block_max = stats.block_max.max(delta);
            stats.block_start = 0;
        }
    }

    fn check_spread(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId) {
        let d = vdiff(self.se(se).vruntime, self.cfs(cfs).min_vruntime).unsigned_abs();
        if d > 3 * ctx.tun.latency_ns {
            self.cfs_mut(cfs).nr_spread_over += 1;
        }
    }

    // =========================================================================
    // Enqueue / dequeue
    // =========================================================================

    /// Add an entity's weight to its queue
    pub fn account_entity_enqueue(&mut self, cfs: CfsRqId, se: EntityId) {
        let w = self.se(se).load.weight;
        if let Some(id) = self.se(se).task() {
            self.cfs_tasks.push_front(id);
        }
        let q = self.cfs_mut(cfs);
        q.load.add(w);
        q.nr_running += 1;
    }

    /// Remove an entity's weight from its queue
    pub fn account_entity_dequeue(&mut self, cfs: CfsRqId, se: EntityId) {
        let w = self.se(se).load.weight;
        if let Some(id) = self.se(se).task() {
            self.cfs_tasks.retain(|&t| t != id);
        }
        let q = self.cfs_mut(cfs);
        assert!(q.nr_running > 0, "cfs_rq nr_running underflow");
        q.load.sub(w);
        q.nr_running -= 1;
    }

    /// Queue one entity on one level
    pub fn enqueue_entity(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId, flags: EnqueueFlags) {
        // Re-base a normalized vruntime; sleepers still hold an absolute one
        if !flags.contains(EnqueueFlags::WAKEUP) || flags.contains(EnqueueFlags::WAKING) {
            let min = self.cfs(cfs).min_vruntime;
            let e = self.se_mut(se);
            e.vruntime = e.vruntime.wrapping_add(min);
        }

        self.update_curr(ctx, cfs);
        self.enqueue_entity_load_avg(ctx, cfs, se);
        self.account_entity_enqueue(cfs, se);
        self.update_cfs_shares(ctx, cfs);

        if flags.contains(EnqueueFlags::WAKEUP) {
            self.place_entity(ctx, cfs, se, false);
            self.enqueue_sleeper(se);
        }

        self.update_stats_enqueue(cfs, se);
        self.check_spread(ctx, cfs, se);
        if self.cfs(cfs).curr != Some(se) {
            self.timeline_insert(cfs, se);
        }
        self.se_mut(se).on_rq = true;

        if self.cfs(cfs).nr_running == 1 {
            self.list_add_leaf(cfs);
            self.check_enqueue_throttle(ctx, cfs);
        }
    }

    /// Remove one entity from one level
    pub fn dequeue_entity(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId, flags: DequeueFlags) {
        self.update_curr(ctx, cfs);
        self.dequeue_entity_load_avg(ctx, cfs, se);
        self.update_stats_dequeue(cfs, se, flags);
        self.clear_buddies(cfs, se);

        if self.cfs(cfs).curr != Some(se) {
            self.timeline_remove(cfs, se);
        }
        self.se_mut(se).on_rq = false;
        self.account_entity_dequeue(cfs, se);

        // Leaving for good: make vruntime relative
        if !flags.contains(DequeueFlags::SLEEP) {
            let min = self.cfs(cfs).min_vruntime;
            let e = self.se_mut(se);
            e.vruntime = e.vruntime.wrapping_sub(min);
        }

        self.return_cfs_rq_runtime(ctx, cfs);
        self.update_min_vruntime(cfs);
        self.update_cfs_shares(ctx, cfs);
    }

    /// Queue a task and every ancestor that is not queued yet
    pub fn enqueue_task(&mut self, ctx: &Ctx<'_>, id: ThreadId, flags: EnqueueFlags) {
        let Some(se) = self.task_se(id) else {
            return;
        };
        let mut flags = flags;
        let mut cur = Some(se);
        while let Some(s) = cur {
            if self.se(s).on_rq {
                break;
            }
            let cfs = self.cfs_of(s);
            self.enqueue_entity(ctx, cfs, s, flags);
            // A throttled queue keeps its entity out of the parent
            if self.cfs(cfs).is_throttled() {
                break;
            }
            self.cfs_mut(cfs).h_nr_running += 1;
            flags = EnqueueFlags::WAKEUP;
            cur = self.parent_of(s);
        }

        while let Some(s) = cur {
            let cfs = self.cfs_of(s);
            self.cfs_mut(cfs).h_nr_running += 1;
            if self.cfs(cfs).is_throttled() {
                break;
            }
            self.update_load_avg(ctx, s, true);
            self.update_cfs_shares(ctx, cfs);
            cur = self.parent_of(s);
        }

        if cur.is_none() {
            self.nr_running += 1;
        }
    }

    /// Dequeue a task and every ancestor left empty
    pub fn dequeue_task(&mut self, ctx: &Ctx<'_>, id: ThreadId, flags: DequeueFlags) {
        let Some(se) = self.task_se(id) else {
            return;
        };
        let task_sleep = flags.contains(DequeueFlags::SLEEP);
        let mut flags = flags;
        let mut cur = Some(se);
        while let Some(s) = cur {
            let cfs = self.cfs_of(s);
            self.dequeue_entity(ctx, cfs, s, flags);
            if self.cfs(cfs).is_throttled() {
                break;
            }
            let q = self.cfs_mut(cfs);
            assert!(q.h_nr_running > 0, "h_nr_running underflow");
            q.h_nr_running -= 1;

            // Parent keeps its place while it has other entities
            if self.cfs(cfs).load.weight != 0 {
                cur = self.parent_of(s);
                if let Some(parent) = cur {
                    if task_sleep && !self.cfs(cfs).throttled_hierarchy() {
                        self.set_next_buddy(parent);
                    }
                }
                break;
            }
            flags |= DequeueFlags::SLEEP;
            cur = self.parent_of(s);
        }

        while let Some(s) = cur {
            let cfs = self.cfs_of(s);
            let q = self.cfs_mut(cfs);
            assert!(q.h_nr_running > 0, "h_nr_running underflow");
            q.h_nr_running -= 1;
            if self.cfs(cfs).is_throttled() {
                break;
            }
            self.update_load_avg(ctx, s, true);
            self.update_cfs_shares(ctx, cfs);
            cur = self.parent_of(s);
        }

        if cur.is_none() {
            assert!(self.nr_running > 0, "rq nr_running underflow");
            self.nr_running -= 1;
        }
    }

    // =========================================================================
    // Buddies
    // =========================================================================

    /// Drop every buddy hint pointing at `se` on its path
    pub fn clear_buddies(&mut self, cfs: CfsRqId, se: EntityId) {
        let q = self.cfs(cfs);
        let (last, next, skip) = (q.last == Some(se), q.next == Some(se), q.skip == Some(se));
        if last {
            self.clear_buddy_path(se, |q| &mut q.last);
        }
        if next {
            self.clear_buddy_path(se, |q| &mut q.next);
        }
        if skip {
            self.clear_buddy_path(se, |q| &mut q.skip);
        }
    }

    fn clear_buddy_path(&mut self, se: EntityId, slot: fn(&mut crate::cfs_rq::CfsRq) -> &mut Option<EntityId>) {
        let mut cur = Some(se);
        while let Some(s) = cur {
            let cfs = self.cfs_of(s);
            let buddy = slot(self.cfs_mut(cfs));
            if *buddy != Some(s) {
                break;
            }
            *buddy = None;
            cur = self.parent_of(s);
        }
    }

    /// Prefer `se` on the next pick at every level
    pub fn set_next_buddy(&mut self, se: EntityId) {
        if self.se_is_idle_policy(se) {
            return;
        }
        for s in self.hierarchy(se) {
            let cfs = self.cfs_of(s);
            self.cfs_mut(cfs).next = Some(s);
        }
    }

    /// Prefer returning to `se` at every level
    pub fn set_last_buddy(&mut self, se: EntityId) {
        if self.se_is_idle_policy(se) {
            return;
        }
        for s in self.hierarchy(se) {
            let cfs = self.cfs_of(s);
            self.cfs_mut(cfs).last = Some(s);
        }
    }

    /// Avoid `se` on the next pick at every level
    pub fn set_skip_buddy(&mut self, se: EntityId) {
        for s in self.hierarchy(se) {
            let cfs = self.cfs_of(s);
            self.cfs_mut(cfs).skip = Some(s);
        }
    }

    // =========================================================================
    // Pick
    // =========================================================================

    /// Wakeup granularity in the virtual time of `se`
    fn wakeup_gran(&self, ctx: &Ctx<'_>, se: EntityId) -> u64 {
        calc_delta_fair(ctx.tun.wakeup_granularity_ns, &self.se(se).load)
    }

    /// Should `se` preempt `curr`?
    ///
    /// -1 when `curr` is not ahead, 0 when ahead by at most the wakeup
    /// granularity, 1 when further ahead.
    pub fn wakeup_preempt_entity(&self, ctx: &Ctx<'_>, curr: EntityId, se: EntityId) -> i32 {
        let diff = vdiff(self.se(curr).vruntime, self.se(se).vruntime);
        if diff <= 0 {
            return -1;
        }
        if diff as u64 > self.wakeup_gran(ctx, se) {
            return 1;
        }
        0
    }

    /// Choose the entity to run from `cfs`
    ///
    /// The leftmost entity, unless a buddy may run instead without being
    /// too unfair to it.
    pub fn pick_next_entity(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, curr: Option<EntityId>) -> Option<EntityId> {
        let first = self.cfs(cfs).first();
        let left = match (first, curr) {
            (None, c) => c,
            (Some(f), Some(c)) if before(self.se(c).vruntime, self.se(f).vruntime) => Some(c),
            (f, _) => f,
        };
        let left = left?;
        let mut se = left;

        let q = self.cfs(cfs);
        let (skip, last, next) = (q.skip, q.last, q.next);

        if skip == Some(se) {
            let second = if Some(se) == curr {
                first
            } else {
                match (self.next_entity(se), curr) {
                    (None, c) => c,
                    (Some(s), Some(c)) if before(self.se(c).vruntime, self.se(s).vruntime) => Some(c),
                    (s, _) => s,
                }
            };
            if let Some(second) = second {
                if self.wakeup_preempt_entity(ctx, second, left) < 1 {
                    se = second;
                }
            }
        }

        // Return the CPU to a task preempted by a wakeup
        if let Some(last) = last {
            if self.wakeup_preempt_entity(ctx, last, left) < 1 {
                se = last;
            }
        }

        // A wakee that asked to run next, if that is not unfair
        if let Some(next) = next {
            if self.wakeup_preempt_entity(ctx, next, left) < 1 {
                se = next;
            }
        }

        self.clear_buddies(cfs, se);
        Some(se)
    }

    /// Make `se` the running entity of `cfs`
    pub fn set_next_entity(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, se: EntityId) {
        if self.se(se).on_rq {
            self.update_stats_wait_end(se);
            self.timeline_remove(cfs, se);
            self.update_load_avg(ctx, se, true);
        }
        let now = self.clock_task;
        let rq_weight = self.root().load.weight;
        self.cfs_mut(cfs).curr = Some(se);
        let e = self.se_mut(se);
        e.exec_start = now;
        if rq_weight >= 2 * e.load.weight {
            let ran = e.sum_exec_runtime - e.prev_sum_exec_runtime;
            e.stats.slice_max = e.stats.slice_max.max(ran);
        }
        e.prev_sum_exec_runtime = e.sum_exec_runtime;
    }

    /// Return the running entity of `cfs` to its timeline
    pub fn put_prev_entity(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, prev: EntityId) {
        if self.se(prev).on_rq {
            self.update_curr(ctx, cfs);
        }
        self.check_cfs_rq_runtime(ctx, cfs);
        self.check_spread(ctx, cfs, prev);
        if self.se(prev).on_rq {
            self.update_stats_wait_start(prev);
            self.timeline_insert(cfs, prev);
            self.update_load_avg(ctx, prev, false);
        }
        self.cfs_mut(cfs).curr = None;
    }

    /// Pick the next task, descending through group queues
    ///
    /// The previous task is put back first. Returns `None` when nothing
    /// is runnable; the caller may then try an idle balance.
    pub fn pick_next_task(&mut self, ctx: &Ctx<'_>) -> Option<ThreadId> {
        let prev = self.curr;
        self.put_prev_task(ctx);

        'again: loop {
            if self.root().nr_running == 0 {
                self.need_resched = false;
                return None;
            }
            let mut cfs = crate::entity::CfsRqId::ROOT;
            loop {
                let Some(se) = self.pick_next_entity(ctx, cfs, None) else {
                    // Only a throttled subtree remained
                    continue 'again;
                };
                match self.se(se).my_q {
                    Some(child) => {
                        // Out of runtime: throttle and look again
                        if self.check_cfs_rq_runtime(ctx, child) {
                            continue 'again;
                        }
                        self.set_next_entity(ctx, cfs, se);
                        cfs = child;
                    }
                    None => {
                        self.set_next_entity(ctx, cfs, se);
                        let id = self.se(se).task()?;
                        if prev != Some(id) {
                            self.nr_switches += 1;
                        }
                        self.curr = Some(id);
                        self.need_resched = false;
                        // Running task goes first in the balancer's list
                        self.cfs_tasks.retain(|&t| t != id);
                        self.cfs_tasks.push_front(id);
                        log::trace!("[cfs] cpu{}: pick {} vruntime {}", self.cpu, id, self.se(se).vruntime);
                        return Some(id);
                    }
                }
            }
        }
    }

    /// Stop running the current task, leaving it queued if runnable
    pub fn put_prev_task(&mut self, ctx: &Ctx<'_>) {
        let Some(se) = self.curr_se() else {
            self.curr = None;
            return;
        };
        for s in self.hierarchy(se) {
            let cfs = self.cfs_of(s);
            if self.cfs(cfs).curr == Some(s) {
                self.put_prev_entity(ctx, cfs, s);
            }
        }
        self.curr = None;
    }

    /// Re-establish the running task after it was put back in place
    pub fn set_curr_task(&mut self, ctx: &Ctx<'_>, id: ThreadId) {
        let Some(se) = self.task_se(id) else {
            return;
        };
        for s in self.hierarchy(se) {
            let cfs = self.cfs_of(s);
            self.set_next_entity(ctx, cfs, s);
            self.account_cfs_rq_runtime(ctx, cfs, 0);
        }
        self.curr = Some(id);
    }

    // =========================================================================
    // Preemption
    // =========================================================================

    /// Preempt the running entity once it used up its slice, or once the
    /// leftmost entity is more than a slice behind it
    pub fn check_preempt_tick(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, curr: EntityId) {
        let ideal_runtime = self.sched_slice(ctx, cfs, curr);
        let e = self.se(curr);
        let delta_exec = e.sum_exec_runtime - e.prev_sum_exec_runtime;
        if delta_exec > ideal_runtime {
            self.resched_curr(ctx);
            // Overran: no buddy favour on the next pick
            self.clear_buddies(cfs, curr);
            return;
        }

        // Avoid thrashing on very short runs
        if delta_exec < ctx.tun.min_granularity_ns {
            return;
        }

        let Some(left) = self.cfs(cfs).first() else {
            return;
        };
        let delta = vdiff(self.se(curr).vruntime, self.se(left).vruntime);
        if delta < 0 {
            return;
        }
        if delta as u64 > ideal_runtime {
            self.resched_curr(ctx);
        }
    }

    fn entity_tick(&mut self, ctx: &Ctx<'_>, cfs: CfsRqId, curr: EntityId) {
        self.update_curr(ctx, cfs);
        self.update_load_avg(ctx, curr, true);
        self.update_cfs_shares(ctx, cfs);
        if self.cfs(cfs).nr_running > 1 {
            self.check_preempt_tick(ctx, cfs, curr);
        }
    }

    /// Periodic accounting of the running task
    pub fn task_tick(&mut self, ctx: &Ctx<'_>) {
        let Some(se) = self.curr_se() else {
            return;
        };
        for s in self.hierarchy(se) {
            let cfs = self.cfs_of(s);
            self.entity_tick(ctx, cfs, s);
        }
    }

    /// Walk `se` and `pse` up to the first level where they are siblings
    pub fn find_matching_se(&self, se: EntityId, pse: EntityId) -> (EntityId, EntityId) {
        let (mut se, mut pse) = (se, pse);
        let mut se_depth = self.se(se).depth;
        let mut pse_depth = self.se(pse).depth;
        while se_depth > pse_depth {
            se_depth -= 1;
            se = self.se(se).parent.unwrap_or(se);
        }
        while pse_depth > se_depth {
            pse_depth -= 1;
            pse = self.se(pse).parent.unwrap_or(pse);
        }
        while self.se(se).cfs_rq != self.se(pse).cfs_rq {
            match (self.se(se).parent, self.se(pse).parent) {
                (Some(a), Some(b)) => {
                    se = a;
                    pse = b;
                }
                _ => break,
            }
        }
        (se, pse)
    }

    /// Decide whether the woken task `p` should preempt the running one
    pub fn check_preempt_wakeup(&mut self, ctx: &Ctx<'_>, p: ThreadId, wake_flags: WakeFlags) {
        let Some(pse) = self.task_se(p) else {
            return;
        };
        let Some(curr_id) = self.curr else {
            // Idle CPU: anything runnable wins
            self.resched_curr(ctx);
            return;
        };
        let Some(curr_se) = self.task_se(curr_id) else {
            return;
        };
        if curr_se == pse {
            return;
        }
        let curr_cfs = self.cfs_of(curr_se);
        if self.cfs(self.cfs_of(pse)).throttled_hierarchy() {
            return;
        }

        let scale = self.cfs(curr_cfs).nr_running as u64 >= ctx.tun.nr_latency;
        let mut next_buddy_marked = false;
        if ctx.tun.feat(SchedFeatures::NEXT_BUDDY) && scale && !wake_flags.contains(WakeFlags::FORK) {
            self.set_next_buddy(pse);
            next_buddy_marked = true;
        }

        if self.need_resched {
            return;
        }

        let curr_policy = self.task_of(curr_se).map(|t| t.policy());
        let p_policy = self.task_of(pse).map(|t| t.policy());

        let mut se = curr_se;
        let preempt = if curr_policy == Some(TaskPolicy::Idle) && p_policy != Some(TaskPolicy::Idle) {
            true
        } else {
            // Batch and idle wakees never preempt
            if p_policy != Some(TaskPolicy::Normal) || !ctx.tun.feat(SchedFeatures::WAKEUP_PREEMPTION) {
                return;
            }
            let (s, ps) = self.find_matching_se(curr_se, pse);
            se = s;
            self.update_curr(ctx, self.cfs_of(se));
            if self.wakeup_preempt_entity(ctx, se, ps) == 1 {
                if !next_buddy_marked {
                    self.set_next_buddy(ps);
                }
                true
            } else {
                false
            }
        };
        if !preempt {
            return;
        }

        log::trace!("[cfs] cpu{}: {} preempts {}", self.cpu, p, curr_id);
        self.resched_curr(ctx);

        // Keep the preempted task close for cache reuse
        if !self.se(se).on_rq {
            return;
        }
        if ctx.tun.feat(SchedFeatures::LAST_BUDDY) && scale && self.se(se).is_task() {
            self.set_last_buddy(se);
        }
    }

    // =========================================================================
    // Yield
    // =========================================================================

    /// The running task gives way to the others on its queue
    pub fn yield_task(&mut self, ctx: &Ctx<'_>) {
        let Some(curr) = self.curr_se() else {
            return;
        };
        // Nothing to yield to
        if self.nr_running == 1 {
            return;
        }
        let cfs = self.cfs_of(curr);
        self.clear_buddies(cfs, curr);

        if self.task_of(curr).map(|t| t.policy()) != Some(TaskPolicy::Batch) {
            self.update_clock(ctx);
            self.update_curr(ctx, cfs);
        }
        self.set_skip_buddy(curr);
    }

    /// Yield in favour of `p`; false when `p` cannot run now
    pub fn yield_to_task(&mut self, ctx: &Ctx<'_>, p: ThreadId) -> bool {
        let Some(se) = self.task_se(p) else {
            return false;
        };
        if !self.se(se).on_rq || self.cfs(self.cfs_of(se)).throttled_hierarchy() {
            return false;
        }
        self.set_next_buddy(se);
        self.yield_task(ctx);
        true
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Give a new child its starting vruntime, normalized
    pub fn task_fork(&mut self, ctx: &Ctx<'_>, child: EntityId) {
        self.update_clock(ctx);
        let cfs = self.cfs_of(child);
        let curr = self.cfs(cfs).curr;
        if let Some(c) = curr {
            self.update_curr(ctx, cfs);
            let v = self.se(c).vruntime;
            self.se_mut(child).vruntime = v;
        }
        self.place_entity(ctx, cfs, child, true);

        if let Some(c) = curr {
            if ctx.tun.child_runs_first && before(self.se(c).vruntime, self.se(child).vruntime) {
                // Parent gives its place to the child
                let cv = self.se(c).vruntime;
                let pv = self.se(child).vruntime;
                self.se_mut(c).vruntime = pv;
                self.se_mut(child).vruntime = cv;
                self.resched_curr(ctx);
            }
        }

        let min = self.cfs(cfs).min_vruntime;
        let e = self.se_mut(child);
        e.vruntime = e.vruntime.wrapping_sub(min);
    }

    /// Wall-clock slice the task would currently be given
    pub fn get_rr_interval(&self, ctx: &Ctx<'_>, id: ThreadId) -> u64 {
        let Some(se) = self.task_se(id) else {
            return 0;
        };
        if self.root().load.weight == 0 {
            return 0;
        }
        self.sched_slice(ctx, self.cfs_of(se), se)
    }

    /// React to a priority change of a queued task
    pub fn prio_changed(&mut self, ctx: &Ctx<'_>, id: ThreadId, lowered: bool) {
        let Some(se) = self.task_se(id) else {
            return;
        };
        if !self.se(se).on_rq {
            return;
        }
        if self.curr == Some(id) {
            if lowered {
                self.resched_curr(ctx);
            }
        } else {
            self.check_preempt_wakeup(ctx, id, WakeFlags::empty());
        }
    }

    /// Whether vruntime of a task's entity is currently relative
    pub fn vruntime_normalized(&self, id: ThreadId) -> bool {
        let Some(rt) = self.tasks.get(&id) else {
            return true;
        };
        let se = self.se(rt.se);
        if se.on_rq {
            return true;
        }
        matches!(rt.task.state(), TaskState::New | TaskState::Waking | TaskState::Migrating | TaskState::Foreign)
            || se.sum_exec_runtime == 0
    }

    /// Re-base the vruntime of a task leaving its queue for good, or
    /// switching class, and take its load sample off the queue
    ///
    /// `normalized` says whether vruntime is already relative, which the
    /// caller must work out before dequeueing.
    pub fn detach_task_cfs_rq(&mut self, ctx: &Ctx<'_>, id: ThreadId, normalized: bool) {
        let Some(se) = self.task_se(id) else {
            return;
        };
        let cfs = self.cfs_of(se);
        let now = self.cfs_clock_task(cfs);
        self.update_cfs_rq_load_avg(now, cfs);
        if !normalized {
            // No sleep credit beyond what placement would give
            self.place_entity(ctx, cfs, se, false);
            let min = self.cfs(cfs).min_vruntime;
            let e = self.se_mut(se);
            e.vruntime = e.vruntime.wrapping_sub(min);
        }
        self.detach_entity_load_avg(cfs, se);
        self.update_tg_load_avg(cfs, false);
    }

    /// Counterpart of [`Rq::detach_task_cfs_rq`] on the queue the task
    /// now points at
    pub fn attach_task_cfs_rq(&mut self, ctx: &Ctx<'_>, id: ThreadId, normalized: bool) {
        let Some(se) = self.task_se(id) else {
            return;
        };
        let cfs = self.cfs_of(se);
        let depth = self.parent_of(se).map_or(0, |p| self.se(p).depth + 1);
        self.se_mut(se).depth = depth;
        let now = self.cfs_clock_task(cfs);
        self.update_cfs_rq_load_avg(now, cfs);
        self.attach_entity_load_avg(ctx, cfs, se);
        self.update_tg_load_avg(cfs, false);
        if !normalized {
            let min = self.cfs(cfs).min_vruntime;
            let e = self.se_mut(se);
            e.vruntime = e.vruntime.wrapping_add(min);
        }
    }

    // =========================================================================
    // Migration
    // =========================================================================

    /// Take a queued task that is not running off this CPU
    ///
    /// The task is left `Migrating` with a relative vruntime, and its
    /// load sample waits in the queue's removal accumulator. Returns the
    /// detached task with the group it belongs to.
    pub fn detach_task(&mut self, ctx: &Ctx<'_>, id: ThreadId) -> Option<(MovingTask, Arc<TaskGroup>)> {
        let se = self.task_se(id)?;
        if self.curr == Some(id) || !self.se(se).on_rq {
            return None;
        }
        let tg = self.cfs(self.cfs_of(se)).tg.clone();
        if let Some(task) = self.task_ref(id) {
            task.set_state(TaskState::Migrating);
        }
        self.dequeue_task(ctx, id, DequeueFlags::empty());
        self.remove_entity_load_avg(se);
        let mut moving = self.take_task(id)?;
        moving.entity.avg.last_update_time = 0;
        moving.entity.exec_start = 0;
        moving.entity.nr_migrations += 1;
        log::trace!("[cfs] cpu{}: detach {}", self.cpu, id);
        Some((moving, tg))
    }

    /// Queue a task detached from another CPU
    pub fn attach_task(&mut self, ctx: &Ctx<'_>, moving: MovingTask, tg: &Arc<TaskGroup>) -> EntityId {
        let task = moving.task.clone();
        let se = self.put_task(moving, tg);
        self.enqueue_task(ctx, task.id, EnqueueFlags::empty());
        task.set_state(TaskState::Runnable);
        self.nr_migrations_in += 1;
        self.check_preempt_wakeup(ctx, task.id, WakeFlags::empty());
        log::trace!("[cfs] cpu{}: attach {}", self.cpu, task.id);
        se
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CfsConfig;
    use crate::entity::ROOT_GROUP;
    use crate::test_support::{Bench, MS};

    /// Requeue a task at `rel` past `min_vruntime`
    fn requeue_at(b: &mut Bench, id: ThreadId, rel: u64) {
        let (rq, ctx) = b.split();
        rq.dequeue_task(&ctx, id, DequeueFlags::empty());
        let se = rq.task_se(id).unwrap();
        rq.se_mut(se).vruntime = rel;
        rq.enqueue_task(&ctx, id, EnqueueFlags::empty());
    }

    #[test]
    fn test_min_vruntime_never_decreases() {
        let mut b = Bench::new();
        let a = b.spawn(1, 0);
        let _ = b.spawn(2, 0);
        let mut last = b.rq.root().min_vruntime;
        for _ in 0..50 {
            b.run(MS);
            let now = b.rq.root().min_vruntime;
            assert!(!before(now, last), "min_vruntime went back from {} to {}", last, now);
            last = now;
        }
        let (rq, ctx) = b.split();
        rq.dequeue_task(&ctx, a, DequeueFlags::SLEEP);
        assert!(!before(rq.root().min_vruntime, last));
    }

    #[test]
    fn test_new_task_starts_behind_min_vruntime() {
        let mut b = Bench::new();
        let a = b.spawn(1, 0);
        b.run(10 * MS);
        let min = b.rq.root().min_vruntime;
        let c = b.spawn(2, 0);
        let se = b.rq.task_se(c).unwrap();
        // Start debit: one virtual slice after min_vruntime
        assert!(before(min, b.rq.se(se).vruntime));
        assert!(b.rq.task_se(a).is_some());
    }

    #[test]
    fn test_sched_slice_splits_period_by_weight() {
        let mut b = Bench::new();
        let heavy = b.spawn(1, 0);
        let light = b.spawn(2, 5);
        let (rq, ctx) = b.split();
        let hs = rq.get_rr_interval(&ctx, heavy);
        let ls = rq.get_rr_interval(&ctx, light);
        let period = sched_period(2, ctx.tun);
        assert!(hs + ls <= period + 2);
        // 1024 against 335
        assert!(hs > 2 * ls, "slices {} and {}", hs, ls);
    }

    #[test]
    fn test_equal_tasks_share_one_cpu() {
        let mut b = Bench::new();
        let ids: Vec<ThreadId> = (1..=3).map(|i| b.spawn(i, 0)).collect();
        b.run(300 * MS);
        for id in ids {
            let se = b.rq.task_se(id).unwrap();
            let ran = b.rq.se(se).sum_exec_runtime;
            assert!((80 * MS..=120 * MS).contains(&ran), "{} ran {}ns", id, ran);
        }
    }

    #[test]
    fn test_sleeper_credit_is_bounded() {
        let mut b = Bench::new();
        let sleeper = b.spawn(1, 0);
        let _ = b.spawn(2, 0);
        b.run(5 * MS);
        {
            let (rq, ctx) = b.split();
            if rq.curr == Some(sleeper) {
                rq.put_prev_task(&ctx);
            }
            rq.dequeue_task(&ctx, sleeper, DequeueFlags::SLEEP);
        }
        b.run(200 * MS);
        let (rq, ctx) = b.split();
        rq.update_clock(&ctx);
        rq.enqueue_task(&ctx, sleeper, EnqueueFlags::WAKEUP);
        let se = rq.task_se(sleeper).unwrap();
        let min = rq.root().min_vruntime;
        let credit = vdiff(min, rq.se(se).vruntime);
        assert!(credit <= (ctx.tun.latency_ns / 2) as i64, "credit {}", credit);
        assert!(credit >= 0);
    }

    #[test]
    fn test_wakeup_preempt_entity_thresholds() {
        let mut b = Bench::new();
        let a = b.spawn(1, 0);
        let c = b.spawn(2, 0);
        let (rq, ctx) = b.split();
        let (sa, sc) = (rq.task_se(a).unwrap(), rq.task_se(c).unwrap());
        let gran = ctx.tun.wakeup_granularity_ns;
        rq.se_mut(sa).vruntime = 10 * gran;
        rq.se_mut(sc).vruntime = 10 * gran;
        assert_eq!(rq.wakeup_preempt_entity(&ctx, sa, sc), -1);
        rq.se_mut(sa).vruntime = 10 * gran + gran / 2;
        assert_eq!(rq.wakeup_preempt_entity(&ctx, sa, sc), 0);
        rq.se_mut(sa).vruntime = 12 * gran;
        assert_eq!(rq.wakeup_preempt_entity(&ctx, sa, sc), 1);
    }

    #[test]
    fn test_skip_buddy_passes_turn() {
        let mut b = Bench::new();
        let a = b.spawn(1, 0);
        let c = b.spawn(2, 0);
        let gran = b.tun.wakeup_granularity_ns;
        requeue_at(&mut b, a, 0);
        requeue_at(&mut b, c, gran / 2);
        let (rq, ctx) = b.split();
        assert_eq!(rq.pick_next_task(&ctx), Some(a));
        rq.yield_task(&ctx);
        assert_eq!(rq.pick_next_task(&ctx), Some(c));
    }

    #[test]
    fn test_skip_buddy_ignored_when_unfair() {
        let mut b = Bench::new();
        let a = b.spawn(1, 0);
        let c = b.spawn(2, 0);
        let gran = b.tun.wakeup_granularity_ns;
        requeue_at(&mut b, a, 0);
        requeue_at(&mut b, c, 3 * gran);
        let (rq, ctx) = b.split();
        assert_eq!(rq.pick_next_task(&ctx), Some(a));
        rq.yield_task(&ctx);
        assert_eq!(rq.pick_next_task(&ctx), Some(a));
    }

    #[test]
    fn test_child_runs_first_swaps_with_parent() {
        let config = CfsConfig::with_cpus(1).with_child_runs_first(true);
        let mut b = Bench::with_config(config);
        let parent = b.spawn(1, 0);
        {
            let (rq, ctx) = b.split();
            rq.pick_next_task(&ctx);
            rq.need_resched = false;
        }
        b.advance(MS);
        let child = b.spawn(2, 0);
        assert!(b.rq.need_resched);
        let (rq, ctx) = b.split();
        assert_eq!(rq.pick_next_task(&ctx), Some(child));
        assert!(rq.task_se(parent).is_some());
    }

    #[test]
    fn test_detached_task_is_never_picked() {
        let mut b = Bench::new();
        let a = b.spawn(1, 0);
        let c = b.spawn(2, 0);
        let (rq, ctx) = b.split();
        let (moving, tg) = rq.detach_task(&ctx, c).unwrap();
        assert_eq!(moving.task.state(), TaskState::Migrating);
        assert_eq!(moving.entity.nr_migrations, 1);
        assert_eq!(moving.entity.avg.last_update_time, 0);
        assert_eq!(rq.nr_running, 1);
        for _ in 0..4 {
            assert_eq!(rq.pick_next_task(&ctx), Some(a));
        }
        // Running tasks stay put
        assert!(rq.detach_task(&ctx, a).is_none());

        rq.put_prev_task(&ctx);
        let se = rq.attach_task(&ctx, moving, &tg);
        assert!(rq.se(se).on_rq);
        assert_eq!(rq.nr_running, 2);
        assert_eq!(rq.nr_migrations_in, 1);
    }

    #[test]
    fn test_detach_normalizes_against_queue() {
        let mut b = Bench::new();
        let _ = b.spawn(1, 0);
        let c = b.spawn(2, 0);
        b.run(20 * MS);
        let (rq, ctx) = b.split();
        rq.put_prev_task(&ctx);
        let se = rq.task_se(c).unwrap();
        let rel = vdiff(rq.se(se).vruntime, rq.root().min_vruntime);
        let (moving, _) = rq.detach_task(&ctx, c).unwrap();
        assert_eq!(moving.entity.vruntime as i64, rel);
    }

    #[test]
    fn test_group_queue_carries_hierarchy() {
        let mut b = Bench::new();
        let g = b.table.create(ROOT_GROUP).unwrap();
        let t = b.spawn_in(1, 0, g.id);
        let slot = b.rq.groups.get(&g.id).cloned().unwrap();
        let gse = slot.se.unwrap();
        assert!(b.rq.se(gse).on_rq);
        assert_eq!(b.rq.cfs(slot.cfs_rq).h_nr_running, 1);
        assert_eq!(b.rq.root().h_nr_running, 1);
        let (rq, ctx) = b.split();
        assert_eq!(rq.pick_next_task(&ctx), Some(t));
        rq.dequeue_task(&ctx, t, DequeueFlags::SLEEP);
        assert!(!rq.se(gse).on_rq);
        assert_eq!(rq.root().h_nr_running, 0);
    }
}
