//! # Fair Scheduler
//!
//! [`CfsScheduler`] owns one locked run queue per CPU, the group table
//! and the index of known tasks. It implements the framework
//! [`Scheduler`] trait on top of the per-queue operations.
//!
//! A task's entity lives in exactly one run queue at a time. Operations
//! on a task lock the run queue that currently owns it and never hold two
//! run queue locks at once: a move detaches under the source lock, marks
//! the task in transit and attaches under the destination lock.

use crate::balance::NohzState;
use crate::bandwidth::{timer_key, TimerKind};
use crate::cfs_rq::CfsRqSnapshot;
use crate::config::{CfsConfig, Tunable, Tunables, TunablesCell};
use crate::entity::{EntityId, EntityStats, GroupId, ROOT_GROUP};
use crate::error::{CfsError, CfsResult};
use crate::group::{GroupTable, TaskGroup};
use crate::placement::{AffineAttempt, Placement, PlacementEnv, PlacementPolicy, WakeContext, WakerInfo};
use crate::rq::{Ctx, DomainState, DomainStats, MovingTask, Rq, RqShared};
use crate::task::{DequeueFlags, EnqueueFlags, TaskPolicy, TaskRef, TaskState, WakeFlags};
use crate::topology::{CpuMask, SdFlags, Topology, TopologySpec};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use hashbrown::HashMap;
use helix_execution::scheduler::{HostServices, Priority, SchedulableThread, Scheduler, SchedulerStats, SchedulingPolicy};
use helix_execution::{ExecError, ExecResult, ThreadId};
use spin::{Mutex, MutexGuard, RwLock};

// =============================================================================
// Locked run queue
// =============================================================================

/// A locked run queue
///
/// Publishes the lock-free view of the queue and raises the overload
/// hint before the lock is released.
pub(crate) struct RqGuard<'a> {
    rq: MutexGuard<'a, Rq>,
    overload: &'a AtomicBool,
}

impl Deref for RqGuard<'_> {
    type Target = Rq;

    fn deref(&self) -> &Rq {
        &self.rq
    }
}

impl DerefMut for RqGuard<'_> {
    fn deref_mut(&mut self) -> &mut Rq {
        &mut self.rq
    }
}

impl Drop for RqGuard<'_> {
    fn drop(&mut self) {
        if self.rq.nr_running >= 2 {
            self.overload.store(true, Ordering::Relaxed);
        }
        self.rq.publish();
    }
}

/// Entity of a task on its way between run queues
enum Transit {
    /// Was queued; attach and enqueue on arrival
    Queued(MovingTask, Arc<TaskGroup>),
    /// Blocked or handed to another class; park on arrival
    Parked { moving: MovingTask, tg: Arc<TaskGroup>, state: TaskState },
}

// =============================================================================
// Task information
// =============================================================================

/// Snapshot of one task
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Task id
    pub id: ThreadId,
    /// Name
    pub name: String,
    /// CPU owning the entity
    pub cpu: usize,
    /// State
    pub state: TaskState,
    /// Fair-class policy
    pub policy: TaskPolicy,
    /// Static priority
    pub priority: Priority,
    /// Group
    pub group: GroupId,
    /// Entity weight
    pub weight: u64,
    /// Virtual runtime, absolute while queued or sleeping
    pub vruntime: u64,
    /// Total CPU time received
    pub sum_exec_runtime: u64,
    /// CPU changes
    pub nr_migrations: u64,
    /// Decayed load
    pub load_avg: u64,
    /// Decayed utilization
    pub util_avg: u64,
    /// Scheduling statistics
    pub stats: EntityStats,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Weighted fair-share scheduler
pub struct CfsScheduler {
    config: RwLock<CfsConfig>,
    pub(crate) tunables: TunablesCell,
    pub(crate) host: HostServices,
    pub(crate) topology: Topology,
    rqs: Vec<Mutex<Rq>>,
    pub(crate) shared: Vec<Arc<RqShared>>,
    pub(crate) groups: GroupTable,
    tasks: RwLock<HashMap<ThreadId, Arc<TaskRef>>>,
    placement: Box<dyn PlacementPolicy>,
    pub(crate) nohz: NohzState,
    /// Some CPU had more than one runnable task since the last balance
    pub(crate) overload: AtomicBool,
    /// Serializes balancing of domains flagged `SERIALIZE`
    pub(crate) balancing: Mutex<()>,
}

impl core::fmt::Debug for CfsScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CfsScheduler")
            .field("cpus", &self.rqs.len())
            .field("groups", &self.groups.len())
            .field("tasks", &self.tasks.read().len())
            .field("placement", &self.placement.name())
            .finish()
    }
}

impl CfsScheduler {
    /// Build a scheduler for `config.cpu_count` CPUs, all online
    pub fn new(config: CfsConfig, host: HostServices) -> CfsResult<Self> {
        config.validate()?;
        let nr_cpus = config.cpu_count;
        let topology = Topology::build(&config.topology, nr_cpus, &config.capacities)?;
        let tun = Tunables::derive(&config, nr_cpus);
        let groups = GroupTable::new(nr_cpus);
        let root = groups.root();

        let rqs: Vec<Rq> = (0..nr_cpus).map(|cpu| Rq::new(cpu, root.clone(), &topology, &tun)).collect();
        for rq in &rqs {
            rq.publish();
        }
        let shared = rqs.iter().map(|rq| rq.shared.clone()).collect();
        let placement = config.placement.build();

        log::info!(
            "[cfs] scheduler: {} cpus, {} domain levels, {} placement, latency {}ns",
            nr_cpus,
            topology.domains(0).len(),
            placement.name(),
            tun.latency_ns
        );

        Ok(Self {
            config: RwLock::new(config),
            tunables: TunablesCell::new(tun),
            host,
            topology,
            rqs: rqs.into_iter().map(Mutex::new).collect(),
            shared,
            groups,
            tasks: RwLock::new(HashMap::new()),
            placement,
            nohz: NohzState::new(nr_cpus),
            overload: AtomicBool::new(false),
            balancing: Mutex::new(()),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of CPUs, online or not
    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.rqs.len()
    }

    /// Current tunables snapshot
    pub fn tunables(&self) -> Arc<Tunables> {
        self.tunables.load()
    }

    /// Configuration the tunables derive from
    pub fn config(&self) -> CfsConfig {
        self.config.read().clone()
    }

    /// Domain hierarchy
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Name of the placement strategy in use
    pub fn placement_name(&self) -> &'static str {
        self.placement.name()
    }

    /// CPUs currently online
    pub fn online_mask(&self) -> CpuMask {
        self.shared
            .iter()
            .filter(|s| s.is_online())
            .fold(CpuMask::from_bits(0), |mask, s| mask.with(s.cpu))
    }

    /// Runnable tasks on `cpu`, the running one included
    pub fn nr_running(&self, cpu: usize) -> u32 {
        self.shared.get(cpu).map_or(0, |s| s.nr_running())
    }

    /// Ids of every known task
    pub fn task_ids(&self) -> Vec<ThreadId> {
        let mut ids: Vec<ThreadId> = self.tasks.read().keys().copied().collect();
        ids.sort_by_key(|id| id.as_u64());
        ids
    }

    pub(crate) fn ctx<'a>(&'a self, tun: &'a Tunables) -> Ctx<'a> {
        Ctx { tun, host: &self.host, topo: &self.topology }
    }

    pub(crate) fn now(&self) -> u64 {
        self.host.clock.now(0)
    }

    /// Lock the run queue of `cpu`
    pub(crate) fn rq(&self, cpu: usize) -> RqGuard<'_> {
        RqGuard { rq: self.rqs[cpu].lock(), overload: &self.overload }
    }

    pub(crate) fn placement_env<'a>(&'a self, tun: &'a Tunables) -> PlacementEnv<'a> {
        PlacementEnv { tun, topo: &self.topology, rqs: &self.shared }
    }

    fn task(&self, id: ThreadId) -> CfsResult<Arc<TaskRef>> {
        self.tasks.read().get(&id).cloned().ok_or(CfsError::TaskNotFound)
    }

    fn check_cpu(&self, cpu: usize) -> CfsResult<()> {
        if cpu < self.nr_cpus() {
            Ok(())
        } else {
            Err(CfsError::InvalidCpu)
        }
    }

    /// Lock the run queue owning `task`, waiting out a move in progress
    fn task_rq_lock(&self, task: &TaskRef) -> RqGuard<'_> {
        loop {
            let cpu = task.cpu();
            let rq = self.rq(cpu);
            if task.cpu() == cpu && task.state() != TaskState::Migrating {
                return rq;
            }
            drop(rq);
            core::hint::spin_loop();
        }
    }

    /// Group, load and utilization of a task's entity
    fn entity_sample(&self, task: &TaskRef) -> Option<(Arc<TaskGroup>, u64, u64)> {
        let rq = self.task_rq_lock(task);
        let se = rq.task_se(task.id)?;
        let e = rq.se(se);
        Some((rq.cfs(e.cfs_rq).tg.clone(), e.avg.load_avg, e.avg.util_avg))
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Run the placement strategy, keeping the result inside the task's
    /// allowed online CPUs
    fn select_task_rq(&self, penv: &PlacementEnv<'_>, wc: &WakeContext) -> Placement {
        let mut placement = self.placement.select_task_rq(penv, wc);
        let allowed = penv.allowed(&wc.task);
        if !allowed.contains(placement.cpu) {
            let fallback = if allowed.contains(wc.prev_cpu) { Some(wc.prev_cpu) } else { allowed.first_cpu() };
            let cpu = fallback.or_else(|| penv.online_mask().first_cpu()).unwrap_or(wc.prev_cpu);
            log::warn!(
                "[cfs] {} placement put {} on cpu{} outside its mask, using cpu{}",
                self.placement.name(),
                wc.task.id,
                placement.cpu,
                cpu
            );
            placement.cpu = cpu;
        }
        placement
    }

    /// CPU an exec'ing task should move to
    pub fn suggest_cpu(&self, id: ThreadId, current_cpu: usize) -> Option<usize> {
        if current_cpu >= self.nr_cpus() {
            return None;
        }
        let task = self.task(id).ok()?;
        let (group, load_avg, util_avg) = self.entity_sample(&task)?;
        let tun = self.tunables.load();
        let penv = self.placement_env(&tun);
        let wakee_flips = task.wakee.lock().wakee_flips;
        let wc = WakeContext {
            task,
            group,
            prev_cpu: current_cpu,
            this_cpu: current_cpu,
            sd_flag: SdFlags::BALANCE_EXEC,
            wake_flags: WakeFlags::empty(),
            load_avg,
            util_avg,
            wakee_flips,
            waker: None,
        };
        Some(self.select_task_rq(&penv, &wc).cpu)
    }

    // =========================================================================
    // Task lifecycle
    // =========================================================================

    /// Fork a task and make it runnable
    ///
    /// The child is forked on its parent's CPU (inheriting the parent's
    /// vruntime), then placed with fork balancing. Without an explicit
    /// `group` it joins its parent's group, or the root group.
    pub fn wake_up_new_task(&self, thread: &SchedulableThread, group: Option<GroupId>) -> CfsResult<()> {
        let policy = TaskPolicy::from_policy(thread.policy).ok_or(CfsError::UnsupportedPolicy)?;
        if thread.priority.is_realtime() {
            return Err(CfsError::UnsupportedPolicy);
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let penv = self.placement_env(&tun);

        let mask = CpuMask::from_bits(thread.affinity).and(CpuMask::first(self.nr_cpus()));
        let parent = thread.parent.and_then(|p| self.tasks.read().get(&p).cloned());
        let group = group.or_else(|| parent.as_ref().map(|p| p.group())).unwrap_or(ROOT_GROUP);
        let tg = self.groups.get(group)?;
        if tg.dying.load(Ordering::Acquire) {
            return Err(CfsError::GroupNotFound);
        }
        let fork_cpu = parent
            .as_ref()
            .map(|p| p.cpu())
            .filter(|&cpu| penv.rq(cpu).is_online())
            .or_else(|| mask.and(penv.online_mask()).first_cpu())
            .ok_or(CfsError::AffinityEmpty)?;
        if mask.and(penv.online_mask()).is_empty() {
            return Err(CfsError::AffinityEmpty);
        }

        let task = Arc::new(TaskRef::new(thread.id, thread.name.clone(), policy, thread.priority, mask, group, fork_cpu));
        {
            let mut tasks = self.tasks.write();
            if tasks.contains_key(&thread.id) {
                return Err(CfsError::TaskExists);
            }
            tasks.insert(thread.id, task.clone());
        }
        tg.nr_tasks.fetch_add(1, Ordering::AcqRel);

        let (moving, load_avg, util_avg) = {
            let mut rq = self.rq(fork_cpu);
            rq.update_clock(&ctx);
            let se = rq.insert_task(task.clone(), &tg);
            rq.task_fork(&ctx, se);
            let sample = (rq.se(se).avg.load_avg, rq.se(se).avg.util_avg);
            // No queue holds the entity until `put_task`
            task.set_state(TaskState::Migrating);
            let moving = rq.take_task(thread.id).ok_or(CfsError::TaskNotFound)?;
            (moving, sample.0, sample.1)
        };

        let wc = WakeContext {
            task: task.clone(),
            group: tg.clone(),
            prev_cpu: fork_cpu,
            this_cpu: fork_cpu,
            sd_flag: SdFlags::BALANCE_FORK,
            wake_flags: WakeFlags::FORK,
            load_avg,
            util_avg,
            wakee_flips: 0,
            waker: None,
        };
        let cpu = self.select_task_rq(&penv, &wc).cpu;

        let mut rq = self.rq(cpu);
        rq.update_clock(&ctx);
        rq.put_task(moving, &tg);
        task.set_state(TaskState::Runnable);
        rq.enqueue_task(&ctx, thread.id, EnqueueFlags::empty());
        rq.check_preempt_wakeup(&ctx, thread.id, WakeFlags::FORK);
        log::debug!("[cfs] new task {} '{}' in group {} on cpu{}", thread.id, thread.name, group, cpu);
        Ok(())
    }

    /// Wake a blocked task
    ///
    /// `waker` is the task doing the wakeup, if any; `sync` says it is
    /// about to block. Waking a task that is already runnable does
    /// nothing.
    pub fn try_to_wake_up(&self, id: ThreadId, waker: Option<ThreadId>, sync: bool) -> CfsResult<()> {
        let task = self.task(id)?;
        loop {
            if task.transition(TaskState::Sleeping, TaskState::Waking) {
                break;
            }
            match task.state() {
                TaskState::Migrating => core::hint::spin_loop(),
                TaskState::Runnable | TaskState::Waking => return Ok(()),
                TaskState::Dead => return Err(CfsError::TaskNotFound),
                TaskState::New | TaskState::Foreign => return Err(CfsError::InvalidState),
                TaskState::Sleeping => {}
            }
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let penv = self.placement_env(&tun);

        let (prev_cpu, group, load_avg, util_avg) = {
            let mut rq = self.task_rq_lock(&task);
            rq.update_clock(&ctx);
            let Some(se) = rq.task_se(id) else {
                // Exited meanwhile
                task.transition(TaskState::Waking, TaskState::Sleeping);
                return Err(CfsError::TaskNotFound);
            };
            // Blocked but never switched out
            if rq.curr == Some(id) {
                if !rq.se(se).on_rq {
                    rq.enqueue_task(&ctx, id, EnqueueFlags::WAKEUP);
                }
                task.set_state(TaskState::Runnable);
                let stats = &mut rq.se_mut(se).stats;
                stats.nr_wakeups += 1;
                stats.nr_wakeups_local += 1;
                return Ok(());
            }
            let cpu = rq.cpu;
            let cfs = rq.cfs_of(se);
            let min = rq.cfs(cfs).min_vruntime;
            let tg = rq.cfs(cfs).tg.clone();
            let e = rq.se_mut(se);
            e.vruntime = e.vruntime.wrapping_sub(min);
            (cpu, tg, e.avg.load_avg, e.avg.util_avg)
        };

        let waker = waker.filter(|&w| w != id).and_then(|w| self.task(w).ok());
        let this_cpu = waker.as_ref().map_or(prev_cpu, |w| w.cpu());
        let waker_info = waker.as_ref().and_then(|w| {
            w.wakee.lock().record(id, tun.ticks(self.now()), tun.hz);
            let (group, load_avg, _) = self.entity_sample(w)?;
            Some(WakerInfo { group, load_avg, wakee_flips: w.wakee.lock().wakee_flips })
        });

        let mut wake_flags = if sync { WakeFlags::SYNC } else { WakeFlags::empty() };
        let wakee_flips = task.wakee.lock().wakee_flips;
        let wc = WakeContext {
            task: task.clone(),
            group: group.clone(),
            prev_cpu,
            this_cpu,
            sd_flag: SdFlags::BALANCE_WAKE,
            wake_flags,
            load_avg,
            util_avg,
            wakee_flips,
            waker: waker_info,
        };
        let placement = self.select_task_rq(&penv, &wc);
        let cpu = placement.cpu;

        let moving = if cpu != prev_cpu {
            let mut rq = self.rq(prev_cpu);
            let Some(se) = rq.task_se(id) else {
                // Exited meanwhile
                task.transition(TaskState::Waking, TaskState::Sleeping);
                return Err(CfsError::TaskNotFound);
            };
            rq.remove_entity_load_avg(se);
            task.set_state(TaskState::Migrating);
            let mut moving = rq.take_task(id).ok_or(CfsError::TaskNotFound)?;
            moving.entity.avg.last_update_time = 0;
            moving.entity.exec_start = 0;
            moving.entity.nr_migrations += 1;
            wake_flags |= WakeFlags::MIGRATED;
            Some(moving)
        } else {
            None
        };

        {
            let mut rq = self.rq(cpu);
            rq.update_clock(&ctx);
            rq.account_idle_wakeup();
            let se = match moving {
                Some(moving) => rq.put_task(moving, &group),
                None => rq.task_se(id).ok_or(CfsError::TaskNotFound)?,
            };
            rq.enqueue_task(&ctx, id, EnqueueFlags::WAKEUP | EnqueueFlags::WAKING);
            task.set_state(TaskState::Runnable);

            let stats = &mut rq.se_mut(se).stats;
            stats.nr_wakeups += 1;
            if sync {
                stats.nr_wakeups_sync += 1;
            }
            if cpu != prev_cpu {
                stats.nr_wakeups_migrate += 1;
            }
            if cpu == this_cpu {
                stats.nr_wakeups_local += 1;
            } else {
                stats.nr_wakeups_remote += 1;
            }
            if let Some(affine) = placement.affine {
                stats.nr_wakeups_affine_attempts += 1;
                if affine.pulled {
                    stats.nr_wakeups_affine += 1;
                }
            }
            rq.check_preempt_wakeup(&ctx, id, wake_flags);
        }

        if waker.is_some() {
            self.account_ttwu_domains(this_cpu, cpu, placement.affine);
        }
        log::debug!("[cfs] wake {} cpu{} -> cpu{}", id, prev_cpu, cpu);
        Ok(())
    }

    fn account_ttwu_domains(&self, this_cpu: usize, cpu: usize, affine: Option<AffineAttempt>) {
        let pulled = affine.filter(|a| a.pulled);
        if cpu == this_cpu && pulled.is_none() {
            return;
        }
        let mut rq = self.rq(this_cpu);
        if cpu != this_cpu {
            let level = self.topology.domains(this_cpu).iter().find(|sd| sd.span.contains(cpu)).map(|sd| sd.level);
            if let Some(state) = level.and_then(|l| rq.domains.get_mut(l)) {
                state.stats.ttwu_wake_remote += 1;
            }
        }
        if let Some(state) = pulled.and_then(|a| rq.domains.get_mut(a.level)) {
            state.stats.ttwu_move_affine += 1;
        }
    }

    /// Block a runnable task
    pub fn block_task(&self, id: ThreadId) -> CfsResult<()> {
        let task = self.task(id)?;
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let mut rq = self.task_rq_lock(&task);
        if task.state() != TaskState::Runnable {
            return Err(CfsError::InvalidState);
        }
        rq.update_clock(&ctx);
        let se = rq.task_se(id).ok_or(CfsError::TaskNotFound)?;
        if rq.se(se).on_rq {
            rq.dequeue_task(&ctx, id, DequeueFlags::SLEEP);
        }
        task.set_state(TaskState::Sleeping);
        if rq.curr == Some(id) {
            rq.resched_curr(&ctx);
        }
        log::debug!("[cfs] cpu{}: {} blocks", rq.cpu, id);
        Ok(())
    }

    /// Forget an exited task
    ///
    /// Its load sample leaves the queue through the removed-load
    /// accumulator.
    pub fn task_dead(&self, id: ThreadId) -> CfsResult<()> {
        let task = self.task(id)?;
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        {
            let mut rq = self.task_rq_lock(&task);
            rq.update_clock(&ctx);
            if let Some(se) = rq.task_se(id) {
                if rq.se(se).on_rq {
                    rq.dequeue_task(&ctx, id, DequeueFlags::SLEEP);
                }
                if rq.curr == Some(id) {
                    rq.put_prev_task(&ctx);
                    rq.resched_curr(&ctx);
                }
                rq.remove_entity_load_avg(se);
                rq.remove_task(id);
            }
        }
        task.set_state(TaskState::Dead);
        self.tasks.write().remove(&id);
        if let Ok(tg) = self.groups.get(task.group()) {
            tg.nr_tasks.fetch_sub(1, Ordering::AcqRel);
        }
        log::debug!("[cfs] task {} exits", id);
        Ok(())
    }

    /// The running task of `cpu` gives way
    pub fn yield_current(&self, cpu: usize) {
        if cpu >= self.nr_cpus() {
            return;
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let mut rq = self.rq(cpu);
        rq.update_clock(&ctx);
        rq.yield_task(&ctx);
        if rq.curr.is_some() {
            rq.resched_curr(&ctx);
        }
    }

    /// The running task of `cpu` gives way to `target`
    ///
    /// Returns false when `target` is not queued anywhere.
    pub fn yield_to(&self, cpu: usize, target: ThreadId) -> CfsResult<bool> {
        self.check_cpu(cpu)?;
        let task = self.task(target)?;
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);

        let mut rq = self.task_rq_lock(&task);
        if rq.cpu == cpu {
            rq.update_clock(&ctx);
            let yielded = rq.yield_to_task(&ctx, target);
            if yielded {
                rq.resched_curr(&ctx);
            }
            return Ok(yielded);
        }
        let Some(se) = rq.task_se(target).filter(|&se| rq.se(se).on_rq) else {
            return Ok(false);
        };
        rq.set_next_buddy(se);
        rq.resched_curr(&ctx);
        drop(rq);

        self.yield_current(cpu);
        Ok(true)
    }

    /// Wall-clock slice a task would get right now
    pub fn get_rr_interval(&self, id: ThreadId) -> CfsResult<u64> {
        let task = self.task(id)?;
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let rq = self.task_rq_lock(&task);
        Ok(rq.get_rr_interval(&ctx, id))
    }

    /// Take a task off its queues, apply `change`, and put it back the
    /// way it was; returns the still locked run queue
    fn requeue<'a>(
        &'a self,
        ctx: &Ctx<'_>,
        task: &TaskRef,
        change: impl FnOnce(&mut Rq, EntityId),
    ) -> CfsResult<RqGuard<'a>> {
        let mut rq = self.task_rq_lock(task);
        rq.update_clock(ctx);
        let se = rq.task_se(task.id).ok_or(CfsError::TaskNotFound)?;
        let queued = rq.se(se).on_rq;
        let running = rq.curr == Some(task.id);
        if queued {
            rq.dequeue_task(ctx, task.id, DequeueFlags::empty());
        }
        if running {
            rq.put_prev_task(ctx);
        }
        change(&mut *rq, se);
        if queued {
            rq.enqueue_task(ctx, task.id, EnqueueFlags::empty());
        }
        if running {
            rq.set_curr_task(ctx, task.id);
        }
        Ok(rq)
    }

    /// Change the nice level of a task
    pub fn set_task_priority(&self, id: ThreadId, priority: Priority) -> CfsResult<()> {
        if priority.is_realtime() {
            return Err(CfsError::UnsupportedPolicy);
        }
        let task = self.task(id)?;
        let old = task.priority();
        if old == priority {
            return Ok(());
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let mut rq = self.requeue(&ctx, &task, |rq, se| {
            task.set_priority(priority);
            rq.se_mut(se).load.set(task.weight());
        })?;
        rq.prio_changed(&ctx, id, priority.static_priority() > old.static_priority());
        log::debug!("[cfs] {} nice {} -> {}", id, old.nice(), priority.nice());
        Ok(())
    }

    /// Switch a task between the fair policies
    pub fn set_task_policy(&self, id: ThreadId, policy: SchedulingPolicy) -> CfsResult<()> {
        let policy = TaskPolicy::from_policy(policy).ok_or(CfsError::UnsupportedPolicy)?;
        let task = self.task(id)?;
        if task.policy() == policy {
            return Ok(());
        }
        let old_weight = task.weight();
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let mut rq = self.requeue(&ctx, &task, |rq, se| {
            task.set_policy(policy);
            rq.se_mut(se).load.set(task.weight());
        })?;
        rq.prio_changed(&ctx, id, task.weight() < old_weight);
        log::debug!("[cfs] {} policy {:?}", id, policy);
        Ok(())
    }

    /// Move a task to another group
    ///
    /// Its vruntime is carried over relative to the new queue, and its
    /// load sample is detached from the old queue and attached to the new
    /// one.
    pub fn move_task_group(&self, id: ThreadId, group: GroupId) -> CfsResult<()> {
        let task = self.task(id)?;
        let new_tg = self.groups.get(group)?;
        if new_tg.dying.load(Ordering::Acquire) {
            return Err(CfsError::GroupNotFound);
        }
        let old = task.group();
        if old == group {
            return Ok(());
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        {
            let mut rq = self.task_rq_lock(&task);
            rq.update_clock(&ctx);
            let se = rq.task_se(id).ok_or(CfsError::TaskNotFound)?;
            let normalized = rq.vruntime_normalized(id);
            let queued = rq.se(se).on_rq;
            let running = rq.curr == Some(id);
            if queued {
                rq.dequeue_task(&ctx, id, DequeueFlags::empty());
            }
            if running {
                rq.put_prev_task(&ctx);
            }
            rq.detach_task_cfs_rq(&ctx, id, normalized);
            rq.set_task_rq(se, &new_tg);
            task.set_group(group);
            rq.attach_task_cfs_rq(&ctx, id, normalized);
            if queued {
                rq.enqueue_task(&ctx, id, EnqueueFlags::empty());
            }
            if running {
                rq.set_curr_task(&ctx, id);
            }
        }
        if let Ok(old_tg) = self.groups.get(old) {
            old_tg.nr_tasks.fetch_sub(1, Ordering::AcqRel);
        }
        new_tg.nr_tasks.fetch_add(1, Ordering::AcqRel);
        log::debug!("[cfs] {} group {} -> {}", id, old, group);
        Ok(())
    }

    /// Hand a task over to another scheduling class
    ///
    /// The task leaves its queues with a relative vruntime and its load
    /// sample detached; it keeps its entity until it comes back.
    pub fn switched_from_fair(&self, id: ThreadId) -> CfsResult<()> {
        let task = self.task(id)?;
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let mut rq = self.task_rq_lock(&task);
        if task.state() == TaskState::Foreign {
            return Ok(());
        }
        rq.update_clock(&ctx);
        let se = rq.task_se(id).ok_or(CfsError::TaskNotFound)?;
        let normalized = rq.vruntime_normalized(id);
        if rq.se(se).on_rq {
            rq.dequeue_task(&ctx, id, DequeueFlags::empty());
        }
        if rq.curr == Some(id) {
            rq.put_prev_task(&ctx);
            rq.resched_curr(&ctx);
        }
        rq.detach_task_cfs_rq(&ctx, id, normalized);
        task.set_state(TaskState::Foreign);
        log::debug!("[cfs] {} leaves the fair class", id);
        Ok(())
    }

    /// Take a task back from another scheduling class
    pub fn switched_to_fair(&self, id: ThreadId, runnable: bool) -> CfsResult<()> {
        let task = self.task(id)?;
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let mut rq = self.task_rq_lock(&task);
        if task.state() != TaskState::Foreign {
            return Err(CfsError::InvalidState);
        }
        rq.update_clock(&ctx);
        // A runnable task gets its vruntime re-based by the enqueue
        rq.attach_task_cfs_rq(&ctx, id, runnable);
        if runnable {
            task.set_state(TaskState::Runnable);
            rq.enqueue_task(&ctx, id, EnqueueFlags::empty());
            rq.check_preempt_wakeup(&ctx, id, WakeFlags::empty());
        } else {
            task.set_state(TaskState::Sleeping);
        }
        log::debug!("[cfs] {} rejoins the fair class", id);
        Ok(())
    }

    // =========================================================================
    // Affinity and migration
    // =========================================================================

    /// Restrict a task to `mask`, moving it off a CPU it may no longer use
    pub fn set_task_affinity(&self, id: ThreadId, mask: CpuMask) -> CfsResult<()> {
        let mask = mask.and(CpuMask::first(self.nr_cpus()));
        let usable = mask.and(self.online_mask());
        let Some(dest) = usable.first_cpu() else {
            return Err(CfsError::AffinityEmpty);
        };
        let task = self.task(id)?;
        task.set_affinity(mask);
        log::debug!("[cfs] {} affinity {:?}", id, mask);
        if usable.contains(task.cpu()) {
            return Ok(());
        }
        self.move_task(&task, dest)
    }

    /// Move a task to `cpu` now
    pub fn migrate_task(&self, id: ThreadId, cpu: usize) -> CfsResult<()> {
        self.check_cpu(cpu)?;
        if !self.shared[cpu].is_online() {
            return Err(CfsError::InvalidCpu);
        }
        let task = self.task(id)?;
        if !task.allows(cpu) {
            return Err(CfsError::InvalidCpu);
        }
        self.move_task(&task, cpu)
    }

    /// Move the entity of `task` to `dest`, whatever its state
    fn move_task(&self, task: &Arc<TaskRef>, dest: usize) -> CfsResult<()> {
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let id = task.id;

        let transit = {
            let mut rq = self.task_rq_lock(task);
            let src = rq.cpu;
            if src == dest {
                return Ok(());
            }
            rq.update_clock(&ctx);
            let se = rq.task_se(id).ok_or(CfsError::TaskNotFound)?;
            if rq.curr == Some(id) {
                rq.put_prev_task(&ctx);
                rq.resched_curr(&ctx);
            }
            if rq.se(se).on_rq {
                let (moving, tg) = rq.detach_task(&ctx, id).ok_or(CfsError::InvalidState)?;
                Transit::Queued(moving, tg)
            } else {
                let state = task.state();
                if !matches!(state, TaskState::Sleeping | TaskState::Foreign) {
                    return Err(CfsError::InvalidState);
                }
                let cfs = rq.cfs_of(se);
                let tg = rq.cfs(cfs).tg.clone();
                let min = rq.cfs(cfs).min_vruntime;
                if state == TaskState::Sleeping {
                    rq.remove_entity_load_avg(se);
                }
                task.set_state(TaskState::Migrating);
                let mut moving = rq.take_task(id).ok_or(CfsError::TaskNotFound)?;
                if state == TaskState::Sleeping {
                    moving.entity.vruntime = moving.entity.vruntime.wrapping_sub(min);
                    moving.entity.avg.last_update_time = 0;
                }
                moving.entity.nr_migrations += 1;
                Transit::Parked { moving, tg, state }
            }
        };

        let mut rq = self.rq(dest);
        rq.update_clock(&ctx);
        match transit {
            Transit::Queued(moving, tg) => {
                rq.attach_task(&ctx, moving, &tg);
            }
            Transit::Parked { moving, tg, state } => {
                let se = rq.put_task(moving, &tg);
                if state == TaskState::Sleeping {
                    let min = rq.cfs(rq.cfs_of(se)).min_vruntime;
                    let e = rq.se_mut(se);
                    e.vruntime = e.vruntime.wrapping_add(min);
                }
                task.set_state(state);
            }
        }
        log::debug!("[cfs] {} moved to cpu{}", id, dest);
        Ok(())
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Create a group under `parent`
    pub fn create_group(&self, parent: GroupId) -> CfsResult<GroupId> {
        let tg = self.groups.create(parent)?;
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        for cpu in 0..self.nr_cpus() {
            let mut rq = self.rq(cpu);
            rq.update_clock(&ctx);
            rq.group_slot(&tg);
        }
        log::info!("[cfs] group {} created under {}", tg.id, parent);
        Ok(tg.id)
    }

    /// Destroy an empty group
    pub fn destroy_group(&self, group: GroupId) -> CfsResult<()> {
        let tg = self.groups.remove(group)?;
        tg.dying.store(true, Ordering::Release);
        for cpu in 0..self.nr_cpus() {
            let mut rq = self.rq(cpu);
            let Some(slot) = rq.groups.get(&group).cloned() else {
                continue;
            };
            if let Some(se) = slot.se {
                rq.remove_entity_load_avg(se);
            }
            rq.list_del_leaf(slot.cfs_rq);
            rq.remove_group(group);
        }
        self.host.timers.cancel(timer_key(group, TimerKind::Period));
        self.host.timers.cancel(timer_key(group, TimerKind::Slack));
        log::info!("[cfs] group {} destroyed", group);
        Ok(())
    }

    /// Set the weight of a group
    pub fn set_group_shares(&self, group: GroupId, shares: u64) -> CfsResult<()> {
        self.groups.set_shares(group, shares)?;
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        for cpu in 0..self.nr_cpus() {
            let mut rq = self.rq(cpu);
            let Some(se) = rq.groups.get(&group).and_then(|slot| slot.se) else {
                continue;
            };
            rq.update_clock(&ctx);
            for s in rq.hierarchy(se) {
                rq.update_load_avg(&ctx, s, false);
                if let Some(q) = rq.se(s).my_q {
                    rq.update_cfs_shares(&ctx, q);
                }
            }
        }
        log::info!("[cfs] group {} shares {}", group, shares);
        Ok(())
    }

    /// Weight of a group
    pub fn group_shares(&self, group: GroupId) -> CfsResult<u64> {
        Ok(self.groups.get(group)?.shares())
    }

    // =========================================================================
    // Configuration and CPU hotplug
    // =========================================================================

    /// Write a tunable and re-derive the snapshot
    pub fn set_tunable(&self, tunable: Tunable, value: u64) -> CfsResult<()> {
        let online = self.online_mask().weight() as usize;
        let mut config = self.config.write();
        config.set_tunable(tunable, value, online)?;
        self.tunables.store(Tunables::derive(&config, online));
        Ok(())
    }

    fn rederive_tunables(&self) {
        let online = self.online_mask().weight() as usize;
        let config = self.config.read();
        self.tunables.store(Tunables::derive(&config, online));
    }

    /// Bring a CPU online or take it offline
    ///
    /// Going offline unthrottles the CPU's queues and moves every task
    /// away from it, ignoring affinity if nothing else is allowed. The
    /// last online CPU cannot go.
    pub fn set_cpu_online(&self, cpu: usize, online: bool) -> CfsResult<()> {
        self.check_cpu(cpu)?;
        if self.shared[cpu].is_online() == online {
            return Ok(());
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);

        if online {
            let mut rq = self.rq(cpu);
            rq.update_clock(&ctx);
            rq.online = true;
        } else {
            if self.online_mask().weight() <= 1 {
                return Err(CfsError::InvalidCpu);
            }
            {
                let mut rq = self.rq(cpu);
                rq.update_clock(&ctx);
                rq.unthrottle_offline_cfs_rqs(&ctx);
                rq.online = false;
            }
            self.nohz.exit_idle(cpu, &self.topology);

            let victims: Vec<Arc<TaskRef>> = self.tasks.read().values().filter(|t| t.cpu() == cpu).cloned().collect();
            let online_mask = self.online_mask();
            for task in victims {
                let dest = match task.affinity().and(online_mask).first_cpu() {
                    Some(dest) => dest,
                    None => {
                        log::warn!("[cfs] {} has no online cpu left, widening its affinity", task.id);
                        task.set_affinity(CpuMask::first(self.nr_cpus()));
                        match online_mask.first_cpu() {
                            Some(dest) => dest,
                            None => continue,
                        }
                    }
                };
                if let Err(err) = self.move_task(&task, dest) {
                    log::warn!("[cfs] cpu{} offline: {} not moved: {}", cpu, task.id, err);
                }
            }
        }
        self.rederive_tunables();
        log::info!("[cfs] cpu{} {}", cpu, if online { "online" } else { "offline" });
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// State of every group queue on `cpu`
    pub fn debug_snapshot(&self, cpu: usize) -> CfsResult<Vec<CfsRqSnapshot>> {
        self.check_cpu(cpu)?;
        Ok(self.rq(cpu).snapshot())
    }

    /// Snapshot of one task
    pub fn task_info(&self, id: ThreadId) -> CfsResult<TaskInfo> {
        let task = self.task(id)?;
        let rq = self.task_rq_lock(&task);
        let se = rq.task_se(id).ok_or(CfsError::TaskNotFound)?;
        let e = rq.se(se);
        Ok(TaskInfo {
            id,
            name: task.name.clone(),
            cpu: rq.cpu,
            state: task.state(),
            policy: task.policy(),
            priority: task.priority(),
            group: task.group(),
            weight: e.load.weight,
            vruntime: e.vruntime,
            sum_exec_runtime: e.sum_exec_runtime,
            nr_migrations: e.nr_migrations,
            load_avg: e.avg.load_avg,
            util_avg: e.avg.util_avg,
            stats: e.stats,
        })
    }

    /// Balancing statistics of a domain
    pub fn domain_stats(&self, cpu: usize, level: usize) -> Option<DomainStats> {
        if cpu >= self.nr_cpus() {
            return None;
        }
        self.rq(cpu).domains.get(level).map(|d| d.stats.clone())
    }

    /// Balancing state of a domain
    pub fn domain_state(&self, cpu: usize, level: usize) -> Option<DomainState> {
        if cpu >= self.nr_cpus() {
            return None;
        }
        self.rq(cpu).domains.get(level).cloned()
    }

    /// Fold a window of per-node fault counts into a task's statistics;
    /// returns its preferred node
    #[cfg(feature = "numa")]
    pub fn record_numa_faults(&self, id: ThreadId, faults: &[u64]) -> CfsResult<Option<usize>> {
        let task = self.task(id)?;
        let params = self.numa_params();
        let mut numa = task.numa.lock();
        Ok(crate::placement::task_numa_placement(&mut numa, faults, &params))
    }

    /// Adapt how often the host samples a task's memory faults; returns
    /// the new period in ms
    #[cfg(feature = "numa")]
    pub fn update_numa_scan_period(
        &self,
        id: ThreadId,
        local: u64,
        remote: u64,
        shared: u64,
        private: u64,
    ) -> CfsResult<u64> {
        let task = self.task(id)?;
        let params = self.numa_params();
        let mut numa = task.numa.lock();
        Ok(crate::placement::update_task_scan_period(&mut numa, local, remote, shared, private, &params))
    }

    #[cfg(feature = "numa")]
    fn numa_params(&self) -> crate::placement::NumaParams {
        match &self.config.read().placement {
            crate::placement::PlacementKind::Numa(params) => params.clone(),
            _ => crate::placement::NumaParams::default(),
        }
    }

    fn pick_local(&self, cpu: usize, ctx: &Ctx<'_>) -> Option<ThreadId> {
        let mut rq = self.rq(cpu);
        rq.update_clock(ctx);
        let next = rq.pick_next_task(ctx);
        if next.is_some() {
            rq.account_idle_wakeup();
        }
        next
    }
}

// =============================================================================
// Framework integration
// =============================================================================

impl Scheduler for CfsScheduler {
    fn name(&self) -> &'static str {
        "CFS"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn init(&mut self, cpu_count: usize) -> ExecResult<()> {
        if cpu_count == self.nr_cpus() {
            log::info!("[cfs] init: {} cpus", cpu_count);
            return Ok(());
        }
        if !self.tasks.read().is_empty() || self.groups.len() > 1 {
            log::warn!("[cfs] init: cannot resize to {} cpus with tasks or groups present", cpu_count);
            return Err(ExecError::Busy);
        }
        let mut config = self.config.read().clone();
        config.cpu_count = cpu_count;
        if config.capacities.len() != cpu_count {
            config.capacities.clear();
        }
        let rebuilt = match Self::new(config.clone(), self.host.clone()) {
            Err(CfsError::InvalidTopology) => {
                log::warn!("[cfs] init: topology does not fit {} cpus, using a flat one", cpu_count);
                config.topology = TopologySpec::flat();
                Self::new(config, self.host.clone())?
            }
            other => other?,
        };
        *self = rebuilt;
        Ok(())
    }

    fn pick_next(&self, cpu: usize) -> Option<ThreadId> {
        if cpu >= self.nr_cpus() {
            return None;
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let mut next = self.pick_local(cpu, &ctx);
        // Only the first pick of an idle period balances
        let online = self.shared[cpu].is_online();
        if next.is_none() && online && self.shared[cpu].idle_stamp() == 0 && self.idle_balance(cpu) > 0 {
            next = self.pick_local(cpu, &ctx);
        }
        match next {
            Some(_) => self.nohz.exit_idle(cpu, &self.topology),
            None if online => self.nohz.enter_idle(cpu, &self.topology),
            None => {}
        }
        next
    }

    fn put_prev(&self, cpu: usize) {
        if cpu >= self.nr_cpus() {
            return;
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let mut rq = self.rq(cpu);
        rq.update_clock(&ctx);
        rq.put_prev_task(&ctx);
    }

    fn add_thread(&self, thread: SchedulableThread) -> ExecResult<()> {
        Ok(self.wake_up_new_task(&thread, None)?)
    }

    fn remove_thread(&self, id: ThreadId) -> ExecResult<()> {
        Ok(self.task_dead(id)?)
    }

    fn thread_ready(&self, id: ThreadId) -> ExecResult<()> {
        Ok(self.try_to_wake_up(id, None, false)?)
    }

    fn thread_block(&self, id: ThreadId) -> ExecResult<()> {
        Ok(self.block_task(id)?)
    }

    fn yield_thread(&self, cpu: usize) {
        self.yield_current(cpu);
    }

    fn tick(&self, cpu: usize) {
        if cpu >= self.nr_cpus() {
            return;
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        {
            let mut rq = self.rq(cpu);
            if !rq.online {
                return;
            }
            rq.update_clock(&ctx);
            rq.task_tick(&ctx);
            rq.update_cpu_load(&ctx);
        }
        self.trigger_load_balance(cpu);
    }

    fn set_priority(&self, id: ThreadId, priority: Priority) -> ExecResult<()> {
        Ok(self.set_task_priority(id, priority)?)
    }

    fn get_priority(&self, id: ThreadId) -> Option<Priority> {
        self.tasks.read().get(&id).map(|t| t.priority())
    }

    fn needs_reschedule(&self, cpu: usize) -> bool {
        cpu < self.nr_cpus() && self.rq(cpu).need_resched
    }

    fn current(&self, cpu: usize) -> Option<ThreadId> {
        if cpu >= self.nr_cpus() {
            return None;
        }
        self.rq(cpu).curr
    }

    fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        let (mut wait_sum, mut wait_count, mut run_sum, mut nr_tasks) = (0u64, 0u64, 0u64, 0u64);
        for cpu in 0..self.nr_cpus() {
            let rq = self.rq(cpu);
            stats.context_switches += rq.nr_switches;
            stats.runnable_threads += rq.nr_running as usize;
            stats.migrations += rq.nr_migrations_in;
            stats.throttled_queues += rq.nr_throttled();
            for rt in rq.tasks.values() {
                let e = rq.se(rt.se);
                wait_sum += e.stats.wait_sum;
                wait_count += e.stats.wait_count;
                run_sum += e.sum_exec_runtime;
                nr_tasks += 1;
            }
            let load = rq.root().avg.util_avg * 100 / rq.capacity.max(1);
            stats.cpu_load.push(load.min(100) as u8);
        }
        stats.blocked_threads = self.tasks.read().values().filter(|t| t.state() == TaskState::Sleeping).count();
        stats.avg_wait_time = if wait_count > 0 { wait_sum / wait_count } else { 0 };
        stats.avg_run_time = if nr_tasks > 0 { run_sum / nr_tasks } else { 0 };
        stats
    }

    fn set_policy(&self, id: ThreadId, policy: SchedulingPolicy) -> ExecResult<()> {
        Ok(self.set_task_policy(id, policy)?)
    }

    fn set_affinity(&self, id: ThreadId, affinity: u64) -> ExecResult<()> {
        Ok(self.set_task_affinity(id, CpuMask::from_bits(affinity))?)
    }

    fn migrate_thread(&self, id: ThreadId, target_cpu: usize) -> ExecResult<()> {
        Ok(self.migrate_task(id, target_cpu)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{thread, Sim, TestHost, MS};

    fn tid(id: u64) -> ThreadId {
        ThreadId::from_raw(id)
    }

    #[test]
    fn test_new_task_runs() {
        let sim = Sim::cpus(1);
        let a = sim.spawn(1, 0);
        assert!(sim.sched.needs_reschedule(0));
        assert_eq!(sim.sched.pick_next(0), Some(a));
        assert_eq!(sim.sched.current(0), Some(a));
        assert_eq!(sim.sched.add_thread(thread(1, 0)), Err(ExecError::AlreadyExists));
    }

    #[test]
    fn test_realtime_rejected() {
        let sim = Sim::cpus(1);
        let fifo = thread(1, 0).with_policy(SchedulingPolicy::Fifo);
        assert_eq!(sim.sched.add_thread(fifo), Err(ExecError::InvalidArgument));
        let rt = SchedulableThread::new(tid(2), Priority::realtime(10));
        assert_eq!(sim.sched.add_thread(rt), Err(ExecError::InvalidArgument));
        assert!(sim.sched.task_ids().is_empty());
    }

    #[test]
    fn test_block_and_wake() {
        let sim = Sim::cpus(1);
        sim.spawn(1, 0);
        sim.spawn(2, 0);
        sim.run_for(10 * MS);

        let running = sim.sched.current(0).unwrap();
        sim.sched.thread_block(running).unwrap();
        assert_eq!(sim.sched.thread_block(running), Err(ExecError::InvalidState));
        assert_eq!(sim.sched.stats().blocked_threads, 1);
        sim.schedule();
        let other = sim.sched.current(0).unwrap();
        assert_ne!(other, running);

        sim.sched.thread_ready(running).unwrap();
        let info = sim.sched.task_info(running).unwrap();
        assert_eq!(info.state, TaskState::Runnable);
        assert_eq!(info.stats.nr_wakeups, 1);
        assert_eq!(sim.sched.nr_running(0), 2);
        // A second wakeup is a no-op
        sim.sched.thread_ready(running).unwrap();
        assert_eq!(sim.sched.task_info(running).unwrap().stats.nr_wakeups, 1);
    }

    #[test]
    fn test_remove_running_task() {
        let sim = Sim::cpus(1);
        sim.spawn(1, 0);
        sim.spawn(2, 0);
        sim.run_for(5 * MS);

        let running = sim.sched.current(0).unwrap();
        sim.sched.remove_thread(running).unwrap();
        assert_eq!(sim.sched.current(0), None);
        assert!(sim.sched.needs_reschedule(0));
        assert_eq!(sim.sched.task_info(running).unwrap_err(), CfsError::TaskNotFound);
        sim.schedule();
        assert!(sim.sched.current(0).is_some());
        assert_eq!(sim.sched.nr_running(0), 1);
    }

    #[test]
    fn test_group_lifecycle() {
        let sim = Sim::cpus(2);
        let g = sim.sched.create_group(ROOT_GROUP).unwrap();
        let a = sim.spawn(1, 0);
        sim.run_for(5 * MS);

        sim.sched.move_task_group(a, g).unwrap();
        assert_eq!(sim.sched.task_info(a).unwrap().group, g);
        assert_eq!(sim.sched.destroy_group(g), Err(CfsError::GroupBusy));
        assert_eq!(sim.sched.destroy_group(ROOT_GROUP), Err(CfsError::RootGroup));
        sim.run_for(5 * MS);

        sim.sched.remove_thread(a).unwrap();
        sim.sched.destroy_group(g).unwrap();
        assert_eq!(sim.sched.group_shares(g), Err(CfsError::GroupNotFound));
        for cpu in 0..2 {
            assert!(sim.sched.debug_snapshot(cpu).unwrap().iter().all(|q| q.group == ROOT_GROUP));
        }
    }

    #[test]
    fn test_group_shares_bounds() {
        let sim = Sim::cpus(1);
        let g = sim.sched.create_group(ROOT_GROUP).unwrap();
        sim.sched.set_group_shares(g, 2048).unwrap();
        assert_eq!(sim.sched.group_shares(g), Ok(2048));
        assert_eq!(sim.sched.set_group_shares(g, 1), Err(CfsError::InvalidShares));
        assert_eq!(sim.sched.set_group_shares(ROOT_GROUP, 2048), Err(CfsError::RootGroup));
        assert_eq!(sim.sched.group_shares(g), Ok(2048));
    }

    #[test]
    fn test_priority_change_reweights() {
        let sim = Sim::cpus(1);
        let a = sim.spawn(1, 0);
        sim.run_for(2 * MS);
        sim.sched.set_priority(a, Priority::normal(5)).unwrap();
        let info = sim.sched.task_info(a).unwrap();
        assert_eq!(info.weight, 335);
        assert_eq!(sim.sched.get_priority(a), Some(Priority::normal(5)));
        assert_eq!(sim.sched.set_priority(a, Priority::realtime(1)), Err(ExecError::InvalidArgument));

        sim.sched.set_policy(a, SchedulingPolicy::Idle).unwrap();
        assert_eq!(sim.sched.task_info(a).unwrap().weight, crate::weight::WEIGHT_IDLEPRIO);
        assert_eq!(sim.sched.set_policy(a, SchedulingPolicy::RoundRobin), Err(ExecError::InvalidArgument));
    }

    #[test]
    fn test_affinity_moves_task() {
        let sim = Sim::cpus(2);
        let a = tid(1);
        sim.sched.add_thread(thread(1, 0).with_affinity(0b01)).unwrap();
        sim.run_for(3 * MS);
        assert_eq!(sim.sched.task_info(a).unwrap().cpu, 0);

        sim.sched.set_task_affinity(a, CpuMask::single(1)).unwrap();
        let info = sim.sched.task_info(a).unwrap();
        assert_eq!(info.cpu, 1);
        assert_eq!(info.state, TaskState::Runnable);
        assert_eq!(sim.sched.set_task_affinity(a, CpuMask::from_bits(0)), Err(CfsError::AffinityEmpty));
        assert_eq!(sim.sched.migrate_thread(a, 0), Err(ExecError::InvalidArgument));
        sim.run_for(3 * MS);
        assert_eq!(sim.sched.current(1), Some(a));
    }

    #[test]
    fn test_sleeping_task_migrates() {
        let sim = Sim::cpus(2);
        let a = tid(1);
        sim.sched.add_thread(thread(1, 0).with_affinity(0b01)).unwrap();
        sim.run_for(3 * MS);
        sim.sched.thread_block(a).unwrap();
        sim.schedule();

        sim.sched.set_task_affinity(a, CpuMask::single(1)).unwrap();
        assert_eq!(sim.sched.task_info(a).unwrap().cpu, 1);
        assert_eq!(sim.sched.task_info(a).unwrap().state, TaskState::Sleeping);
        sim.sched.thread_ready(a).unwrap();
        assert_eq!(sim.sched.task_info(a).unwrap().cpu, 1);
        assert_eq!(sim.sched.nr_running(1), 1);
    }

    #[test]
    fn test_offline_evacuates() {
        let sim = Sim::cpus(2);
        for id in 1..=4 {
            sim.spawn(id, 0);
        }
        sim.run_for(10 * MS);
        assert_eq!(sim.sched.tunables().latency_ns, 12 * MS);

        sim.sched.set_cpu_online(1, false).unwrap();
        for id in 1..=4 {
            assert_eq!(sim.sched.task_info(tid(id)).unwrap().cpu, 0);
        }
        assert_eq!(sim.sched.nr_running(1), 0);
        assert_eq!(sim.sched.set_cpu_online(0, false), Err(CfsError::InvalidCpu));
        assert_eq!(sim.sched.tunables().latency_ns, 6 * MS);
        sim.run_for(10 * MS);
        assert_eq!(sim.sched.current(1), None);

        sim.sched.set_cpu_online(1, true).unwrap();
        assert_eq!(sim.sched.tunables().latency_ns, 12 * MS);
    }

    #[test]
    fn test_wakeup_racing_exit_leaves_no_entity() {
        let sim = Sim::cpus(2);
        for id in 1000..1003 {
            sim.sched.add_thread(thread(id, 0).with_affinity(0b01)).unwrap();
        }
        sim.run_for(5 * MS);

        for id in 1..=200 {
            sim.sched.add_thread(thread(id, 0).with_affinity(0b01)).unwrap();
            sim.sched.set_task_affinity(tid(id), CpuMask::first(2)).unwrap();
            sim.sched.block_task(tid(id)).unwrap();
            sim.schedule();

            let sched = &sim.sched;
            std::thread::scope(|s| {
                s.spawn(|| {
                    let _ = sched.try_to_wake_up(tid(id), None, false);
                });
                s.spawn(|| sched.task_dead(tid(id)).unwrap());
            });

            assert!(sched.task(tid(id)).is_err());
            let held: usize = (0..2).map(|cpu| sched.rq(cpu).tasks.len()).sum();
            assert_eq!(held, sched.task_ids().len(), "round {}", id);
        }
    }

    #[test]
    fn test_cross_cpu_wakeup_ends_runnable() {
        let sim = Sim::cpus(2);
        for id in 1..=3 {
            sim.sched.add_thread(thread(id, 0).with_affinity(0b01)).unwrap();
        }
        let a = tid(4);
        sim.sched.add_thread(thread(4, 0).with_affinity(0b01)).unwrap();
        sim.run_for(5 * MS);
        sim.sched.block_task(a).unwrap();
        sim.schedule();

        sim.sched.set_task_affinity(a, CpuMask::first(2)).unwrap();
        sim.sched.try_to_wake_up(a, None, false).unwrap();
        let info = sim.sched.task_info(a).unwrap();
        assert_eq!(info.state, TaskState::Runnable);
        assert_eq!(info.cpu, 1);
        assert_eq!(info.stats.nr_wakeups_migrate, 1);
        assert_eq!(sim.sched.nr_running(1), 1);
    }

    #[test]
    fn test_rr_interval_splits_period() {
        let sim = Sim::cpus(1);
        let a = sim.spawn(1, 0);
        sim.spawn(2, 0);
        sim.run_for(2 * MS);
        let slice = sim.sched.get_rr_interval(a).unwrap();
        assert!((2_990_000..=3_000_000).contains(&slice), "slice {}", slice);
    }

    #[test]
    fn test_foreign_round_trip() {
        let sim = Sim::cpus(1);
        let a = sim.spawn(1, 0);
        let b = sim.spawn(2, 0);
        sim.run_for(5 * MS);

        sim.sched.switched_from_fair(a).unwrap();
        assert_eq!(sim.sched.task_info(a).unwrap().state, TaskState::Foreign);
        assert_eq!(sim.sched.thread_ready(a), Err(ExecError::InvalidState));
        sim.run_for(5 * MS);
        assert_eq!(sim.sched.current(0), Some(b));

        sim.sched.switched_to_fair(a, true).unwrap();
        assert_eq!(sim.sched.nr_running(0), 2);
        assert_eq!(sim.sched.switched_to_fair(a, true), Err(CfsError::InvalidState));
    }

    #[test]
    fn test_stats_aggregate() {
        let sim = Sim::cpus(1);
        sim.spawn(1, 0);
        sim.spawn(2, 0);
        sim.run_for(50 * MS);
        let stats = sim.sched.stats();
        assert!(stats.context_switches >= 2);
        assert_eq!(stats.runnable_threads, 2);
        assert_eq!(stats.blocked_threads, 0);
        assert_eq!(stats.cpu_load.len(), 1);
        assert!(stats.cpu_load[0] > 0);
        assert!(stats.avg_run_time > 0);
    }

    #[test]
    fn test_init_resizes_only_when_empty() {
        let host = TestHost::new();
        let mut sched = CfsScheduler::new(CfsConfig::with_cpus(2), host.services()).unwrap();
        sched.init(4).unwrap();
        assert_eq!(sched.nr_cpus(), 4);
        sched.add_thread(thread(1, 0)).unwrap();
        assert_eq!(sched.init(2), Err(ExecError::Busy));
        assert_eq!(sched.init(4), Ok(()));
    }
}
