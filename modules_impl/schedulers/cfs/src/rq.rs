//! # Per-CPU Run Queue
//!
//! Everything a CPU schedules lives in its [`Rq`], behind one lock:
//! the entity and queue arenas, the group queues of this CPU, its tasks
//! and the per-domain balancing state. The figures other CPUs need for
//! placement and balancing decisions are published to [`RqShared`] at
//! the end of each locked operation.

use crate::cfs_rq::{CfsRq, CfsRqSnapshot};
use crate::config::Tunables;
use crate::entity::{Arena, CfsRqId, Entity, EntityId, EntityOwner, GroupId};
use crate::group::TaskGroup;
use crate::pelt::CapacityScale;
use crate::task::{TaskRef, TaskState};
use crate::topology::Topology;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use hashbrown::HashMap;
use helix_execution::scheduler::HostServices;
use helix_execution::ThreadId;

/// Number of decayed `cpu_load` samples
pub const CPU_LOAD_IDX_MAX: usize = 5;

/// Idle state of a CPU when it balances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuIdleType {
    /// Idle for a while
    Idle = 0,
    /// Running tasks
    NotIdle = 1,
    /// About to go idle
    NewlyIdle = 2,
}

/// Number of [`CpuIdleType`] variants
pub const CPU_MAX_IDLE_TYPES: usize = 3;

/// What an operation needs besides the run queue itself
#[derive(Clone, Copy)]
pub struct Ctx<'a> {
    /// Current knobs
    pub tun: &'a Tunables,
    /// Clock, timers and notification
    pub host: &'a HostServices,
    /// Domain hierarchy
    pub topo: &'a Topology,
}

impl core::fmt::Debug for Ctx<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ctx").field("tun", self.tun).finish_non_exhaustive()
    }
}

/// Figures of a CPU readable without its lock
#[derive(Debug)]
pub struct RqShared {
    /// CPU number
    pub cpu: usize,
    nr_running: AtomicU32,
    h_nr_running: AtomicU32,
    load: AtomicU64,
    weighted_load: AtomicU64,
    util: AtomicU64,
    cpu_load: [AtomicU64; CPU_LOAD_IDX_MAX],
    capacity: AtomicU64,
    capacity_orig: AtomicU64,
    idle: AtomicBool,
    idle_stamp: AtomicU64,
    online: AtomicBool,
    next_balance: AtomicU64,
}

impl RqShared {
    fn new(cpu: usize, capacity: u64) -> Self {
        Self {
            cpu,
            nr_running: AtomicU32::new(0),
            h_nr_running: AtomicU32::new(0),
            load: AtomicU64::new(0),
            weighted_load: AtomicU64::new(0),
            util: AtomicU64::new(0),
            cpu_load: Default::default(),
            capacity: AtomicU64::new(capacity),
            capacity_orig: AtomicU64::new(capacity),
            idle: AtomicBool::new(true),
            idle_stamp: AtomicU64::new(0),
            online: AtomicBool::new(true),
            next_balance: AtomicU64::new(0),
        }
    }

    /// Fair tasks on the CPU
    #[inline]
    pub fn nr_running(&self) -> u32 {
        self.nr_running.load(Ordering::Acquire)
    }

    /// Tasks queued anywhere under the root queue
    #[inline]
    pub fn h_nr_running(&self) -> u32 {
        self.h_nr_running.load(Ordering::Acquire)
    }

    /// Weight queued on the root queue
    #[inline]
    pub fn load(&self) -> u64 {
        self.load.load(Ordering::Relaxed)
    }

    /// Decayed runnable load of the root queue
    #[inline]
    pub fn weighted_cpuload(&self) -> u64 {
        self.weighted_load.load(Ordering::Relaxed)
    }

    /// Utilization, capped at the CPU's full capacity
    #[inline]
    pub fn util(&self) -> u64 {
        self.util.load(Ordering::Relaxed).min(self.capacity_orig())
    }

    /// Load seen through domain load index `idx`: 0 is the current
    /// load, `n` the history sample `n - 1`
    #[inline]
    pub fn cpu_load(&self, idx: usize) -> u64 {
        if idx == 0 {
            return self.weighted_cpuload();
        }
        self.cpu_load[(idx - 1).min(CPU_LOAD_IDX_MAX - 1)].load(Ordering::Relaxed)
    }

    /// Capacity available to fair tasks
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Full capacity
    #[inline]
    pub fn capacity_orig(&self) -> u64 {
        self.capacity_orig.load(Ordering::Relaxed)
    }

    /// No task running and nothing queued
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Clock when the CPU last went idle
    #[inline]
    pub fn idle_stamp(&self) -> u64 {
        self.idle_stamp.load(Ordering::Relaxed)
    }

    /// Whether the CPU takes tasks
    #[inline]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Tick of the next periodic balance
    #[inline]
    pub fn next_balance(&self) -> u64 {
        self.next_balance.load(Ordering::Relaxed)
    }

    /// Average task load on the CPU
    pub fn load_per_task(&self) -> u64 {
        let nr = self.h_nr_running() as u64;
        if nr == 0 { 0 } else { self.weighted_cpuload() / nr }
    }
}

/// Balancing counters of one domain level
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainStats {
    pub lb_count: [u64; CPU_MAX_IDLE_TYPES],
    pub lb_failed: [u64; CPU_MAX_IDLE_TYPES],
    pub lb_balanced: [u64; CPU_MAX_IDLE_TYPES],
    pub lb_imbalance: [u64; CPU_MAX_IDLE_TYPES],
    pub lb_gained: [u64; CPU_MAX_IDLE_TYPES],
    pub lb_hot_gained: [u64; CPU_MAX_IDLE_TYPES],
    pub lb_nobusyg: [u64; CPU_MAX_IDLE_TYPES],
    pub lb_nobusyq: [u64; CPU_MAX_IDLE_TYPES],
    pub alb_count: u64,
    pub alb_failed: u64,
    pub alb_pushed: u64,
    pub ttwu_wake_remote: u64,
    pub ttwu_move_affine: u64,
    pub ttwu_move_balance: u64,
}

/// Balancing state a CPU keeps for one of its domains
#[derive(Debug, Clone)]
pub struct DomainState {
    /// Current interval in ms
    pub balance_interval: u64,
    /// Consecutive failed attempts
    pub nr_balance_failed: u32,
    /// Tick of the last attempt
    pub last_balance: u64,
    /// Most expensive newly-idle balance seen, decayed
    pub max_newidle_lb_cost: u64,
    /// Tick when `max_newidle_lb_cost` decays next
    pub next_decay_max_lb_cost: u64,
    /// Counters
    pub stats: DomainStats,
}

impl DomainState {
    fn new(min_interval: u64) -> Self {
        Self {
            balance_interval: min_interval,
            nr_balance_failed: 0,
            last_balance: 0,
            max_newidle_lb_cost: 0,
            next_decay_max_lb_cost: 0,
            stats: DomainStats::default(),
        }
    }
}

/// A group's presence on this CPU
#[derive(Debug, Clone)]
pub struct GroupSlot {
    /// Group
    pub tg: Arc<TaskGroup>,
    /// Queue of the group on this CPU
    pub cfs_rq: CfsRqId,
    /// Entity of the group in the parent's queue, `None` for the root
    pub se: Option<EntityId>,
}

/// A task whose entity lives on this CPU
#[derive(Debug, Clone)]
pub struct RqTask {
    /// Entity
    pub se: EntityId,
    /// Metadata
    pub task: Arc<TaskRef>,
}

/// Entity of a task in transit between two run queues
///
/// While held it is in no arena, so no CPU can pick it.
#[derive(Debug)]
pub struct MovingTask {
    /// Metadata
    pub task: Arc<TaskRef>,
    /// Entity, vruntime normalized
    pub entity: Entity,
}

/// Per-CPU run queue
#[derive(Debug)]
pub struct Rq {
    /// CPU number
    pub cpu: usize,
    /// Entities of this CPU
    pub entities: Arena<Entity>,
    /// Fair queues of this CPU; index 0 is the root
    pub queues: Arena<CfsRq>,
    /// Group presence on this CPU
    pub groups: HashMap<GroupId, GroupSlot>,
    /// Tasks whose entity lives here
    pub tasks: HashMap<ThreadId, RqTask>,
    /// Fair tasks counted on this CPU
    pub nr_running: u32,
    /// Running task
    pub curr: Option<ThreadId>,
    /// Running task should be re-evaluated
    pub need_resched: bool,
    /// Wall clock
    pub clock: u64,
    /// Task clock
    pub clock_task: u64,
    /// Non-empty queues, children before parents
    pub leaf_list: Vec<CfsRqId>,
    /// Queued tasks in balancing order
    pub cfs_tasks: VecDeque<ThreadId>,
    /// Decayed load history
    pub cpu_load: [u64; CPU_LOAD_IDX_MAX],
    /// Tick of the last `cpu_load` update
    pub last_load_update_tick: u64,
    /// Average idle period
    pub avg_idle: u64,
    /// Clock when the CPU went idle, 0 while busy
    pub idle_stamp: u64,
    /// Most expensive newly-idle balance across domains
    pub max_idle_balance_cost: u64,
    /// Tick of the next periodic balance
    pub next_balance: u64,
    /// Per-domain balancing state
    pub domains: Vec<DomainState>,
    /// A forced migration is pending on this CPU
    pub active_balance: bool,
    /// Destination of the pending forced migration
    pub push_cpu: usize,
    /// Accepting tasks
    pub online: bool,
    /// Context switches
    pub nr_switches: u64,
    /// Tasks that migrated to this CPU
    pub nr_migrations_in: u64,
    /// Capacity available to fair tasks
    pub capacity: u64,
    /// Full capacity
    pub capacity_orig: u64,
    /// Lock-free figures
    pub shared: Arc<RqShared>,
}

impl Rq {
    /// Create the run queue of `cpu` with the root group's queue in it
    pub fn new(cpu: usize, root: Arc<TaskGroup>, topo: &Topology, tun: &Tunables) -> Self {
        let capacity = topo.capacity_orig(cpu);
        let mut queues = Arena::new();
        let root_id = queues.insert(CfsRq::new(root.clone(), None, None));
        debug_assert_eq!(root_id, CfsRqId::ROOT.index());
        let mut groups = HashMap::new();
        groups.insert(root.id, GroupSlot { tg: root, cfs_rq: CfsRqId::ROOT, se: None });
        let domains = topo.domains(cpu).iter().map(|sd| DomainState::new(sd.min_interval)).collect();
        Self {
            cpu,
            entities: Arena::new(),
            queues,
            groups,
            tasks: HashMap::new(),
            nr_running: 0,
            curr: None,
            need_resched: false,
            clock: 0,
            clock_task: 0,
            leaf_list: Vec::new(),
            cfs_tasks: VecDeque::new(),
            cpu_load: [0; CPU_LOAD_IDX_MAX],
            last_load_update_tick: 0,
            avg_idle: 2 * tun.migration_cost_ns,
            idle_stamp: 0,
            max_idle_balance_cost: tun.migration_cost_ns,
            next_balance: 0,
            domains,
            active_balance: false,
            push_cpu: cpu,
            online: true,
            nr_switches: 0,
            nr_migrations_in: 0,
            capacity,
            capacity_orig: capacity,
            shared: Arc::new(RqShared::new(cpu, capacity)),
        }
    }

    // =========================================================================
    // Arena access
    // =========================================================================

    /// Entity `id`
    #[inline]
    pub fn se(&self, id: EntityId) -> &Entity {
        &self.entities[id.index()]
    }

    /// Entity `id`, mutably
    #[inline]
    pub fn se_mut(&mut self, id: EntityId) -> &mut Entity {
        &mut self.entities[id.index()]
    }

    /// Queue `id`
    #[inline]
    pub fn cfs(&self, id: CfsRqId) -> &CfsRq {
        &self.queues[id.index()]
    }

    /// Queue `id`, mutably
    #[inline]
    pub fn cfs_mut(&mut self, id: CfsRqId) -> &mut CfsRq {
        &mut self.queues[id.index()]
    }

    /// Root queue
    #[inline]
    pub fn root(&self) -> &CfsRq {
        self.cfs(CfsRqId::ROOT)
    }

    /// Queue an entity is in
    #[inline]
    pub fn cfs_of(&self, se: EntityId) -> CfsRqId {
        self.se(se).cfs_rq
    }

    /// Parent group entity
    #[inline]
    pub fn parent_of(&self, se: EntityId) -> Option<EntityId> {
        self.se(se).parent
    }

    /// Entity of a task living here
    #[inline]
    pub fn task_se(&self, id: ThreadId) -> Option<EntityId> {
        self.tasks.get(&id).map(|t| t.se)
    }

    /// Metadata of a task living here
    #[inline]
    pub fn task_ref(&self, id: ThreadId) -> Option<&Arc<TaskRef>> {
        self.tasks.get(&id).map(|t| &t.task)
    }

    /// Metadata of the task owning entity `se`
    pub fn task_of(&self, se: EntityId) -> Option<&Arc<TaskRef>> {
        self.se(se).task().and_then(|id| self.task_ref(id))
    }

    /// Entity of the running task
    #[inline]
    pub fn curr_se(&self) -> Option<EntityId> {
        self.curr.and_then(|id| self.task_se(id))
    }

    /// Entity and its ancestors, bottom-up
    pub fn hierarchy(&self, se: EntityId) -> arrayvec::ArrayVec<EntityId, { crate::group::MAX_GROUP_DEPTH }> {
        let mut path = arrayvec::ArrayVec::new();
        let mut cur = Some(se);
        while let Some(s) = cur {
            path.push(s);
            cur = self.se(s).parent;
        }
        path
    }

    /// Whether the task of entity `se` has the idle policy
    pub fn se_is_idle_policy(&self, se: EntityId) -> bool {
        self.task_of(se).is_some_and(|t| t.policy() == crate::task::TaskPolicy::Idle)
    }

    // =========================================================================
    // Clock
    // =========================================================================

    /// Advance the clocks from the host; they never go backwards
    pub fn update_clock(&mut self, ctx: &Ctx<'_>) {
        let now = ctx.host.clock.now(self.cpu);
        let task_now = ctx.host.clock.task_now(self.cpu);
        if now > self.clock {
            self.clock = now;
        }
        if task_now > self.clock_task {
            self.clock_task = task_now;
        }
    }

    /// Task clock of a queue, frozen while its hierarchy is throttled
    #[inline]
    pub fn cfs_clock_task(&self, cfs: CfsRqId) -> u64 {
        let q = self.cfs(cfs);
        if q.throttle_count > 0 {
            q.throttled_clock_task
        } else {
            self.clock_task - q.throttled_clock_task_time
        }
    }

    /// Current tick number
    #[inline]
    pub fn jiffies(&self, ctx: &Ctx<'_>) -> u64 {
        ctx.tun.ticks(self.clock)
    }

    /// Scale for load tracking on this CPU
    #[inline]
    pub fn capacity_scale(&self) -> CapacityScale {
        CapacityScale { freq: crate::weight::SCHED_CAPACITY_SCALE, cpu: self.capacity_orig }
    }

    // =========================================================================
    // Rescheduling
    // =========================================================================

    /// Ask this CPU to re-evaluate its running task
    pub fn resched_curr(&mut self, ctx: &Ctx<'_>) {
        if self.need_resched {
            return;
        }
        self.need_resched = true;
        ctx.host.notifier.resched(self.cpu);
    }

    /// Whether nothing is running or queued
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.curr.is_none() && self.nr_running == 0
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Queue and entity of `tg` here, creating them (and those of missing
    /// ancestors) on first use
    pub fn group_slot(&mut self, tg: &Arc<TaskGroup>) -> GroupSlot {
        if let Some(slot) = self.groups.get(&tg.id) {
            return slot.clone();
        }
        let Some(parent) = tg.parent.clone() else {
            return GroupSlot { tg: tg.clone(), cfs_rq: CfsRqId::ROOT, se: None };
        };
        let parent_slot = self.group_slot(&parent);
        let parent_depth = parent_slot.se.map_or(0, |s| self.se(s).depth + 1);

        let mut se = Entity::new(EntityOwner::Group(tg.id), tg.shares(), parent_slot.cfs_rq);
        se.parent = parent_slot.se;
        se.depth = parent_depth;
        // Nothing to decay yet
        se.avg = Default::default();
        let se_id = EntityId::from_index(self.entities.insert(se));

        let cfs = CfsRq::new(tg.clone(), Some(se_id), Some(parent_slot.cfs_rq));
        let cfs_id = CfsRqId::from_index(self.queues.insert(cfs));
        self.se_mut(se_id).my_q = Some(cfs_id);
        self.cfs_mut(parent_slot.cfs_rq).children.push(cfs_id);

        // Bandwidth state follows the group's pool
        let (enabled, expires) = {
            let pool = tg.bandwidth.lock();
            (pool.quota.is_some(), pool.runtime_expires)
        };
        {
            let q = self.cfs_mut(cfs_id);
            q.runtime_enabled = enabled;
            q.runtime_expires = expires;
        }
        self.sync_throttle(cfs_id);

        let slot = GroupSlot { tg: tg.clone(), cfs_rq: cfs_id, se: Some(se_id) };
        self.groups.insert(tg.id, slot.clone());
        slot
    }

    /// Drop the queue and entity of an empty group
    pub fn remove_group(&mut self, group: GroupId) {
        let Some(slot) = self.groups.remove(&group) else {
            return;
        };
        let Some(se) = slot.se else {
            return;
        };
        debug_assert_eq!(self.cfs(slot.cfs_rq).nr_running, 0);
        if self.se(se).on_rq {
            log::warn!("[cfs] cpu{}: removing group {} still queued", self.cpu, group);
        }
        let parent = self.cfs(slot.cfs_rq).parent;
        if let Some(parent) = parent {
            self.cfs_mut(parent).children.retain(|&c| c != slot.cfs_rq);
        }
        self.leaf_list.retain(|&c| c != slot.cfs_rq);
        self.entities.remove(se.index());
        self.queues.remove(slot.cfs_rq.index());
    }

    /// Link a queue into the leaf list, deeper queues first
    pub fn list_add_leaf(&mut self, cfs: CfsRqId) {
        if self.cfs(cfs).on_list {
            return;
        }
        let depth = self.queue_depth(cfs);
        let pos = self
            .leaf_list
            .iter()
            .position(|&c| self.queue_depth(c) < depth)
            .unwrap_or(self.leaf_list.len());
        self.leaf_list.insert(pos, cfs);
        self.cfs_mut(cfs).on_list = true;
    }

    /// Nesting depth of a queue
    pub fn queue_depth(&self, cfs: CfsRqId) -> u32 {
        self.cfs(cfs).se.map_or(0, |se| self.se(se).depth + 1)
    }

    // =========================================================================
    // Task entities
    // =========================================================================

    /// Create the entity of a new task in its group's queue
    pub fn insert_task(&mut self, task: Arc<TaskRef>, tg: &Arc<TaskGroup>) -> EntityId {
        let slot = self.group_slot(tg);
        let mut se = Entity::new(EntityOwner::Task(task.id), task.weight(), slot.cfs_rq);
        se.parent = slot.se;
        se.depth = slot.se.map_or(0, |s| self.se(s).depth + 1);
        let id = EntityId::from_index(self.entities.insert(se));
        task.set_cpu(self.cpu);
        self.tasks.insert(task.id, RqTask { se: id, task });
        id
    }

    /// Take a task's entity out of this CPU; it must not be queued
    pub fn take_task(&mut self, id: ThreadId) -> Option<MovingTask> {
        let rt = self.tasks.remove(&id)?;
        debug_assert!(!self.se(rt.se).on_rq, "taking a queued task");
        let entity = self.entities.remove(rt.se.index())?;
        Some(MovingTask { task: rt.task, entity })
    }

    /// Adopt a task's entity, hooking it under its group's queue here
    pub fn put_task(&mut self, moving: MovingTask, tg: &Arc<TaskGroup>) -> EntityId {
        let slot = self.group_slot(tg);
        let MovingTask { task, mut entity } = moving;
        entity.cfs_rq = slot.cfs_rq;
        entity.parent = slot.se;
        entity.depth = slot.se.map_or(0, |s| self.se(s).depth + 1);
        entity.run_node = None;
        entity.on_rq = false;
        let id = EntityId::from_index(self.entities.insert(entity));
        task.set_cpu(self.cpu);
        self.tasks.insert(task.id, RqTask { se: id, task });
        id
    }

    /// Point a task's entity at another group's queue on this CPU; the
    /// entity must be neither queued nor running
    pub fn set_task_rq(&mut self, se: EntityId, tg: &Arc<TaskGroup>) {
        let slot = self.group_slot(tg);
        let depth = slot.se.map_or(0, |s| self.se(s).depth + 1);
        let e = self.se_mut(se);
        e.cfs_rq = slot.cfs_rq;
        e.parent = slot.se;
        e.depth = depth;
    }

    /// Drop a dead task's entity
    pub fn remove_task(&mut self, id: ThreadId) -> Option<Entity> {
        let rt = self.tasks.remove(&id)?;
        rt.task.set_state(TaskState::Dead);
        self.cfs_tasks.retain(|&t| t != id);
        self.entities.remove(rt.se.index())
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Publish the lock-free figures; called before the lock is dropped
    pub fn publish(&self) {
        let s = &*self.shared;
        let root = self.root();
        s.nr_running.store(self.nr_running, Ordering::Release);
        s.h_nr_running.store(root.h_nr_running, Ordering::Release);
        s.load.store(root.load.weight, Ordering::Relaxed);
        s.weighted_load.store(root.runnable.avg, Ordering::Relaxed);
        s.util.store(root.avg.util_avg, Ordering::Relaxed);
        for (i, v) in self.cpu_load.iter().enumerate() {
            s.cpu_load[i].store(*v, Ordering::Relaxed);
        }
        s.capacity.store(self.capacity, Ordering::Relaxed);
        s.idle.store(self.is_idle(), Ordering::Release);
        s.idle_stamp.store(self.idle_stamp, Ordering::Relaxed);
        s.online.store(self.online, Ordering::Release);
        s.next_balance.store(self.next_balance, Ordering::Relaxed);

        for &cfs in &self.leaf_list {
            let q = self.cfs(cfs);
            let Some(se) = q.se else { continue };
            if let Some(state) = q.tg.per_cpu.get(self.cpu) {
                state.cfs_load_avg.store(q.avg.load_avg, Ordering::Relaxed);
                state.load_avg_contrib.store(q.tg_load_avg_contrib, Ordering::Relaxed);
                state.se_load_avg.store(self.se(se).avg.load_avg, Ordering::Relaxed);
            }
        }
    }

    /// Snapshot of every group queue on this CPU
    pub fn snapshot(&self) -> Vec<CfsRqSnapshot> {
        let mut out: Vec<CfsRqSnapshot> = self.queues.iter().map(|(_, q)| CfsRqSnapshot::from(q)).collect();
        out.sort_by_key(|s| s.group);
        out
    }
}
