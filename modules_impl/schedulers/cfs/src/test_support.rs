//! Fixtures shared by the unit tests: a hand-driven clock, recording
//! timer and notifier services, a single run queue bench, a lock-free
//! machine view for placement and balancing statistics, and a tick
//! simulator around a whole [`CfsScheduler`].

use crate::config::{CfsConfig, Tunables};
use crate::entity::{GroupId, ROOT_GROUP};
use crate::group::GroupTable;
use crate::placement::{PlacementEnv, WakeContext};
use crate::rq::{Ctx, Rq, RqShared};
use crate::scheduler::CfsScheduler;
use crate::task::{EnqueueFlags, TaskPolicy, TaskRef, TaskState, WakeFlags};
use crate::topology::{CpuMask, SdFlags, Topology, TopologySpec};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use helix_execution::scheduler::{
    Clock, CpuNotifier, HostServices, Priority, SchedulableThread, Scheduler, TimerKey, TimerService,
};
use helix_execution::ThreadId;
use spin::Mutex;

pub const MS: u64 = 1_000_000;

// =============================================================================
// Host services
// =============================================================================

/// Clock moved by hand
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    pub fn get(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self, _cpu: usize) -> u64 {
        self.get()
    }
}

/// Timer service that only records what is armed
#[derive(Debug)]
pub struct RecordingTimers {
    clock: Arc<ManualClock>,
    armed: Mutex<BTreeMap<TimerKey, u64>>,
    arm_calls: AtomicUsize,
}

impl Default for RecordingTimers {
    fn default() -> Self {
        Self::with_clock(Arc::new(ManualClock::new(MS)))
    }
}

impl RecordingTimers {
    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        Self { clock, armed: Mutex::new(BTreeMap::new()), arm_calls: AtomicUsize::new(0) }
    }

    pub fn set_now(&self, ns: u64) {
        self.clock.set(ns);
    }

    pub fn expiry(&self, key: TimerKey) -> Option<u64> {
        self.armed.lock().get(&key).copied()
    }

    pub fn arm_calls(&self) -> usize {
        self.arm_calls.load(Ordering::SeqCst)
    }

    /// Disarm and return the timers due at the current time, earliest first
    pub fn take_due(&self) -> Vec<TimerKey> {
        let now = self.clock.get();
        let mut armed = self.armed.lock();
        let mut due: Vec<(u64, TimerKey)> =
            armed.iter().filter(|(_, &exp)| exp <= now).map(|(&k, &exp)| (exp, k)).collect();
        due.sort();
        for (_, key) in &due {
            armed.remove(key);
        }
        due.into_iter().map(|(_, k)| k).collect()
    }
}

impl TimerService for RecordingTimers {
    fn arm(&self, key: TimerKey, expires_ns: u64) {
        self.arm_calls.fetch_add(1, Ordering::SeqCst);
        self.armed.lock().insert(key, expires_ns);
    }

    fn cancel(&self, key: TimerKey) -> bool {
        self.armed.lock().remove(&key).is_some()
    }

    fn remaining(&self, key: TimerKey) -> Option<u64> {
        let now = self.clock.get();
        self.expiry(key).map(|exp| exp.saturating_sub(now))
    }
}

/// Notifier that queues every request
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    resched: Mutex<Vec<usize>>,
    kicks: Mutex<Vec<usize>>,
    active: Mutex<Vec<usize>>,
}

impl RecordingNotifier {
    pub fn take_resched(&self) -> Vec<usize> {
        core::mem::take(&mut *self.resched.lock())
    }

    pub fn take_kicks(&self) -> Vec<usize> {
        core::mem::take(&mut *self.kicks.lock())
    }

    pub fn take_active(&self) -> Vec<usize> {
        core::mem::take(&mut *self.active.lock())
    }

    pub fn active_requests(&self) -> Vec<usize> {
        self.active.lock().clone()
    }
}

impl CpuNotifier for RecordingNotifier {
    fn resched(&self, cpu: usize) {
        self.resched.lock().push(cpu);
    }

    fn kick_idle_balance(&self, cpu: usize) {
        self.kicks.lock().push(cpu);
    }

    fn request_active_balance(&self, cpu: usize) {
        self.active.lock().push(cpu);
    }
}

/// The three services wired to one clock
#[derive(Debug)]
pub struct TestHost {
    pub clock: Arc<ManualClock>,
    pub timers: Arc<RecordingTimers>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestHost {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(MS));
        let timers = Arc::new(RecordingTimers::with_clock(clock.clone()));
        Self { clock, timers, notifier: Arc::new(RecordingNotifier::default()) }
    }

    pub fn services(&self) -> HostServices {
        HostServices::new(self.clock.clone(), self.timers.clone(), self.notifier.clone())
    }
}

pub fn thread(id: u64, nice: i8) -> SchedulableThread {
    SchedulableThread::new(ThreadId::from_raw(id), Priority::normal(nice))
}

fn task_ref(id: u64, nice: i8, mask: CpuMask, cpu: usize) -> Arc<TaskRef> {
    Arc::new(TaskRef::new(
        ThreadId::from_raw(id),
        String::new(),
        TaskPolicy::Normal,
        Priority::normal(nice),
        mask,
        ROOT_GROUP,
        cpu,
    ))
}

// =============================================================================
// Single run queue
// =============================================================================

/// One CPU's run queue with the services it needs
pub struct Bench {
    pub host: TestHost,
    services: HostServices,
    pub tun: Tunables,
    pub topo: Topology,
    pub table: GroupTable,
    pub rq: Rq,
}

impl Bench {
    pub fn new() -> Self {
        Self::with_config(CfsConfig::with_cpus(1))
    }

    pub fn with_config(config: CfsConfig) -> Self {
        let host = TestHost::new();
        let services = host.services();
        let tun = Tunables::derive(&config, 1);
        let topo = Topology::build(&TopologySpec::flat(), 1, &[]).unwrap();
        let table = GroupTable::new(1);
        let mut rq = Rq::new(0, table.root(), &topo, &tun);
        rq.update_clock(&Ctx { tun: &tun, host: &services, topo: &topo });
        Self { host, services, tun, topo, table, rq }
    }

    pub fn split(&mut self) -> (&mut Rq, Ctx<'_>) {
        (&mut self.rq, Ctx { tun: &self.tun, host: &self.services, topo: &self.topo })
    }

    /// Fork a task into `group` and queue it the way a new task is
    pub fn spawn_in(&mut self, id: u64, nice: i8, group: GroupId) -> ThreadId {
        let tg = self.table.get(group).unwrap();
        let task = task_ref(id, nice, CpuMask::first(1), 0);
        task.set_group(group);
        let tid = task.id;
        let (rq, ctx) = self.split();
        let se = rq.insert_task(task.clone(), &tg);
        rq.task_fork(&ctx, se);
        task.set_state(TaskState::Runnable);
        rq.enqueue_task(&ctx, tid, EnqueueFlags::empty());
        rq.check_preempt_wakeup(&ctx, tid, WakeFlags::FORK);
        tid
    }

    pub fn spawn(&mut self, id: u64, nice: i8) -> ThreadId {
        self.spawn_in(id, nice, ROOT_GROUP)
    }

    /// Let time pass and bring the run queue's clocks along
    pub fn advance(&mut self, ns: u64) {
        self.host.clock.advance(ns);
        let (rq, ctx) = self.split();
        rq.update_clock(&ctx);
    }

    /// Run whatever is picked for `ns`, one tick at a time
    pub fn run(&mut self, ns: u64) {
        let tick = self.tun.tick_ns();
        let mut left = ns;
        while left > 0 {
            let (rq, ctx) = self.split();
            if rq.need_resched || rq.curr.is_none() {
                rq.pick_next_task(&ctx);
            }
            let step = left.min(tick);
            self.advance(step);
            let (rq, ctx) = self.split();
            rq.task_tick(&ctx);
            left -= step;
        }
    }
}

// =============================================================================
// Machine view
// =============================================================================

/// Run queues of several CPUs, driven by hand, for lock-free decisions
pub struct Machine {
    tun: Tunables,
    topo: Topology,
    pub table: GroupTable,
    pub rqs: Vec<Rq>,
}

impl Machine {
    pub fn new(spec: TopologySpec, nr_cpus: usize, capacities: &[u64]) -> Self {
        let topo = Topology::build(&spec, nr_cpus, capacities).unwrap();
        let tun = Tunables::derive(&CfsConfig::with_cpus(nr_cpus), nr_cpus);
        let table = GroupTable::new(nr_cpus);
        let rqs: Vec<Rq> = (0..nr_cpus).map(|cpu| Rq::new(cpu, table.root(), &topo, &tun)).collect();
        for rq in &rqs {
            rq.publish();
        }
        Self { tun, topo, table, rqs }
    }

    pub fn topo(&self) -> &Topology {
        &self.topo
    }

    /// Pretend `cpu` has `nr` tasks worth `load`
    pub fn set_load(&mut self, cpu: usize, nr: u32, load: u64) {
        let rq = &mut self.rqs[cpu];
        rq.nr_running = nr;
        let root = rq.cfs_mut(crate::entity::CfsRqId::ROOT);
        root.nr_running = nr;
        root.h_nr_running = nr;
        root.load.set(load);
        root.runnable.avg = load;
        rq.publish();
    }

    pub fn set_util(&mut self, cpu: usize, util: u64) {
        let rq = &mut self.rqs[cpu];
        rq.cfs_mut(crate::entity::CfsRqId::ROOT).avg.util_avg = util;
        rq.publish();
    }

    pub fn set_idle(&mut self, cpu: usize, stamp: u64) {
        let rq = &mut self.rqs[cpu];
        rq.idle_stamp = stamp;
        rq.publish();
    }

    pub fn shared(&self) -> Vec<Arc<RqShared>> {
        self.rqs.iter().map(|rq| rq.shared.clone()).collect()
    }

    pub fn env<'a>(&'a self, shared: &'a [Arc<RqShared>]) -> PlacementEnv<'a> {
        PlacementEnv { tun: &self.tun, topo: &self.topo, rqs: shared }
    }

    /// Wakeup of a fresh root-group task allowed on `mask`
    pub fn wake_context(&self, id: u64, mask: CpuMask, prev: usize, this: usize, sd_flag: SdFlags) -> WakeContext {
        WakeContext {
            task: task_ref(id, 0, mask, prev),
            group: self.table.root(),
            prev_cpu: prev,
            this_cpu: this,
            sd_flag,
            wake_flags: WakeFlags::empty(),
            load_avg: 1024,
            util_avg: 0,
            wakee_flips: 0,
            waker: None,
        }
    }
}

// =============================================================================
// Whole-scheduler simulation
// =============================================================================

/// A scheduler driven tick by tick the way a host would drive it
pub struct Sim {
    pub host: TestHost,
    pub sched: CfsScheduler,
}

impl Sim {
    pub fn new(config: CfsConfig) -> Self {
        let host = TestHost::new();
        let sched = CfsScheduler::new(config, host.services()).unwrap();
        Self { host, sched }
    }

    pub fn cpus(n: usize) -> Self {
        Self::new(CfsConfig::with_cpus(n))
    }

    pub fn now(&self) -> u64 {
        self.host.clock.get()
    }

    pub fn spawn(&self, id: u64, nice: i8) -> ThreadId {
        self.sched.add_thread(thread(id, nice)).unwrap();
        ThreadId::from_raw(id)
    }

    pub fn spawn_in(&self, id: u64, nice: i8, group: GroupId) -> ThreadId {
        self.sched.wake_up_new_task(&thread(id, nice), Some(group)).unwrap();
        ThreadId::from_raw(id)
    }

    /// Switch tasks on every CPU that asked for it or sits idle
    pub fn schedule(&self) {
        self.host.notifier.take_resched();
        for cpu in 0..self.sched.nr_cpus() {
            if self.sched.needs_reschedule(cpu) || self.sched.current(cpu).is_none() {
                self.sched.pick_next(cpu);
            }
        }
    }

    /// Fire due timers and serve balancing requests
    pub fn service(&self) {
        for key in self.host.timers.take_due() {
            self.sched.timer_fired(key);
        }
        for cpu in self.host.notifier.take_kicks() {
            self.sched.nohz_idle_balance(cpu);
        }
        for cpu in self.host.notifier.take_active() {
            self.sched.active_load_balance(cpu);
        }
    }

    /// One tick on every CPU
    pub fn step(&self) {
        self.schedule();
        self.host.clock.advance(self.sched.tunables().tick_ns());
        self.service();
        for cpu in 0..self.sched.nr_cpus() {
            self.sched.tick(cpu);
        }
        self.service();
        self.schedule();
    }

    pub fn run_for(&self, ns: u64) {
        let end = self.now() + ns;
        while self.now() < end {
            self.step();
        }
    }

    /// CPU time a task has received
    pub fn runtime(&self, id: ThreadId) -> u64 {
        self.sched.task_info(id).unwrap().sum_exec_runtime
    }
}
