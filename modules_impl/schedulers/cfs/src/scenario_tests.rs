//! Whole-scheduler scenarios driven tick by tick through [`Sim`].

use crate::config::{CfsConfig, Tunable};
use crate::entity::{GroupId, ROOT_GROUP};
use crate::error::CfsError;
use crate::task::TaskState;
use crate::test_support::{thread, Sim, MS};
use crate::topology::CpuMask;
use crate::vtime::before;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use helix_execution::scheduler::{Priority, Scheduler, SchedulerFramework};
use helix_execution::ThreadId;
use proptest::prelude::*;

fn tid(id: u64) -> ThreadId {
    ThreadId::from_raw(id)
}

/// Every runnable task is queued on exactly one CPU, counting those held
/// under a throttled group queue, and every running task is reported on
/// the CPU that runs it
///
/// Group queues are assumed one level below the root.
fn assert_conserved(sim: &Sim) {
    let ids = sim.sched.task_ids();
    let runnable = ids
        .iter()
        .filter(|&&id| sim.sched.task_info(id).map(|i| i.state == TaskState::Runnable).unwrap_or(false))
        .count();
    let queued: u32 = (0..sim.sched.nr_cpus()).map(|cpu| sim.sched.nr_running(cpu)).sum();
    let throttled: u32 = (0..sim.sched.nr_cpus())
        .flat_map(|cpu| sim.sched.debug_snapshot(cpu).unwrap())
        .filter(|q| q.throttled)
        .map(|q| q.h_nr_running)
        .sum();
    assert_eq!((queued + throttled) as usize, runnable);

    let mut running = Vec::new();
    for cpu in 0..sim.sched.nr_cpus() {
        if let Some(curr) = sim.sched.current(cpu) {
            assert_eq!(sim.sched.task_info(curr).unwrap().cpu, cpu);
            assert!(!running.contains(&curr), "{} runs twice", curr);
            running.push(curr);
        }
    }
}

// =============================================================================
// Fairness
// =============================================================================

#[test]
fn test_equal_weights_share_evenly() {
    let sim = Sim::cpus(1);
    let ids: Vec<ThreadId> = (1..=4).map(|id| sim.spawn(id, 0)).collect();
    sim.run_for(600 * MS);

    let runtimes: Vec<u64> = ids.iter().map(|&id| sim.runtime(id)).collect();
    let total: u64 = runtimes.iter().sum();
    let mean = total / 4;
    for rt in runtimes {
        assert!(rt.abs_diff(mean) <= mean / 10, "runtime {} vs mean {}", rt, mean);
    }
}

#[test]
fn test_fairness_gap_stays_bounded() {
    let sim = Sim::cpus(1);
    let ids = [sim.spawn(1, 0), sim.spawn(2, 0), sim.spawn(3, 0)];

    // Gap between most and least served task, absolute and relative
    let gap = |sim: &Sim| {
        let rts = ids.map(|id| sim.runtime(id));
        let max = rts.iter().max().copied().unwrap_or(0);
        let min = rts.iter().min().copied().unwrap_or(0);
        (max - min, (max - min) as f64 / rts.iter().sum::<u64>() as f64)
    };
    sim.run_for(60 * MS);
    let (short_abs, _) = gap(&sim);
    sim.run_for(900 * MS);
    let (long_abs, long_rel) = gap(&sim);
    assert!(short_abs <= 4 * MS, "gap {}", short_abs);
    assert!(long_abs <= 4 * MS, "gap {}", long_abs);
    assert!(long_rel < 0.01, "relative gap {}", long_rel);
}

#[test]
fn test_group_weights_split_two_to_one() {
    let sim = Sim::cpus(1);
    let heavy = sim.sched.create_group(ROOT_GROUP).unwrap();
    let light = sim.sched.create_group(ROOT_GROUP).unwrap();
    sim.sched.set_group_shares(heavy, 2048).unwrap();
    sim.sched.set_group_shares(light, 1024).unwrap();
    let a = sim.spawn_in(1, 0, heavy);
    let b = sim.spawn_in(2, 0, light);
    sim.run_for(900 * MS);

    let ratio = sim.runtime(a) as f64 / sim.runtime(b) as f64;
    assert!((1.8..=2.2).contains(&ratio), "ratio {}", ratio);
}

#[test]
fn test_nice_levels_weight_runtime() {
    let sim = Sim::cpus(1);
    let a = sim.spawn(1, 0);
    let b = sim.spawn(2, 5);
    sim.run_for(800 * MS);

    // 1024 : 335
    let ratio = sim.runtime(a) as f64 / sim.runtime(b) as f64;
    assert!((2.7..=3.4).contains(&ratio), "ratio {}", ratio);
}

#[test]
fn test_sleeper_bonus_is_bounded() {
    let sim = Sim::cpus(1);
    let hog = sim.spawn(1, 0);
    let sleeper = sim.spawn(2, 0);

    let mut burst_start = 0;
    let mut slept_at = None;
    let end = sim.now() + 1_000 * MS;
    while sim.now() < end {
        sim.step();
        match slept_at {
            None if sim.runtime(sleeper) - burst_start >= 2 * MS => {
                sim.sched.thread_block(sleeper).unwrap();
                slept_at = Some(sim.now());
            }
            Some(at) if sim.now() - at >= 2 * MS => {
                sim.sched.thread_ready(sleeper).unwrap();
                burst_start = sim.runtime(sleeper);
                slept_at = None;
            }
            _ => {}
        }
    }

    let share = sim.runtime(hog) as f64 / (1_000 * MS) as f64;
    assert!((0.45..=0.8).contains(&share), "hog share {}", share);
    assert!(sim.runtime(sleeper) > 150 * MS);
}

// =============================================================================
// Bandwidth
// =============================================================================

#[test]
fn test_quota_caps_runtime() {
    let sim = Sim::cpus(1);
    let g = sim.sched.create_group(ROOT_GROUP).unwrap();
    sim.sched.set_group_bandwidth(g, Some(50 * MS), 100 * MS).unwrap();
    let a = sim.spawn_in(1, 0, g);

    let mut seen_throttled = false;
    let mut ran_after_throttle = false;
    let end = sim.now() + 250 * MS;
    while sim.now() < end {
        let before = sim.runtime(a);
        sim.step();
        let throttled = sim.sched.group_bandwidth_stats(g).unwrap().throttled_cpus > 0;
        if throttled {
            seen_throttled = true;
        } else if seen_throttled && sim.runtime(a) > before {
            ran_after_throttle = true;
        }
    }

    let runtime = sim.runtime(a);
    assert!(runtime <= 155 * MS, "runtime {}", runtime);
    assert!(runtime >= 100 * MS, "runtime {}", runtime);
    assert!(seen_throttled);
    assert!(ran_after_throttle);
    assert!(sim.sched.group_bandwidth_stats(g).unwrap().nr_throttled >= 2);
}

#[test]
fn test_unthrottled_neighbour_keeps_running() {
    let sim = Sim::cpus(1);
    let g = sim.sched.create_group(ROOT_GROUP).unwrap();
    sim.sched.set_group_bandwidth(g, Some(10 * MS), 100 * MS).unwrap();
    let limited = sim.spawn_in(1, 0, g);
    let free = sim.spawn(2, 0);
    sim.run_for(300 * MS);

    assert!(sim.runtime(limited) <= 35 * MS, "limited {}", sim.runtime(limited));
    assert!(sim.runtime(free) >= 260 * MS, "free {}", sim.runtime(free));
}

#[test]
fn test_quota_shared_across_cpus() {
    let sim = Sim::cpus(2);
    let g = sim.sched.create_group(ROOT_GROUP).unwrap();
    sim.sched.set_group_bandwidth(g, Some(50 * MS), 100 * MS).unwrap();
    let ids = [tid(1), tid(2)];
    for (cpu, &id) in ids.iter().enumerate() {
        sim.sched.add_thread(thread(id.as_u64(), 0).with_affinity(1 << cpu)).unwrap();
        sim.sched.move_task_group(id, g).unwrap();
    }
    let slice = sim.sched.tunables().bandwidth_slice_ns;

    let mut last = ids.map(|id| sim.runtime(id));
    for window in 0..5 {
        sim.run_for(100 * MS);
        let now = ids.map(|id| sim.runtime(id));
        let gained = [now[0] - last[0], now[1] - last[1]];
        let total = gained[0] + gained[1];
        assert!(total <= 50 * MS + slice, "window {}: total {}", window, total);
        if window > 0 {
            // Both queues come back every period
            assert!(gained.iter().all(|&ns| ns > 0), "window {}: {:?}", window, gained);
            assert!(total >= 25 * MS, "window {}: total {}", window, total);
        }
        last = now;
    }
    for id in ids {
        let info = sim.sched.task_info(id).unwrap();
        assert_eq!(info.cpu, id.as_u64() as usize - 1);
    }
    assert!(sim.sched.group_bandwidth_stats(g).unwrap().nr_throttled >= 2);
}

#[test]
fn test_bad_bandwidth_keeps_previous() {
    let sim = Sim::cpus(1);
    let g = sim.sched.create_group(ROOT_GROUP).unwrap();
    sim.sched.set_group_bandwidth(g, Some(20 * MS), 100 * MS).unwrap();

    assert_eq!(sim.sched.set_group_bandwidth(g, Some(MS / 2), 100 * MS), Err(CfsError::InvalidQuota));
    assert_eq!(sim.sched.set_group_bandwidth(g, Some(20 * MS), MS / 2), Err(CfsError::InvalidPeriod));
    assert_eq!(sim.sched.set_group_bandwidth(g, Some(20 * MS), 2_000 * MS), Err(CfsError::InvalidPeriod));
    assert_eq!(sim.sched.set_group_bandwidth(ROOT_GROUP, None, 100 * MS), Err(CfsError::RootGroup));
    assert_eq!(sim.sched.group_bandwidth(g), Ok((Some(20 * MS), 100 * MS)));
}

#[test]
fn test_huge_parent_quota_admits_child() {
    let sim = Sim::cpus(1);
    let parent = sim.sched.create_group(ROOT_GROUP).unwrap();
    let child = sim.sched.create_group(parent).unwrap();
    sim.sched.set_group_bandwidth(parent, Some(1 << 45), 1_000 * MS).unwrap();
    sim.sched.set_group_bandwidth(child, Some(10 * MS), 100 * MS).unwrap();
    assert_eq!(sim.sched.group_bandwidth(child), Ok((Some(10 * MS), 100 * MS)));
    assert_eq!(
        sim.sched.set_group_bandwidth(parent, Some(5 * MS), 100 * MS),
        Err(CfsError::QuotaTooLarge)
    );
}

// =============================================================================
// Migration and balancing
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Step,
    Block(u64),
    Wake(u64),
    Pin(u64, usize),
    Unpin(u64),
    Migrate(u64, usize),
    Nice(u64, i8),
    Yield(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Step),
        2 => (1..=6u64).prop_map(Op::Block),
        2 => (1..=6u64).prop_map(Op::Wake),
        1 => (1..=6u64, 0..2usize).prop_map(|(t, c)| Op::Pin(t, c)),
        1 => (1..=6u64).prop_map(Op::Unpin),
        1 => (1..=6u64, 0..2usize).prop_map(|(t, c)| Op::Migrate(t, c)),
        1 => (1..=6u64, -5..=5i8).prop_map(|(t, n)| Op::Nice(t, n)),
        1 => (0..2usize).prop_map(Op::Yield),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_tasks_live_on_one_queue(ops in proptest::collection::vec(op(), 1..60)) {
        let sim = Sim::cpus(2);
        for id in 1..=6 {
            sim.spawn(id, 0);
        }
        for op in ops {
            // Rejected operations are part of the sequence too
            let _ = match op {
                Op::Step => {
                    sim.step();
                    Ok(())
                }
                Op::Block(t) => sim.sched.thread_block(tid(t)),
                Op::Wake(t) => sim.sched.thread_ready(tid(t)),
                Op::Pin(t, c) => sim.sched.set_affinity(tid(t), 1 << c),
                Op::Unpin(t) => sim.sched.set_affinity(tid(t), u64::MAX),
                Op::Migrate(t, c) => sim.sched.migrate_thread(tid(t), c),
                Op::Nice(t, n) => sim.sched.set_priority(tid(t), Priority::normal(n)),
                Op::Yield(c) => {
                    sim.sched.yield_thread(c);
                    Ok(())
                }
            };
            assert_conserved(&sim);
        }
        for id in 1..=6 {
            let info = sim.sched.task_info(tid(id)).unwrap();
            prop_assert!(info.priority.nice() >= -5 && info.priority.nice() <= 5);
        }
    }
}

#[derive(Debug, Clone)]
enum QueueOp {
    Step,
    Spawn(u64),
    Exit(u64),
    Block(u64),
    Wake(u64),
    Nice(u64, i8),
    Yield(usize),
}

fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        4 => Just(QueueOp::Step),
        1 => (1..=6u64).prop_map(QueueOp::Spawn),
        1 => (1..=6u64).prop_map(QueueOp::Exit),
        2 => (1..=6u64).prop_map(QueueOp::Block),
        2 => (1..=6u64).prop_map(QueueOp::Wake),
        1 => (1..=6u64, -10..=10i8).prop_map(|(t, n)| QueueOp::Nice(t, n)),
        1 => (0..2usize).prop_map(QueueOp::Yield),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_min_vruntime_never_decreases(ops in proptest::collection::vec(queue_op(), 1..80)) {
        let sim = Sim::cpus(2);
        let g = sim.sched.create_group(ROOT_GROUP).unwrap();
        // Tasks 1..=3 in the root group, 4..=6 in `g`
        let group_of = |t: u64| if t > 3 { g } else { ROOT_GROUP };
        for id in 1..=6 {
            sim.spawn_in(id, 0, group_of(id));
        }

        let mut last: BTreeMap<(usize, GroupId), u64> = BTreeMap::new();
        for op in ops {
            match op {
                QueueOp::Step => sim.step(),
                QueueOp::Spawn(t) => {
                    let _ = sim.sched.wake_up_new_task(&thread(t, 0), Some(group_of(t)));
                }
                QueueOp::Exit(t) => {
                    let _ = sim.sched.remove_thread(tid(t));
                }
                QueueOp::Block(t) => {
                    let _ = sim.sched.thread_block(tid(t));
                }
                QueueOp::Wake(t) => {
                    let _ = sim.sched.thread_ready(tid(t));
                }
                QueueOp::Nice(t, n) => {
                    let _ = sim.sched.set_priority(tid(t), Priority::normal(n));
                }
                QueueOp::Yield(c) => sim.sched.yield_thread(c),
            }
            for cpu in 0..2 {
                for q in sim.sched.debug_snapshot(cpu).unwrap() {
                    if let Some(&prev) = last.get(&(cpu, q.group)) {
                        prop_assert!(
                            !before(q.min_vruntime, prev),
                            "cpu{} group {}: min_vruntime went back from {} to {}",
                            cpu, q.group, prev, q.min_vruntime
                        );
                    }
                    last.insert((cpu, q.group), q.min_vruntime);
                }
            }
        }
    }
}

#[test]
fn test_crowded_cpu_spreads_out() {
    let sim = Sim::cpus(4);
    for id in 1..=8 {
        sim.sched.add_thread(thread(id, 0).with_affinity(0b0001)).unwrap();
    }
    sim.run_for(5 * MS);
    assert_eq!(sim.sched.nr_running(0), 8);

    for id in 1..=8 {
        sim.sched.set_task_affinity(tid(id), CpuMask::first(4)).unwrap();
    }
    sim.run_for(1_000 * MS);
    for cpu in 0..4 {
        let nr = sim.sched.nr_running(cpu);
        assert!((1..=3).contains(&nr), "cpu{} runs {}", cpu, nr);
    }
    assert_conserved(&sim);
}

#[test]
fn test_pinned_task_never_leaves() {
    let sim = Sim::cpus(2);
    sim.sched.add_thread(thread(1, 0).with_affinity(0b10)).unwrap();
    for id in 2..=5 {
        sim.spawn(id, 0);
    }
    let end = sim.now() + 300 * MS;
    while sim.now() < end {
        sim.step();
        assert_eq!(sim.sched.task_info(tid(1)).unwrap().cpu, 1);
    }
    assert_eq!(sim.sched.task_info(tid(1)).unwrap().nr_migrations, 0);
    assert!(sim.runtime(tid(1)) > 0);
}

#[test]
fn test_blocked_tasks_wake_across_cpus() {
    let sim = Sim::cpus(2);
    for id in 1..=4 {
        sim.spawn(id, 0);
    }
    for round in 0..20u64 {
        sim.run_for(7 * MS);
        let victim = tid(round % 4 + 1);
        if sim.sched.thread_block(victim).is_ok() {
            sim.run_for(3 * MS);
            sim.sched.thread_ready(victim).unwrap();
        }
        assert_conserved(&sim);
    }
    let woken: u64 = (1..=4).map(|id| sim.sched.task_info(tid(id)).unwrap().stats.nr_wakeups).sum();
    assert_eq!(woken, 20);
}

// =============================================================================
// Lifecycle and configuration
// =============================================================================

#[test]
fn test_child_runs_first() {
    let fork = |child_first: bool| {
        let sim = Sim::new(CfsConfig::with_cpus(1).with_child_runs_first(child_first));
        let parent = sim.spawn(1, 0);
        sim.run_for(2 * MS);
        assert_eq!(sim.sched.current(0), Some(parent));

        let mut child = thread(2, 0);
        child.parent = Some(parent);
        sim.sched.add_thread(child).unwrap();
        sim.schedule();
        sim.sched.current(0)
    };
    assert_eq!(fork(true), Some(tid(2)));
    assert_eq!(fork(false), Some(tid(1)));
}

#[test]
fn test_tunables_follow_online_cpus() {
    let sim = Sim::cpus(4);
    let tun = sim.sched.tunables();
    assert_eq!(tun.latency_ns, 18 * MS);
    assert_eq!(tun.min_granularity_ns, 2_250_000);
    assert_eq!(tun.wakeup_granularity_ns, 3 * MS);
    assert_eq!(tun.nr_latency, 8);

    sim.sched.set_tunable(Tunable::Latency, 24 * MS).unwrap();
    assert_eq!(sim.sched.tunables().latency_ns, 24 * MS);
    assert_eq!(sim.sched.config().latency_ns, 8 * MS);
    assert_eq!(sim.sched.set_tunable(Tunable::Latency, 50_000), Err(CfsError::InvalidTunable));
    assert_eq!(sim.sched.tunables().latency_ns, 24 * MS);

    // 3 cpus: factor 2
    sim.sched.set_cpu_online(3, false).unwrap();
    assert_eq!(sim.sched.tunables().latency_ns, 16 * MS);
}

#[test]
fn test_offline_cpu_with_throttled_group() {
    let sim = Sim::cpus(2);
    let g = sim.sched.create_group(ROOT_GROUP).unwrap();
    sim.sched.set_group_bandwidth(g, Some(5 * MS), 100 * MS).unwrap();
    sim.sched.add_thread(thread(1, 0).with_affinity(0b10)).unwrap();
    sim.sched.move_task_group(tid(1), g).unwrap();
    sim.run_for(20 * MS);
    assert!(sim.sched.group_bandwidth_stats(g).unwrap().throttled_cpus > 0);

    sim.sched.set_cpu_online(1, false).unwrap();
    let info = sim.sched.task_info(tid(1)).unwrap();
    assert_eq!(info.cpu, 0);
    assert_eq!(info.state, TaskState::Runnable);
    assert_eq!(sim.sched.nr_running(1), 0);
    assert_conserved(&sim);

    // Runs again on cpu0 once the pool refills
    let before = sim.runtime(tid(1));
    sim.run_for(110 * MS);
    let gained = sim.runtime(tid(1)) - before;
    assert!(gained > 0, "no runtime after refill");
    assert!(gained <= 10 * MS, "gained {}", gained);
    assert_eq!(sim.sched.task_info(tid(1)).unwrap().cpu, 0);
    assert_conserved(&sim);
}

#[test]
fn test_framework_drives_scheduler() {
    let sim = Sim::cpus(2);
    let framework = SchedulerFramework::new();
    let sched = crate::install(&framework, CfsConfig::with_cpus(2), sim.host.services()).unwrap();
    assert_eq!(sched.name(), "CFS");

    framework.add_thread(thread(1, 0)).unwrap();
    framework.add_thread(thread(2, 0)).unwrap();
    let picked: Vec<ThreadId> = (0..2).filter_map(|cpu| framework.pick_next(cpu)).collect();
    assert!(!picked.is_empty());
    framework.tick(0);
    framework.thread_block(picked[0]).unwrap();
    framework.thread_ready(picked[0]).unwrap();
    assert_eq!(sched.stats().runnable_threads, 2);
}
