//! Balancing on behalf of idle CPUs.
//!
//! An idle CPU stops balancing for itself. It registers in
//! [`NohzState`] and drops out of the busy count of its last-level-cache
//! group. A busy CPU that notices pending work on its tick kicks one of
//! the idle CPUs, which then balances for all of them.

use super::CfsScheduler;
use crate::rq::CpuIdleType;
use crate::topology::{CpuMask, Topology};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Machine-wide idle balancing state
#[derive(Debug)]
pub struct NohzState {
    idle_mask: AtomicU64,
    nr_cpus: AtomicUsize,
    next_balance: AtomicU64,
    kick: Vec<AtomicBool>,
    sd_idle: Vec<AtomicBool>,
}

impl NohzState {
    /// No CPU idle yet
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            idle_mask: AtomicU64::new(0),
            nr_cpus: AtomicUsize::new(0),
            next_balance: AtomicU64::new(0),
            kick: (0..nr_cpus).map(|_| AtomicBool::new(false)).collect(),
            sd_idle: (0..nr_cpus).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Registered idle CPUs
    #[inline]
    pub fn idle_mask(&self) -> CpuMask {
        CpuMask::from_bits(self.idle_mask.load(Ordering::Acquire))
    }

    /// Number of registered idle CPUs
    #[inline]
    pub fn nr_idle(&self) -> usize {
        self.nr_cpus.load(Ordering::Acquire)
    }

    /// Tick of the next balance on behalf of idle CPUs
    #[inline]
    pub fn next_balance(&self) -> u64 {
        self.next_balance.load(Ordering::Relaxed)
    }

    /// Register `cpu` as idle
    pub fn enter_idle(&self, cpu: usize, topo: &Topology) {
        if cpu >= self.kick.len() {
            return;
        }
        if !self.sd_idle[cpu].swap(true, Ordering::AcqRel) {
            if let Some(sgc) = topo.llc_group(cpu) {
                sgc.nr_busy_cpus.fetch_sub(1, Ordering::AcqRel);
            }
        }
        let bit = 1u64 << cpu;
        if self.idle_mask.fetch_or(bit, Ordering::AcqRel) & bit == 0 {
            self.nr_cpus.fetch_add(1, Ordering::AcqRel);
            log::trace!("[cfs] nohz: cpu{} idle", cpu);
        }
    }

    /// Take `cpu` out of the idle set
    pub fn exit_idle(&self, cpu: usize, topo: &Topology) {
        if cpu >= self.kick.len() {
            return;
        }
        let bit = 1u64 << cpu;
        if self.idle_mask.fetch_and(!bit, Ordering::AcqRel) & bit != 0 {
            self.nr_cpus.fetch_sub(1, Ordering::AcqRel);
            log::trace!("[cfs] nohz: cpu{} busy", cpu);
        }
        if self.sd_idle[cpu].swap(false, Ordering::AcqRel) {
            if let Some(sgc) = topo.llc_group(cpu) {
                sgc.nr_busy_cpus.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Mark `cpu` kicked; false when it already was
    pub fn set_kick(&self, cpu: usize) -> bool {
        self.kick.get(cpu).is_some_and(|k| !k.swap(true, Ordering::AcqRel))
    }

    /// Whether `cpu` was kicked and has not served the kick yet
    #[inline]
    pub fn kicked(&self, cpu: usize) -> bool {
        self.kick.get(cpu).is_some_and(|k| k.load(Ordering::Acquire))
    }

    /// Clear the kick of `cpu`
    pub fn clear_kick(&self, cpu: usize) {
        if let Some(k) = self.kick.get(cpu) {
            k.store(false, Ordering::Release);
        }
    }

    fn bump_next_balance(&self) {
        self.next_balance.fetch_add(1, Ordering::Relaxed);
    }

    fn set_next_balance(&self, next: u64) {
        self.next_balance.store(next, Ordering::Relaxed);
    }

    /// Pull the next balance earlier to `next`
    pub fn pull_next_balance(&self, next: u64) {
        self.next_balance.fetch_min(next, Ordering::Relaxed);
    }
}

impl CfsScheduler {
    /// Whether a busy CPU should kick an idle one to balance
    ///
    /// Called from the tick of `cpu`; also brings `cpu` back into the
    /// busy count if it was registered idle.
    pub fn nohz_kick_needed(&self, cpu: usize, now: u64) -> bool {
        let tun = self.tunables.load();
        let penv = self.placement_env(&tun);
        if penv.idle_cpu(cpu) {
            return false;
        }
        self.nohz.exit_idle(cpu, &self.topology);

        if self.nohz.nr_idle() == 0 || now < self.nohz.next_balance() {
            return false;
        }
        let rq = penv.rq(cpu);
        if rq.nr_running() >= 2 {
            return true;
        }
        if let Some(sgc) = self.topology.llc_group(cpu) {
            if sgc.nr_busy_cpus.load(Ordering::Acquire) > 1 {
                return true;
            }
        }
        match self.topology.domain(cpu, 0) {
            Some(sd) => rq.h_nr_running() >= 1 && super::stats::check_cpu_capacity(&penv, cpu, sd),
            None => false,
        }
    }

    /// Kick the first idle CPU into balancing for all idle CPUs
    pub fn nohz_balancer_kick(&self) {
        self.nohz.bump_next_balance();
        let Some(ilb) = self.nohz.idle_mask().iter().find(|&c| self.shared[c].is_idle()) else {
            return;
        };
        if !self.nohz.set_kick(ilb) {
            return;
        }
        log::debug!("[cfs] nohz: kick cpu{}", ilb);
        self.host.notifier.kick_idle_balance(ilb);
    }

    /// Serve a kick: balance every registered idle CPU whose balance is
    /// due, then `this_cpu` itself
    pub fn nohz_idle_balance(&self, this_cpu: usize) {
        if this_cpu >= self.nr_cpus() {
            return;
        }
        let tun = self.tunables.load();
        let ctx = self.ctx(&tun);
        let now = tun.ticks(self.now());
        let idle = if self.shared[this_cpu].is_idle() { CpuIdleType::Idle } else { CpuIdleType::NotIdle };

        if idle == CpuIdleType::Idle && self.nohz.kicked(this_cpu) {
            let mut next_balance = now + 60 * tun.hz;
            let mut update_next_balance = false;
            for cpu in self.nohz.idle_mask().iter() {
                if cpu == this_cpu || !self.shared[cpu].is_idle() {
                    continue;
                }
                // Work arrived here; whoever is kicked next takes over
                if !self.shared[this_cpu].is_idle() {
                    break;
                }
                if now >= self.shared[cpu].next_balance() {
                    {
                        let mut rq = self.rq(cpu);
                        rq.update_clock(&ctx);
                        rq.update_cpu_load(&ctx);
                    }
                    self.rebalance_domains(cpu, CpuIdleType::Idle, false);
                }
                let next = self.shared[cpu].next_balance();
                if next < next_balance {
                    next_balance = next;
                    update_next_balance = true;
                }
            }
            if update_next_balance {
                self.nohz.set_next_balance(next_balance);
            }
        }
        self.nohz.clear_kick(this_cpu);
        self.rebalance_domains(this_cpu, idle, false);
    }
}
