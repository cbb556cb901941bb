//! # Per-Entity Load Tracking
//!
//! Runnable and running history is kept as a geometric series over
//! ~1ms (1024ns-unit) periods, with `y^32 = 0.5`:
//!
//! ```text
//! load = u_0 + u_1*y + u_2*y^2 + ...
//! ```
//!
//! Rolling a period over is a multiplication of the old sum by `y`, and
//! skipping `n` periods is `y^n`, computed with a 32-entry table plus a
//! shift per 32 periods. The sum of a full series saturates at
//! [`LOAD_AVG_MAX`].

use crate::weight::{mul_u64_u32_shr, SCHED_CAPACITY_SCALE, SCHED_LOAD_SHIFT};
use core::sync::atomic::{fence, AtomicI64, AtomicU64, Ordering};
use static_assertions::const_assert_eq;

/// Periods for the series to halve
pub const LOAD_AVG_PERIOD: u32 = 32;
/// Maximum possible load sum
pub const LOAD_AVG_MAX: u64 = 47742;
/// Number of full periods that produce [`LOAD_AVG_MAX`]
pub const LOAD_AVG_MAX_N: u32 = 345;

/// `y^n * 2^32` for `n` in `0..32`
const RUNNABLE_AVG_YN_INV: [u32; LOAD_AVG_PERIOD as usize] = [
    0xffffffff, 0xfa83b2da, 0xf5257d14, 0xefe4b99a, 0xeac0c6e6, 0xe5b906e6,
    0xe0ccdeeb, 0xdbfbb796, 0xd744fcc9, 0xd2a81d91, 0xce248c14, 0xc9b9bd85,
    0xc5672a10, 0xc12c4cc9, 0xbd08a39e, 0xb8fbaf46, 0xb504f333, 0xb123f581,
    0xad583ee9, 0xa9a15ab4, 0xa5fed6a9, 0xa2704302, 0x9ef5325f, 0x9b8d39b9,
    0x9837f050, 0x94f4efa8, 0x91c3d373, 0x8ea4398a, 0x8b95c1e3, 0x88980e80,
    0x85aac367, 0x82cd8698,
];

/// `sum(1024 * y^k, k = 1..=n)` for `n` in `0..=32`
const RUNNABLE_AVG_YN_SUM: [u32; LOAD_AVG_PERIOD as usize + 1] = [
    0, 1002, 1982, 2941, 3880, 4798, 5697, 6576, 7437, 8279, 9103,
    9909, 10698, 11470, 12226, 12966, 13690, 14398, 15091, 15769, 16433,
    17082, 17718, 18340, 18949, 19545, 20128, 20698, 21256, 21802, 22336,
    22859, 23371,
];

const_assert_eq!(RUNNABLE_AVG_YN_INV.len(), 32);
const_assert_eq!(RUNNABLE_AVG_YN_SUM.len(), 33);

/// `val * y^n`
pub fn decay_load(mut val: u64, n: u64) -> u64 {
    if n == 0 {
        return val;
    }
    if n > (LOAD_AVG_PERIOD * 63) as u64 {
        return 0;
    }

    let mut local_n = n as u32;
    if local_n >= LOAD_AVG_PERIOD {
        val >>= local_n / LOAD_AVG_PERIOD;
        local_n %= LOAD_AVG_PERIOD;
    }

    mul_u64_u32_shr(val, RUNNABLE_AVG_YN_INV[local_n as usize], 32)
}

/// `sum(1024 * y^k, k = 1..=n)`
pub fn compute_runnable_contrib(mut n: u64) -> u64 {
    if n <= LOAD_AVG_PERIOD as u64 {
        return RUNNABLE_AVG_YN_SUM[n as usize] as u64;
    }
    if n >= LOAD_AVG_MAX_N as u64 {
        return LOAD_AVG_MAX;
    }

    let mut contrib: u64 = 0;
    loop {
        // y^LOAD_AVG_PERIOD = 1/2
        contrib /= 2;
        contrib += RUNNABLE_AVG_YN_SUM[LOAD_AVG_PERIOD as usize] as u64;
        n -= LOAD_AVG_PERIOD as u64;
        if n <= LOAD_AVG_PERIOD as u64 {
            break;
        }
    }
    contrib = decay_load(contrib, n);
    contrib + RUNNABLE_AVG_YN_SUM[n as usize] as u64
}

#[inline]
fn cap_scale(v: u64, s: u64) -> u64 {
    (v * s) >> SCHED_LOAD_SHIFT
}

/// Decayed load and utilization sample of an entity or a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedAvg {
    /// Clock value of the last update, 0 when never attached
    pub last_update_time: u64,
    /// Weighted runnable sum
    pub load_sum: u64,
    /// Running sum scaled by CPU capacity
    pub util_sum: u64,
    /// Part of the current period already accounted
    pub period_contrib: u32,
    /// `load_sum / LOAD_AVG_MAX`
    pub load_avg: u64,
    /// `util_sum / LOAD_AVG_MAX`
    pub util_avg: u64,
}

impl SchedAvg {
    /// Initial sample of a new entity of weight `weight`
    ///
    /// A fresh task is assumed fully loaded so that it is not ignored by
    /// the balancer before it has built up history.
    pub fn new_entity(weight: u64) -> Self {
        let load_avg = weight;
        let util_avg = SCHED_CAPACITY_SCALE;
        Self {
            last_update_time: 0,
            // Just under a full period, so the first update decays
            period_contrib: 1023,
            load_avg,
            load_sum: load_avg * LOAD_AVG_MAX,
            util_avg,
            util_sum: util_avg * LOAD_AVG_MAX,
        }
    }

    /// Advance the sample to `now`
    ///
    /// `weight` is the weight while runnable (0 when blocked), `running`
    /// whether the owner was on the CPU. For a queue sample, `runnable`
    /// receives the same weighted contribution restricted to queued
    /// entities. Returns whether a period boundary was crossed.
    pub fn update(
        &mut self,
        now: u64,
        weight: u64,
        running: bool,
        mut runnable: Option<&mut RunnableAvg>,
        scale: CapacityScale,
    ) -> bool {
        if now < self.last_update_time {
            // Clock went backwards; resync without accruing
            self.last_update_time = now;
            return false;
        }

        let mut delta = (now - self.last_update_time) >> 10;
        if delta == 0 {
            return false;
        }
        self.last_update_time = now;

        let mut decayed = false;
        let delta_w = self.period_contrib as u64;
        if delta + delta_w >= 1024 {
            decayed = true;
            self.period_contrib = 0;

            // Complete the period in progress
            let delta_w = 1024 - delta_w;
            let scaled_delta_w = cap_scale(delta_w, scale.freq);
            if weight != 0 {
                self.load_sum += weight * scaled_delta_w;
                if let Some(r) = runnable.as_deref_mut() {
                    r.sum += weight * scaled_delta_w;
                }
            }
            if running {
                self.util_sum += scaled_delta_w * scale.cpu;
            }

            delta -= delta_w;

            let periods = delta / 1024;
            delta %= 1024;

            self.load_sum = decay_load(self.load_sum, periods + 1);
            if let Some(r) = runnable.as_deref_mut() {
                r.sum = decay_load(r.sum, periods + 1);
            }
            self.util_sum = decay_load(self.util_sum, periods + 1);

            let contrib = cap_scale(compute_runnable_contrib(periods), scale.freq);
            if weight != 0 {
                self.load_sum += weight * contrib;
                if let Some(r) = runnable.as_deref_mut() {
                    r.sum += weight * contrib;
                }
            }
            if running {
                self.util_sum += contrib * scale.cpu;
            }
        }

        // Remainder accrues against the new current period
        let scaled_delta = cap_scale(delta, scale.freq);
        if weight != 0 {
            self.load_sum += weight * scaled_delta;
            if let Some(r) = runnable.as_deref_mut() {
                r.sum += weight * scaled_delta;
            }
        }
        if running {
            self.util_sum += scaled_delta * scale.cpu;
        }

        self.period_contrib += delta as u32;

        if decayed {
            self.load_avg = self.load_sum / LOAD_AVG_MAX;
            if let Some(r) = runnable {
                r.avg = r.sum / LOAD_AVG_MAX;
            }
            self.util_avg = self.util_sum / LOAD_AVG_MAX;
        }

        decayed
    }

    /// Age the sample to `now` as if it had been blocked
    pub fn age(&mut self, now: u64) {
        self.update(now, 0, false, None, CapacityScale::FULL);
    }

    /// Add another sample's contribution
    pub fn attach(&mut self, other: &SchedAvg) {
        self.load_avg += other.load_avg;
        self.load_sum += other.load_sum;
        self.util_avg += other.util_avg;
        self.util_sum += other.util_sum;
    }

    /// Remove another sample's contribution, clamping at zero
    pub fn detach(&mut self, other: &SchedAvg) {
        sub_positive(&mut self.load_avg, other.load_avg);
        sub_positive(&mut self.load_sum, other.load_sum);
        sub_positive(&mut self.util_avg, other.util_avg);
        sub_positive(&mut self.util_sum, other.util_sum);
    }
}

/// Runnable-only load of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnableAvg {
    /// Weighted runnable sum of queued entities
    pub sum: u64,
    /// `sum / LOAD_AVG_MAX`
    pub avg: u64,
}

impl RunnableAvg {
    /// Add an entity's contribution on enqueue
    pub fn add(&mut self, sa: &SchedAvg) {
        self.avg += sa.load_avg;
        self.sum += sa.load_sum;
    }

    /// Remove an entity's contribution on dequeue, clamping at zero
    pub fn sub(&mut self, sa: &SchedAvg) {
        sub_positive(&mut self.avg, sa.load_avg);
        sub_positive(&mut self.sum, sa.load_sum);
    }
}

/// Frequency and micro-architectural capacity of the CPU being accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityScale {
    /// Current frequency relative to max, out of 1024
    pub freq: u64,
    /// CPU capacity relative to the biggest CPU, out of 1024
    pub cpu: u64,
}

impl CapacityScale {
    /// Full-speed, full-size CPU
    pub const FULL: Self = Self { freq: SCHED_CAPACITY_SCALE, cpu: SCHED_CAPACITY_SCALE };
}

impl Default for CapacityScale {
    fn default() -> Self {
        Self::FULL
    }
}

/// Unsigned subtract clamped at zero
#[inline]
pub fn sub_positive(var: &mut u64, val: u64) {
    *var = var.saturating_sub(val);
}

/// Load removed from a queue by CPUs that do not hold its lock
///
/// Writers add, the owner drains with a swap under its own lock.
#[derive(Debug, Default)]
pub struct RemovedLoad {
    load_avg: AtomicI64,
    util_avg: AtomicI64,
}

impl RemovedLoad {
    /// Create an empty accumulator
    pub const fn new() -> Self {
        Self { load_avg: AtomicI64::new(0), util_avg: AtomicI64::new(0) }
    }

    /// Record a departed entity's contribution
    pub fn add(&self, sa: &SchedAvg) {
        self.load_avg.fetch_add(sa.load_avg as i64, Ordering::AcqRel);
        self.util_avg.fetch_add(sa.util_avg as i64, Ordering::AcqRel);
    }

    /// Apply pending removals to `sa`; returns whether any load was removed
    pub fn drain_into(&self, sa: &mut SchedAvg) -> bool {
        let mut removed = false;
        if self.load_avg.load(Ordering::Acquire) != 0 {
            let r = self.load_avg.swap(0, Ordering::AcqRel).max(0) as u64;
            sub_positive(&mut sa.load_avg, r);
            sub_positive(&mut sa.load_sum, r * LOAD_AVG_MAX);
            removed = true;
        }
        if self.util_avg.load(Ordering::Acquire) != 0 {
            let r = self.util_avg.swap(0, Ordering::AcqRel).max(0) as u64;
            sub_positive(&mut sa.util_avg, r);
            sub_positive(&mut sa.util_sum, r * LOAD_AVG_MAX);
        }
        removed
    }

    /// Pending removed load, for diagnostics
    pub fn pending_load(&self) -> i64 {
        self.load_avg.load(Ordering::Relaxed)
    }
}

/// A 64-bit value with a shadow copy, readable without the writer's lock
///
/// The writer stores the value, fences, then stores the copy. Readers
/// load the copy, fence, load the value, and retry until both agree, so
/// a half-written update is never observed on targets where 64-bit
/// stores tear.
#[derive(Debug, Default)]
pub struct SeqCopy {
    value: AtomicU64,
    copy: AtomicU64,
}

impl SeqCopy {
    /// Create with an initial value
    pub const fn new(v: u64) -> Self {
        Self { value: AtomicU64::new(v), copy: AtomicU64::new(v) }
    }

    /// Publish a new value (owner only)
    pub fn store(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
        fence(Ordering::Release);
        self.copy.store(v, Ordering::Relaxed);
    }

    /// Read a consistent value
    pub fn load(&self) -> u64 {
        loop {
            let copy = self.copy.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            let value = self.value.load(Ordering::Relaxed);
            if value == copy {
                return value;
            }
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn test_decay_halves_every_32_periods() {
        let v = 1u64 << 20;
        let half = decay_load(v, 32);
        assert!((half as i64 - (v / 2) as i64).abs() <= 1, "{}", half);
        let quarter = decay_load(v, 64);
        assert!((quarter as i64 - (v / 4) as i64).abs() <= 1);
        assert_eq!(decay_load(v, 0), v);
        assert_eq!(decay_load(u64::MAX, 32 * 63 + 1), 0);
    }

    #[test]
    fn test_runnable_contrib_saturates() {
        assert_eq!(compute_runnable_contrib(0), 0);
        assert_eq!(compute_runnable_contrib(1), 1002);
        assert_eq!(compute_runnable_contrib(32), 23371);
        assert_eq!(compute_runnable_contrib(LOAD_AVG_MAX_N as u64), LOAD_AVG_MAX);
        let mid = compute_runnable_contrib(100);
        assert!(mid > 23371 && mid < LOAD_AVG_MAX);
    }

    #[test]
    fn test_always_running_converges_to_weight() {
        let mut sa = SchedAvg::default();
        let mut now = 0;
        for _ in 0..1000 {
            now += MS;
            sa.update(now, 1024, true, None, CapacityScale::FULL);
        }
        assert!(sa.load_avg > 1000 && sa.load_avg <= 1024, "{}", sa.load_avg);
        assert!(sa.util_avg > 1000 && sa.util_avg <= 1024, "{}", sa.util_avg);
    }

    #[test]
    fn test_half_duty_cycle() {
        let mut sa = SchedAvg::default();
        let mut now = 0;
        for i in 0..2000 {
            now += MS;
            let running = i % 2 == 0;
            sa.update(now, if running { 1024 } else { 0 }, running, None, CapacityScale::FULL);
        }
        assert!(sa.load_avg > 400 && sa.load_avg < 620, "{}", sa.load_avg);
    }

    #[test]
    fn test_blocked_load_decays() {
        let mut sa = SchedAvg::new_entity(1024);
        sa.last_update_time = 1;
        sa.age(1 + 32 * 1024 * 1024);
        assert!(sa.load_avg < 540 && sa.load_avg > 480, "{}", sa.load_avg);
    }

    #[test]
    fn test_runnable_tracks_queue() {
        let mut sa = SchedAvg::default();
        let mut r = RunnableAvg::default();
        let mut now = 0;
        for _ in 0..400 {
            now += MS;
            sa.update(now, 2048, true, Some(&mut r), CapacityScale::FULL);
        }
        assert_eq!(r.sum, sa.load_sum);
        assert_eq!(r.avg, sa.load_avg);
    }

    #[test]
    fn test_clock_backwards_is_ignored() {
        let mut sa = SchedAvg::default();
        sa.update(10 * MS, 1024, true, None, CapacityScale::FULL);
        let before = sa;
        assert!(!sa.update(5 * MS, 1024, true, None, CapacityScale::FULL));
        assert_eq!(sa.load_sum, before.load_sum);
        assert_eq!(sa.last_update_time, 5 * MS);
    }

    #[test]
    fn test_removed_load_clamps() {
        let removed = RemovedLoad::new();
        let mut queue = SchedAvg { load_avg: 100, load_sum: 100 * LOAD_AVG_MAX, ..Default::default() };
        let gone = SchedAvg { load_avg: 300, util_avg: 5, ..Default::default() };
        removed.add(&gone);
        assert!(removed.drain_into(&mut queue));
        assert_eq!(queue.load_avg, 0);
        assert_eq!(queue.load_sum, 0);
        assert!(!removed.drain_into(&mut queue));
    }

    #[test]
    fn test_seq_copy() {
        let v = SeqCopy::new(7);
        assert_eq!(v.load(), 7);
        v.store(u64::MAX - 3);
        assert_eq!(v.load(), u64::MAX - 3);
    }

    proptest! {
        #[test]
        fn prop_decay_never_grows(val in 0u64..(1u64 << 40), n in 0u64..3000) {
            prop_assert!(decay_load(val, n) <= val);
        }

        #[test]
        fn prop_load_avg_bounded_by_weight(steps in proptest::collection::vec((1u64..5_000_000, any::<bool>()), 1..200)) {
            let mut sa = SchedAvg::default();
            let mut now = 0;
            for (dt, runnable) in steps {
                now += dt;
                sa.update(now, if runnable { 1024 } else { 0 }, runnable, None, CapacityScale::FULL);
                prop_assert!(sa.load_avg <= 1024);
                prop_assert!(sa.util_avg <= 1024);
            }
        }
    }
}
