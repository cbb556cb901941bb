//! # Load Weights
//!
//! Nice levels map to weights through a table where every step is ~1.25x,
//! so one nice level is worth ~10% of CPU between two competing tasks.
//! Virtual time is wall time scaled by `NICE_0_LOAD / weight`, computed
//! with a 32-bit fixed-point reciprocal instead of a division.

use helix_execution::scheduler::{Priority, MIN_NICE, NICE_WIDTH};
use static_assertions::const_assert_eq;

/// Fixed-point shift of load values
pub const SCHED_LOAD_SHIFT: u32 = 10;
/// Weight of a nice-0 task
pub const NICE_0_LOAD: u64 = 1 << SCHED_LOAD_SHIFT;
/// Capacity of a full-speed CPU
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_LOAD_SHIFT;
/// Shift of the reciprocal weight
pub const WMULT_SHIFT: u32 = 32;
/// Numerator of the reciprocal weight
pub const WMULT_CONST: u64 = u32::MAX as u64;

/// Weight of an idle-policy task
pub const WEIGHT_IDLEPRIO: u64 = 3;

/// Nice level to weight, index 0 is nice -20
pub const PRIO_TO_WEIGHT: [u64; NICE_WIDTH] = [
    /* -20 */ 88761, 71755, 56483, 46273, 36291,
    /* -15 */ 29154, 23254, 18705, 14949, 11916,
    /* -10 */ 9548, 7620, 6100, 4904, 3906,
    /*  -5 */ 3121, 2501, 1991, 1586, 1277,
    /*   0 */ 1024, 820, 655, 526, 423,
    /*   5 */ 335, 272, 215, 172, 137,
    /*  10 */ 110, 87, 70, 56, 45,
    /*  15 */ 36, 29, 23, 18, 15,
];

const_assert_eq!(PRIO_TO_WEIGHT[20], NICE_0_LOAD);

/// A weight together with its cached reciprocal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadWeight {
    /// Weight
    pub weight: u64,
    /// `WMULT_CONST / weight`, zero while stale
    inv_weight: u32,
}

impl LoadWeight {
    /// Create a weight with its reciprocal computed
    pub const fn new(weight: u64) -> Self {
        Self { weight, inv_weight: inv_weight_of(weight) }
    }

    /// Weight of a task at `nice`
    pub fn from_nice(nice: i8) -> Self {
        let idx = (nice.clamp(MIN_NICE, MIN_NICE + NICE_WIDTH as i8 - 1) - MIN_NICE) as usize;
        Self::new(PRIO_TO_WEIGHT[idx])
    }

    /// Weight of a task at `priority`
    pub fn from_priority(priority: Priority) -> Self {
        Self::new(PRIO_TO_WEIGHT[priority.nice_index()])
    }

    /// Replace the weight
    pub fn set(&mut self, weight: u64) {
        self.weight = weight;
        self.inv_weight = 0;
    }

    /// Add to the weight
    pub fn add(&mut self, inc: u64) {
        self.weight += inc;
        self.inv_weight = 0;
    }

    /// Subtract from the weight
    pub fn sub(&mut self, dec: u64) {
        assert!(self.weight >= dec, "load weight underflow: {} - {}", self.weight, dec);
        self.weight -= dec;
        self.inv_weight = 0;
    }

    /// Cached reciprocal, refreshing it first if stale
    pub fn inv_weight(&mut self) -> u32 {
        if self.inv_weight == 0 {
            self.inv_weight = inv_weight_of(self.weight);
        }
        self.inv_weight
    }
}

const fn inv_weight_of(weight: u64) -> u32 {
    if weight >= WMULT_CONST {
        1
    } else if weight == 0 {
        WMULT_CONST as u32
    } else {
        (WMULT_CONST / weight) as u32
    }
}

/// `(a * mul) >> shift` without overflowing 64 bits
#[inline]
pub fn mul_u64_u32_shr(a: u64, mul: u32, shift: u32) -> u64 {
    ((a as u128 * mul as u128) >> shift) as u64
}

/// `delta_exec * weight / lw.weight`
///
/// Either `weight == NICE_0_LOAD` with `lw` the entity weight (vruntime
/// scaling), or `weight` is the entity weight and `lw` the queue weight
/// (slice share).
pub fn calc_delta(delta_exec: u64, weight: u64, lw: &LoadWeight) -> u64 {
    let mut lw = *lw;
    let mut fact = weight;
    let mut shift = WMULT_SHIFT;

    while fact >> 32 != 0 {
        fact >>= 1;
        shift -= 1;
    }

    fact = (fact as u32 as u64) * lw.inv_weight() as u64;

    while fact >> 32 != 0 {
        fact >>= 1;
        shift -= 1;
    }

    mul_u64_u32_shr(delta_exec, fact as u32, shift)
}

/// Scale a wall-clock delta into virtual time for an entity of weight `lw`
#[inline]
pub fn calc_delta_fair(delta: u64, lw: &LoadWeight) -> u64 {
    if lw.weight != NICE_0_LOAD {
        calc_delta(delta, NICE_0_LOAD, lw)
    } else {
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nice_zero_is_identity() {
        let lw = LoadWeight::from_nice(0);
        assert_eq!(lw.weight, NICE_0_LOAD);
        assert_eq!(calc_delta_fair(3_000_000, &lw), 3_000_000);
    }

    #[test]
    fn test_heavier_entities_age_slower() {
        let heavy = LoadWeight::from_nice(-5);
        let light = LoadWeight::from_nice(5);
        let d = 1_000_000;
        let vh = calc_delta_fair(d, &heavy);
        let vl = calc_delta_fair(d, &light);
        assert!(vh < d);
        assert!(vl > d);
        // 1024/3121 and 1024/335, within fixed-point rounding
        assert!((vh as i64 - 328_099).abs() < 100, "{}", vh);
        assert!((vl as i64 - 3_056_716).abs() < 1_000, "{}", vl);
    }

    #[test]
    fn test_slice_share() {
        let mut queue = LoadWeight::new(0);
        queue.add(1024);
        queue.add(1024);
        let share = calc_delta(6_000_000, 1024, &queue);
        assert!((share as i64 - 3_000_000).abs() < 10);
    }

    #[test]
    fn test_adjacent_nice_levels_differ_by_a_quarter() {
        for pair in PRIO_TO_WEIGHT.windows(2) {
            let ratio = pair[0] * 100 / pair[1];
            assert!((120..=130).contains(&ratio), "{:?} -> {}", pair, ratio);
        }
    }

    #[test]
    fn test_degenerate_weights() {
        let zero = LoadWeight::new(0);
        // A weightless queue behaves as weight 1
        assert_eq!(calc_delta(1000, 1, &zero), 999);
        let mut lw = LoadWeight::new(1024);
        lw.sub(1024);
        assert_eq!(lw.weight, 0);
    }
}
