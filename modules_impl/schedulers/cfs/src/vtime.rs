//! # Virtual Time
//!
//! Vruntime is a wrapping `u64`; two values are only ever compared through
//! their signed difference, so a queue keeps working when its clock wraps.

use crate::config::Tunables;

/// Signed distance `a - b` between two vruntimes
#[inline]
pub fn vdiff(a: u64, b: u64) -> i64 {
    a.wrapping_sub(b) as i64
}

/// The later of two vruntimes
#[inline]
pub fn max_vruntime(max: u64, v: u64) -> u64 {
    if vdiff(v, max) > 0 { v } else { max }
}

/// The earlier of two vruntimes
#[inline]
pub fn min_vruntime(min: u64, v: u64) -> u64 {
    if vdiff(v, min) < 0 { v } else { min }
}

/// Whether `a` runs before `b`
#[inline]
pub fn before(a: u64, b: u64) -> bool {
    vdiff(a, b) < 0
}

/// Starting `min_vruntime` of a fresh queue
///
/// Just below the wrap point, so wrap handling is exercised early.
pub const INITIAL_MIN_VRUNTIME: u64 = (-(1i64 << 20)) as u64;

/// Length of one scheduling period for `nr_running` entities
///
/// The target latency, stretched linearly once the entities would get
/// less than `min_granularity` each.
pub fn sched_period(nr_running: u64, tunables: &Tunables) -> u64 {
    if nr_running > tunables.nr_latency {
        nr_running * tunables.min_granularity_ns
    } else {
        tunables.latency_ns
    }
}
