//! # Completely Fair Scheduler Module
//!
//! A weighted fair-share CPU scheduler for Helix.
//!
//! ## Features
//! - Virtual-runtime ordering: every runnable task gets CPU time in
//!   proportion to its weight (derived from its nice level)
//! - Hierarchical task groups with per-group shares
//! - Bandwidth control: per-group quota over a period, enforced by
//!   throttling
//! - Per-entity load tracking (decayed load and utilization)
//! - Per-CPU run queues with domain-based load balancing, idle balancing
//!   and balancing on behalf of tickless idle CPUs
//! - Pluggable wakeup placement (load-driven, capacity-aware, NUMA)
//!
//! ## Usage
//!
//! The host builds a [`CfsScheduler`] from a [`CfsConfig`] and its
//! [`HostServices`](helix_execution::scheduler::HostServices), then
//! drives it through the [`Scheduler`](helix_execution::scheduler::Scheduler)
//! trait. [`install`] does both and registers the scheduler and its load
//! balancer with the execution framework.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod balance;
pub mod bandwidth;
pub mod cfs_rq;
pub mod config;
pub mod entity;
pub mod error;
pub mod fair;
pub mod group;
pub mod load;
pub mod pelt;
pub mod placement;
pub mod rq;
pub mod scheduler;
pub mod task;
pub mod timeline;
pub mod topology;
pub mod vtime;
pub mod weight;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod scenario_tests;

pub use bandwidth::BandwidthStats;
pub use cfs_rq::CfsRqSnapshot;
pub use config::{CfsConfig, ScalingPolicy, Tunable, Tunables};
pub use entity::{GroupId, ROOT_GROUP};
pub use error::{CfsError, CfsResult};
pub use placement::{PlacementKind, PlacementPolicy};
pub use scheduler::{CfsScheduler, TaskInfo};
pub use task::{TaskPolicy, TaskState};
pub use topology::{CpuMask, TopologySpec};

use alloc::sync::Arc;
use helix_execution::scheduler::{HostServices, SchedulerFramework};

/// Build a scheduler and make it the framework's scheduler and load
/// balancer
pub fn install(framework: &SchedulerFramework, config: CfsConfig, host: HostServices) -> CfsResult<Arc<CfsScheduler>> {
    let sched = Arc::new(CfsScheduler::new(config, host)?);
    framework.set_scheduler(sched.clone());
    framework.set_load_balancer(sched.clone());
    log::info!("[cfs] installed as {} scheduler", sched.placement_name());
    Ok(sched)
}
