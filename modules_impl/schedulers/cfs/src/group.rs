//! # Task Groups
//!
//! A group shares its weight among its per-CPU queues in proportion to
//! their load, and optionally caps its total runtime per period. The
//! table is read-mostly; per-CPU queues and entities of a group live in
//! the run queues and point back here.

use crate::bandwidth::{to_ratio, CfsBandwidth, RUNTIME_INF_RATIO};
use crate::entity::{GroupId, ROOT_GROUP};
use crate::error::{CfsError, CfsResult};
use crate::weight::NICE_0_LOAD;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use hashbrown::HashMap;
use spin::{Mutex, RwLock};

/// Smallest weight a group entity can carry
pub const MIN_SHARES: u64 = 2;
/// Largest configurable group weight
pub const MAX_SHARES: u64 = 1 << 18;
/// Deepest supported group nesting
pub const MAX_GROUP_DEPTH: usize = 32;

/// Per-CPU figures of a group, published by the owning CPU
#[derive(Debug, Default)]
pub struct GroupCpuState {
    /// Queue `avg.load_avg`
    pub cfs_load_avg: AtomicU64,
    /// Queue `tg_load_avg_contrib`
    pub load_avg_contrib: AtomicU64,
    /// Group entity `avg.load_avg`
    pub se_load_avg: AtomicU64,
    /// Queue `throttle_count`
    pub throttle_count: AtomicU32,
}

/// A task group
#[derive(Debug)]
pub struct TaskGroup {
    /// Id
    pub id: GroupId,
    /// Parent, `None` for the root
    pub parent: Option<Arc<TaskGroup>>,
    /// Distance from the root
    pub depth: u32,
    /// Child group ids
    pub children: RwLock<Vec<GroupId>>,
    shares: AtomicU64,
    /// Sum of the per-CPU queue contributions
    pub load_avg: AtomicI64,
    /// Runtime pool
    pub bandwidth: Mutex<CfsBandwidth>,
    /// Per-CPU published state
    pub per_cpu: Vec<GroupCpuState>,
    /// Tasks attached to the group
    pub nr_tasks: AtomicUsize,
    /// Set once the group is being destroyed
    pub dying: AtomicBool,
}

impl TaskGroup {
    fn new(id: GroupId, parent: Option<Arc<TaskGroup>>, nr_cpus: usize) -> Self {
        let depth = parent.as_ref().map_or(0, |p| p.depth + 1);
        Self {
            id,
            parent,
            depth,
            children: RwLock::new(Vec::new()),
            shares: AtomicU64::new(NICE_0_LOAD),
            load_avg: AtomicI64::new(0),
            bandwidth: Mutex::new(CfsBandwidth::new()),
            per_cpu: (0..nr_cpus).map(|_| GroupCpuState::default()).collect(),
            nr_tasks: AtomicUsize::new(0),
            dying: AtomicBool::new(false),
        }
    }

    /// Whether this is the root group
    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Configured weight
    #[inline]
    pub fn shares(&self) -> u64 {
        self.shares.load(Ordering::Relaxed)
    }

    /// Group-wide load average
    #[inline]
    pub fn load_avg(&self) -> i64 {
        self.load_avg.load(Ordering::Acquire)
    }

    /// Whether the group is throttled on `cpu`, directly or through an
    /// ancestor
    #[inline]
    pub fn throttled_on(&self, cpu: usize) -> bool {
        self.per_cpu
            .get(cpu)
            .is_some_and(|s| s.throttle_count.load(Ordering::Acquire) > 0)
    }

    /// Whether `self` is `other` or one of its descendants
    pub fn is_descendant_of(&self, other: GroupId) -> bool {
        let mut tg = Some(self);
        while let Some(g) = tg {
            if g.id == other {
                return true;
            }
            tg = g.parent.as_deref();
        }
        false
    }

    /// Ancestors from the root down to `self`
    pub fn path(self: &Arc<Self>) -> arrayvec::ArrayVec<Arc<TaskGroup>, MAX_GROUP_DEPTH> {
        let mut path = arrayvec::ArrayVec::new();
        let mut tg = Some(self.clone());
        while let Some(g) = tg {
            tg = g.parent.clone();
            path.push(g);
        }
        path.reverse();
        path
    }
}

/// All task groups
#[derive(Debug)]
pub struct GroupTable {
    root: Arc<TaskGroup>,
    groups: RwLock<HashMap<GroupId, Arc<TaskGroup>>>,
    next_id: AtomicU64,
    nr_cpus: usize,
}

impl GroupTable {
    /// Table holding only the root group
    pub fn new(nr_cpus: usize) -> Self {
        let root = Arc::new(TaskGroup::new(ROOT_GROUP, None, nr_cpus));
        let mut groups = HashMap::new();
        groups.insert(ROOT_GROUP, root.clone());
        Self { root, groups: RwLock::new(groups), next_id: AtomicU64::new(ROOT_GROUP + 1), nr_cpus }
    }

    /// Root group
    pub fn root(&self) -> Arc<TaskGroup> {
        self.root.clone()
    }

    /// Look up a group
    pub fn get(&self, id: GroupId) -> CfsResult<Arc<TaskGroup>> {
        self.groups.read().get(&id).cloned().ok_or(CfsError::GroupNotFound)
    }

    /// Number of groups, root included
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    /// Whether only the root exists
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// All groups, parents before children
    pub fn all(&self) -> Vec<Arc<TaskGroup>> {
        let mut all: Vec<_> = self.groups.read().values().cloned().collect();
        all.sort_by_key(|g| (g.depth, g.id));
        all
    }

    /// Allocate a child of `parent`
    pub fn create(&self, parent: GroupId) -> CfsResult<Arc<TaskGroup>> {
        let parent = self.get(parent)?;
        if parent.depth as usize + 1 >= MAX_GROUP_DEPTH {
            return Err(CfsError::InvalidTopology);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tg = Arc::new(TaskGroup::new(id, Some(parent.clone()), self.nr_cpus));
        parent.children.write().push(id);
        self.groups.write().insert(id, tg.clone());
        Ok(tg)
    }

    /// Unlink an empty group
    pub fn remove(&self, id: GroupId) -> CfsResult<Arc<TaskGroup>> {
        if id == ROOT_GROUP {
            return Err(CfsError::RootGroup);
        }
        let tg = self.get(id)?;
        if !tg.children.read().is_empty() || tg.nr_tasks.load(Ordering::Acquire) != 0 {
            return Err(CfsError::GroupBusy);
        }
        if let Some(parent) = &tg.parent {
            parent.children.write().retain(|&c| c != id);
        }
        self.groups.write().remove(&id);
        Ok(tg)
    }

    /// Set the weight of a group
    pub fn set_shares(&self, id: GroupId, shares: u64) -> CfsResult<Arc<TaskGroup>> {
        if id == ROOT_GROUP {
            return Err(CfsError::RootGroup);
        }
        if !(MIN_SHARES..=MAX_SHARES).contains(&shares) {
            return Err(CfsError::InvalidShares);
        }
        let tg = self.get(id)?;
        tg.shares.store(shares, Ordering::Relaxed);
        Ok(tg)
    }

    /// Check that giving `target` the quota/period pair keeps every group
    /// in its subtree within its parent's ratio
    pub fn check_schedulable(&self, target: GroupId, quota: Option<u64>, period: u64) -> CfsResult<()> {
        let tg = self.get(target)?;
        let ratio_of = |g: &TaskGroup| -> u64 {
            if g.id == target {
                quota.map_or(RUNTIME_INF_RATIO, |q| to_ratio(period, q))
            } else {
                let b = g.bandwidth.lock();
                b.quota.map_or(RUNTIME_INF_RATIO, |q| to_ratio(b.period, q))
            }
        };

        // Effective limit inherited by the target
        let mut parent_ratio = RUNTIME_INF_RATIO;
        for g in tg.path().iter().take(tg.depth as usize) {
            if g.is_root() {
                continue;
            }
            let r = ratio_of(g);
            if r != RUNTIME_INF_RATIO {
                parent_ratio = r;
            }
        }

        let mut stack: Vec<(Arc<TaskGroup>, u64)> = Vec::new();
        stack.push((tg, parent_ratio));
        while let Some((g, parent_ratio)) = stack.pop() {
            let mut ratio = ratio_of(&g);
            if ratio == RUNTIME_INF_RATIO {
                ratio = parent_ratio;
            } else if parent_ratio != RUNTIME_INF_RATIO && ratio > parent_ratio {
                return Err(CfsError::QuotaTooLarge);
            }
            for child in g.children.read().iter() {
                if let Ok(c) = self.get(*child) {
                    stack.push((c, ratio));
                }
            }
        }
        Ok(())
    }
}
