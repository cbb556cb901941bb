//! # Scheduling Entities
//!
//! Entities and queues of one CPU live in arenas owned by that CPU's run
//! queue and refer to each other by index. A task's entity moves between
//! arenas when the task changes CPU; a group's entities never move.

use crate::pelt::SchedAvg;
use crate::timeline::TimelineKey;
use crate::weight::LoadWeight;
use alloc::vec::Vec;
use core::ops::{Index, IndexMut};
use helix_execution::ThreadId;

/// Identifier of a task group
pub type GroupId = u64;

/// The root group every task starts in
pub const ROOT_GROUP: GroupId = 0;

/// Index of an entity in its run queue's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(u32);

impl EntityId {
    /// Build from a raw arena index
    pub const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Raw arena index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a fair queue in its run queue's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CfsRqId(u32);

impl CfsRqId {
    /// The top-level queue of a CPU
    pub const ROOT: Self = Self(0);

    /// Build from a raw arena index
    pub const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Raw arena index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Slot arena with free-list reuse
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    /// Create an empty arena
    pub const fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    /// Store a value, returning its index
    pub fn insert(&mut self, value: T) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    /// Take a value out, freeing its slot
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take()?;
        self.free.push(index);
        Some(value)
    }

    /// Borrow a value
    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    /// Mutably borrow a value
    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Whether the arena holds nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over live values with their indices
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }
}

impl<T> Index<usize> for Arena<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(v) => v,
            None => panic!("stale arena index {}", index),
        }
    }
}

impl<T> IndexMut<usize> for Arena<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        match self.get_mut(index) {
            Some(v) => v,
            None => panic!("stale arena index {}", index),
        }
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// What an entity stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOwner {
    /// A task
    Task(ThreadId),
    /// A group's presence on this CPU
    Group(GroupId),
}

/// Per-entity scheduling statistics
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityStats {
    pub wait_start: u64,
    pub wait_max: u64,
    pub wait_count: u64,
    pub wait_sum: u64,
    pub sleep_start: u64,
    pub sleep_max: u64,
    pub block_start: u64,
    pub block_max: u64,
    pub exec_max: u64,
    pub slice_max: u64,
    pub nr_migrations_cold: u64,
    pub nr_failed_migrations_affine: u64,
    pub nr_failed_migrations_running: u64,
    pub nr_failed_migrations_hot: u64,
    pub nr_forced_migrations: u64,
    pub nr_wakeups: u64,
    pub nr_wakeups_sync: u64,
    pub nr_wakeups_migrate: u64,
    pub nr_wakeups_local: u64,
    pub nr_wakeups_remote: u64,
    pub nr_wakeups_affine: u64,
    pub nr_wakeups_affine_attempts: u64,
}

/// A schedulable entity
#[derive(Debug, Clone)]
pub struct Entity {
    /// Task or group
    pub owner: EntityOwner,
    /// Weight used to scale virtual time
    pub load: LoadWeight,
    /// Position in the queue's timeline while queued and not running
    pub run_node: Option<TimelineKey>,
    /// Counted in its queue
    pub on_rq: bool,
    /// Task-clock value when accounting last ran
    pub exec_start: u64,
    /// Total wall-clock runtime
    pub sum_exec_runtime: u64,
    /// `sum_exec_runtime` when the entity was last picked
    pub prev_sum_exec_runtime: u64,
    /// Virtual runtime
    pub vruntime: u64,
    /// Number of CPU changes
    pub nr_migrations: u64,
    /// Distance from the root queue
    pub depth: u32,
    /// Group entity owning the queue this entity is in
    pub parent: Option<EntityId>,
    /// Queue this entity is in
    pub cfs_rq: CfsRqId,
    /// Queue owned by this entity, for groups
    pub my_q: Option<CfsRqId>,
    /// Decayed load sample
    pub avg: SchedAvg,
    /// Statistics
    pub stats: EntityStats,
}

impl Entity {
    /// Fresh entity of `weight`, not attached to any queue yet
    pub fn new(owner: EntityOwner, weight: u64, cfs_rq: CfsRqId) -> Self {
        Self {
            owner,
            load: LoadWeight::new(weight),
            run_node: None,
            on_rq: false,
            exec_start: 0,
            sum_exec_runtime: 0,
            prev_sum_exec_runtime: 0,
            vruntime: 0,
            nr_migrations: 0,
            depth: 0,
            parent: None,
            cfs_rq,
            my_q: None,
            avg: SchedAvg::new_entity(weight),
            stats: EntityStats::default(),
        }
    }

    /// Whether this entity is a task
    #[inline]
    pub fn is_task(&self) -> bool {
        matches!(self.owner, EntityOwner::Task(_))
    }

    /// Task id, for task entities
    #[inline]
    pub fn task(&self) -> Option<ThreadId> {
        match self.owner {
            EntityOwner::Task(id) => Some(id),
            EntityOwner::Group(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_reuses_slots() {
        let mut arena = Arena::new();
        let a = arena.insert('a');
        let b = arena.insert('b');
        assert_eq!(arena.remove(a), Some('a'));
        assert_eq!(arena.remove(a), None);
        let c = arena.insert('c');
        assert_eq!(c, a);
        assert_eq!(arena.get(b), Some(&'b'));
        assert_eq!(arena.len(), 2);
        let live: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, ['c', 'b']);
    }

    #[test]
    fn test_new_entity_sample() {
        let se = Entity::new(EntityOwner::Task(ThreadId::from_raw(7)), 1024, CfsRqId::ROOT);
        assert!(se.is_task());
        assert_eq!(se.task(), Some(ThreadId::from_raw(7)));
        assert_eq!(se.avg.load_avg, 1024);
        assert_eq!(se.avg.last_update_time, 0);
    }
}
