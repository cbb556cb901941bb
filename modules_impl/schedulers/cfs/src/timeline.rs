//! # Timeline
//!
//! Entities ordered by vruntime. Keys are taken relative to a fixed
//! anchor so the wrapping vruntime space orders correctly, and a
//! per-insert sequence number keeps equal vruntimes in insertion order.

use crate::entity::EntityId;
use crate::vtime::vdiff;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Position of an entity in a [`Timeline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimelineKey {
    rel: i64,
    seq: u64,
}

/// Vruntime-ordered set of queued entities
#[derive(Debug)]
pub struct Timeline {
    tree: BTreeMap<TimelineKey, EntityId>,
    anchor: u64,
    seq: u64,
    leftmost: Option<(TimelineKey, EntityId)>,
}

impl Timeline {
    /// Create an empty timeline; `anchor` is any vruntime near the ones
    /// that will be inserted
    pub fn new(anchor: u64) -> Self {
        Self { tree: BTreeMap::new(), anchor, seq: 0, leftmost: None }
    }

    /// Insert an entity at `vruntime`
    pub fn insert(&mut self, vruntime: u64, id: EntityId) -> TimelineKey {
        let key = TimelineKey { rel: vdiff(vruntime, self.anchor), seq: self.seq };
        self.seq += 1;
        self.tree.insert(key, id);
        match self.leftmost {
            Some((left, _)) if left < key => {}
            _ => self.leftmost = Some((key, id)),
        }
        key
    }

    /// Remove the entity stored at `key`
    pub fn remove(&mut self, key: TimelineKey) -> Option<EntityId> {
        let id = self.tree.remove(&key)?;
        if matches!(self.leftmost, Some((left, _)) if left == key) {
            self.leftmost = self.tree.iter().next().map(|(k, v)| (*k, *v));
        }
        Some(id)
    }

    /// Entity with the smallest vruntime
    #[inline]
    pub fn first(&self) -> Option<EntityId> {
        self.leftmost.map(|(_, id)| id)
    }

    /// Entity following `key`
    pub fn next_after(&self, key: TimelineKey) -> Option<EntityId> {
        use core::ops::Bound::{Excluded, Unbounded};
        self.tree.range((Excluded(key), Unbounded)).next().map(|(_, id)| *id)
    }

    /// Entity with the largest vruntime
    pub fn last(&self) -> Option<EntityId> {
        self.tree.iter().next_back().map(|(_, id)| *id)
    }

    /// Number of entities
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the timeline is empty
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Entities in pick order
    pub fn ids(&self) -> Vec<EntityId> {
        self.tree.values().copied().collect()
    }
}
