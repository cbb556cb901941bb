//! # Balance Domains
//!
//! The host describes its CPUs as nested partitions (threads in cores,
//! cores in packages, packages in nodes). From that description every CPU
//! gets its chain of scheduling domains, bottom-up, each holding the
//! groups the balancer compares against each other. Domains that would
//! not add a choice (a single CPU, or the same span as the level below)
//! are left out.
//!
//! The tree is built once. Only the per-group capacity and imbalance
//! fields change afterwards; they are shared between all CPUs that see
//! the same group.

use crate::error::{CfsError, CfsResult};
use crate::weight::SCHED_CAPACITY_SCALE;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use hashbrown::HashMap;

/// Largest supported number of CPUs
pub const MAX_CPUS: usize = 64;

/// Set of CPUs
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    /// No CPU
    pub const EMPTY: Self = Self(0);

    /// Build from raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// CPUs `0..n`
    pub const fn first(n: usize) -> Self {
        if n >= MAX_CPUS { Self(u64::MAX) } else { Self((1u64 << n) - 1) }
    }

    /// Only `cpu`
    pub const fn single(cpu: usize) -> Self {
        Self(1u64 << cpu)
    }

    /// Build from a list of CPUs
    pub fn from_cpus(cpus: &[usize]) -> Self {
        cpus.iter().fold(Self::EMPTY, |m, &c| m.with(c))
    }

    /// Raw bits
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether `cpu` is in the set
    #[inline]
    pub const fn contains(self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1u64 << cpu) != 0
    }

    /// Copy with `cpu` added
    #[inline]
    pub const fn with(self, cpu: usize) -> Self {
        Self(self.0 | (1u64 << cpu))
    }

    /// Copy with `cpu` removed
    #[inline]
    pub const fn without(self, cpu: usize) -> Self {
        Self(self.0 & !(1u64 << cpu))
    }

    /// Number of CPUs in the set
    #[inline]
    pub const fn weight(self) -> u32 {
        self.0.count_ones()
    }

    /// Whether the set is empty
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Intersection
    #[inline]
    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Union
    #[inline]
    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether the two sets share a CPU
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether every CPU of `self` is in `other`
    #[inline]
    pub const fn is_subset(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Lowest CPU in the set
    #[inline]
    pub fn first_cpu(self) -> Option<usize> {
        if self.0 == 0 { None } else { Some(self.0.trailing_zeros() as usize) }
    }

    /// CPUs in ascending order
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(cpu)
        })
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

/// Kind of a topology level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelKind {
    /// Hardware threads of one core
    Smt,
    /// Cores sharing a last-level cache
    Mc,
    /// Packages (sockets)
    Package,
    /// NUMA nodes
    Numa,
    /// Everything, added when the top level is still split
    System,
}

/// One level of the host's description
#[derive(Debug, Clone)]
pub struct TopologyLevel {
    /// Level kind
    pub kind: LevelKind,
    /// Partition of the CPUs at this level
    pub spans: Vec<Vec<usize>>,
}

/// Host description of the CPU hierarchy, lowest level first
///
/// An empty description puts all CPUs in one cache domain.
#[derive(Debug, Clone, Default)]
pub struct TopologySpec {
    /// Levels, bottom-up
    pub levels: Vec<TopologyLevel>,
}

impl TopologySpec {
    /// One cache domain over every CPU
    pub fn flat() -> Self {
        Self::default()
    }

    /// Append a level
    pub fn level(mut self, kind: LevelKind, spans: Vec<Vec<usize>>) -> Self {
        self.levels.push(TopologyLevel { kind, spans });
        self
    }

    /// Regular machine: `packages` packages of `cores` cores of
    /// `threads` threads, numbered thread-first
    pub fn symmetric(packages: usize, cores: usize, threads: usize) -> Self {
        let chunk = |size: usize, total: usize| -> Vec<Vec<usize>> {
            (0..total / size).map(|i| (i * size..(i + 1) * size).collect()).collect()
        };
        let total = packages * cores * threads;
        let mut spec = Self::default();
        if threads > 1 {
            spec = spec.level(LevelKind::Smt, chunk(threads, total));
        }
        spec = spec.level(LevelKind::Mc, chunk(cores * threads, total));
        if packages > 1 {
            spec = spec.level(LevelKind::Numa, vec![(0..total).collect()]);
        }
        spec
    }
}

bitflags! {
    /// Domain behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdFlags: u32 {
        /// Periodic balancing runs at this level
        const LOAD_BALANCE = 1 << 0;
        /// Balance when a CPU is about to go idle
        const BALANCE_NEWIDLE = 1 << 1;
        /// Place on exec
        const BALANCE_EXEC = 1 << 2;
        /// Place new tasks
        const BALANCE_FORK = 1 << 3;
        /// Place on wakeup through the idlest-group search
        const BALANCE_WAKE = 1 << 4;
        /// Consider pulling the wakee next to the waker
        const WAKE_AFFINE = 1 << 5;
        /// Members share core resources
        const SHARE_CPUCAPACITY = 1 << 6;
        /// Members share the last-level cache
        const SHARE_PKG_RESOURCES = 1 << 7;
        /// Only one CPU balances this level at a time
        const SERIALIZE = 1 << 8;
        /// Spread to sibling groups before stacking
        const PREFER_SIBLING = 1 << 9;
        /// Level crosses memory nodes
        const NUMA = 1 << 10;
    }
}

/// Capacity and imbalance state of a group, shared by every CPU that
/// sees the group
#[derive(Debug)]
pub struct GroupCapacity {
    /// Summed CPU capacity
    pub capacity: AtomicU64,
    /// Set when balancing left the group imbalanced because of affinity
    pub imbalance: AtomicBool,
    /// Busy CPUs, maintained for last-level-cache groups
    pub nr_busy_cpus: AtomicU32,
}

impl GroupCapacity {
    fn new(capacity: u64, cpus: u32) -> Self {
        Self {
            capacity: AtomicU64::new(capacity),
            imbalance: AtomicBool::new(false),
            nr_busy_cpus: AtomicU32::new(cpus),
        }
    }

    /// Whether the group is marked imbalanced
    #[inline]
    pub fn is_imbalanced(&self) -> bool {
        self.imbalance.load(Ordering::Relaxed)
    }

    /// Set or clear the imbalance mark
    #[inline]
    pub fn set_imbalanced(&self, imbalanced: bool) {
        self.imbalance.store(imbalanced, Ordering::Relaxed);
    }
}

/// A group of CPUs compared as a unit within a domain
#[derive(Debug, Clone)]
pub struct SchedGroup {
    /// Member CPUs
    pub span: CpuMask,
    /// Shared capacity state
    pub sgc: Arc<GroupCapacity>,
}

impl SchedGroup {
    /// Current capacity
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.sgc.capacity.load(Ordering::Relaxed)
    }

    /// CPU that balances on behalf of the group when none is idle
    #[inline]
    pub fn balance_cpu(&self) -> usize {
        self.span.first_cpu().unwrap_or(0)
    }
}

/// One level of a CPU's domain chain
#[derive(Debug, Clone)]
pub struct SchedDomain {
    /// Position in the owning CPU's chain
    pub level: usize,
    /// Level kind
    pub kind: LevelKind,
    /// Member CPUs
    pub span: CpuMask,
    /// Groups, local group first
    pub groups: Vec<SchedGroup>,
    /// Flags
    pub flags: SdFlags,
    /// Shortest balance interval (ms)
    pub min_interval: u64,
    /// Longest balance interval (ms)
    pub max_interval: u64,
    /// Interval multiplier while the CPU is busy
    pub busy_factor: u64,
    /// Percent imbalance tolerated before moving load
    pub imbalance_pct: u64,
    /// Failed attempts tolerated before cache-hot tasks move
    pub cache_nice_tries: u32,
    /// Load index while busy
    pub busy_idx: usize,
    /// Load index while idle
    pub idle_idx: usize,
    /// Load index when newly idle
    pub newidle_idx: usize,
    /// Load index on wakeup
    pub wake_idx: usize,
    /// Load index on fork and exec
    pub forkexec_idx: usize,
    /// Child level has `PREFER_SIBLING`
    pub child_prefers_sibling: bool,
}

impl SchedDomain {
    fn new(level: usize, kind: LevelKind, span: CpuMask, groups: Vec<SchedGroup>) -> Self {
        let weight = span.weight() as u64;
        let mut sd = Self {
            level,
            kind,
            span,
            groups,
            flags: SdFlags::LOAD_BALANCE
                | SdFlags::BALANCE_NEWIDLE
                | SdFlags::BALANCE_EXEC
                | SdFlags::BALANCE_FORK
                | SdFlags::WAKE_AFFINE,
            min_interval: weight,
            max_interval: 2 * weight,
            busy_factor: 32,
            imbalance_pct: 125,
            cache_nice_tries: 0,
            busy_idx: 0,
            idle_idx: 0,
            newidle_idx: 0,
            wake_idx: 0,
            forkexec_idx: 0,
            child_prefers_sibling: false,
        };
        match kind {
            LevelKind::Smt => {
                sd.flags |= SdFlags::SHARE_CPUCAPACITY | SdFlags::SHARE_PKG_RESOURCES;
                sd.imbalance_pct = 110;
            }
            LevelKind::Mc => {
                sd.flags |= SdFlags::SHARE_PKG_RESOURCES;
                sd.imbalance_pct = 117;
                sd.cache_nice_tries = 1;
                sd.busy_idx = 2;
            }
            LevelKind::Numa => {
                sd.flags |= SdFlags::NUMA | SdFlags::SERIALIZE;
                sd.cache_nice_tries = 2;
                sd.busy_idx = 3;
                sd.idle_idx = 2;
            }
            LevelKind::Package | LevelKind::System => {
                sd.flags |= SdFlags::PREFER_SIBLING;
                sd.cache_nice_tries = 1;
                sd.busy_idx = 2;
                sd.idle_idx = 1;
            }
        }
        sd
    }

    /// Whether `flag` is set
    #[inline]
    pub fn has(&self, flag: SdFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Group containing `cpu`
    pub fn group_of(&self, cpu: usize) -> Option<&SchedGroup> {
        self.groups.iter().find(|g| g.span.contains(cpu))
    }

    /// Number of CPUs in the domain
    #[inline]
    pub fn weight(&self) -> u32 {
        self.span.weight()
    }
}

/// Built domain hierarchy
#[derive(Debug)]
pub struct Topology {
    nr_cpus: usize,
    domains: Vec<Vec<SchedDomain>>,
    capacity_orig: Vec<u64>,
    llc_id: Vec<usize>,
    llc_size: Vec<u32>,
    llc_level: Vec<Option<usize>>,
    node_of: Vec<usize>,
    nr_nodes: usize,
    max_capacity: u64,
    min_capacity: u64,
}

impl Topology {
    /// Build the hierarchy for `nr_cpus` CPUs of the given capacities
    /// (empty means all full-size)
    pub fn build(spec: &TopologySpec, nr_cpus: usize, capacities: &[u64]) -> CfsResult<Self> {
        if nr_cpus == 0 || nr_cpus > MAX_CPUS {
            return Err(CfsError::InvalidCpu);
        }
        let capacity_orig: Vec<u64> = (0..nr_cpus)
            .map(|cpu| capacities.get(cpu).copied().unwrap_or(SCHED_CAPACITY_SCALE))
            .collect();
        if capacity_orig.iter().any(|&c| c == 0 || c > SCHED_CAPACITY_SCALE) {
            return Err(CfsError::InvalidTopology);
        }

        let levels = Self::normalize(spec, nr_cpus)?;

        // Shared group state, keyed by (level, group span)
        let mut sgcs: HashMap<(usize, u64), Arc<GroupCapacity>> = HashMap::new();
        let mut sgc_for = |level: usize, span: CpuMask| -> Arc<GroupCapacity> {
            sgcs.entry((level, span.bits()))
                .or_insert_with(|| {
                    let cap = span.iter().map(|c| capacity_orig[c]).sum();
                    Arc::new(GroupCapacity::new(cap, span.weight()))
                })
                .clone()
        };

        let mut domains = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let mut chain: Vec<SchedDomain> = Vec::new();
            let mut child_span = CpuMask::single(cpu);
            for (pos, (kind, masks)) in levels.iter().enumerate() {
                let Some(span) = masks.iter().copied().find(|m| m.contains(cpu)) else {
                    continue;
                };
                if span.weight() <= 1 || span == child_span {
                    continue;
                }
                let level = chain.len();
                let mut groups: Vec<SchedGroup> = Self::child_spans(&levels, pos, span)
                    .into_iter()
                    .map(|g| SchedGroup { span: g, sgc: sgc_for(level, g) })
                    .collect();
                groups.sort_by_key(|g| (!g.span.contains(cpu), g.span.bits()));
                let mut sd = SchedDomain::new(level, *kind, span, groups);
                if let Some(child) = chain.last() {
                    sd.child_prefers_sibling = child.has(SdFlags::PREFER_SIBLING);
                }
                chain.push(sd);
                child_span = span;
            }
            domains.push(chain);
        }

        let mut llc_id = vec![0; nr_cpus];
        let mut llc_size = vec![1; nr_cpus];
        let mut llc_level = vec![None; nr_cpus];
        for cpu in 0..nr_cpus {
            let llc = domains[cpu]
                .iter()
                .rposition(|sd: &SchedDomain| sd.has(SdFlags::SHARE_PKG_RESOURCES));
            match llc {
                Some(level) => {
                    let span = domains[cpu][level].span;
                    llc_id[cpu] = span.first_cpu().unwrap_or(cpu);
                    llc_size[cpu] = span.weight();
                    llc_level[cpu] = Some(level);
                }
                None => llc_id[cpu] = cpu,
            }
        }

        let (node_of, nr_nodes) = Self::nodes(&levels, nr_cpus);
        let max_capacity = capacity_orig.iter().copied().max().unwrap_or(SCHED_CAPACITY_SCALE);
        let min_capacity = capacity_orig.iter().copied().min().unwrap_or(SCHED_CAPACITY_SCALE);

        let topo = Self {
            nr_cpus,
            domains,
            capacity_orig,
            llc_id,
            llc_size,
            llc_level,
            node_of,
            nr_nodes,
            max_capacity,
            min_capacity,
        };
        log::info!(
            "[cfs] topology: {} cpus, {} levels on cpu0, {} nodes, llc size {}",
            nr_cpus,
            topo.domains[0].len(),
            nr_nodes,
            topo.llc_size[0]
        );
        Ok(topo)
    }

    /// Validate the description and convert it to masks, adding a
    /// system-wide level when the top is still split
    fn normalize(spec: &TopologySpec, nr_cpus: usize) -> CfsResult<Vec<(LevelKind, Vec<CpuMask>)>> {
        let all = CpuMask::first(nr_cpus);
        let mut levels: Vec<(LevelKind, Vec<CpuMask>)> = Vec::new();
        if spec.levels.is_empty() {
            levels.push((LevelKind::Mc, vec![all]));
            return Ok(levels);
        }
        for level in &spec.levels {
            let mut union = CpuMask::EMPTY;
            let mut masks = Vec::with_capacity(level.spans.len());
            for span in &level.spans {
                if span.is_empty() || span.iter().any(|&c| c >= nr_cpus) {
                    return Err(CfsError::InvalidTopology);
                }
                let mask = CpuMask::from_cpus(span);
                if mask.intersects(union) {
                    return Err(CfsError::InvalidTopology);
                }
                union = union.or(mask);
                masks.push(mask);
            }
            if union != all {
                return Err(CfsError::InvalidTopology);
            }
            if let Some((_, below)) = levels.last() {
                // Every lower span must sit inside one span of this level
                if !below.iter().all(|b| masks.iter().any(|m| b.is_subset(*m))) {
                    return Err(CfsError::InvalidTopology);
                }
            }
            levels.push((level.kind, masks));
        }
        if levels.last().is_some_and(|(_, masks)| masks.len() > 1) {
            levels.push((LevelKind::System, vec![all]));
        }
        Ok(levels)
    }

    /// Groups of a domain spanning `span` at level index `pos`: for each
    /// member, the largest lower-level span that still splits `span`
    fn child_spans(levels: &[(LevelKind, Vec<CpuMask>)], pos: usize, span: CpuMask) -> Vec<CpuMask> {
        let mut groups: Vec<CpuMask> = Vec::new();
        for cpu in span.iter() {
            let group = levels[..pos]
                .iter()
                .rev()
                .filter_map(|(_, masks)| masks.iter().copied().find(|m| m.contains(cpu)))
                .find(|m| *m != span)
                .unwrap_or(CpuMask::single(cpu));
            if !groups.contains(&group) {
                groups.push(group);
            }
        }
        groups
    }

    fn nodes(levels: &[(LevelKind, Vec<CpuMask>)], nr_cpus: usize) -> (Vec<usize>, usize) {
        let numa = levels.iter().position(|(k, _)| *k == LevelKind::Numa);
        let node_level = match numa {
            Some(p) if p > 0 => Some(&levels[p - 1].1),
            _ => levels.iter().rev().find(|(k, _)| *k == LevelKind::Package).map(|(_, m)| m),
        };
        let mut node_of = vec![0; nr_cpus];
        let Some(masks) = node_level else {
            return (node_of, 1);
        };
        for (node, mask) in masks.iter().enumerate() {
            for cpu in mask.iter() {
                node_of[cpu] = node;
            }
        }
        (node_of, masks.len().max(1))
    }

    /// Number of CPUs
    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Domain chain of `cpu`, lowest first
    #[inline]
    pub fn domains(&self, cpu: usize) -> &[SchedDomain] {
        self.domains.get(cpu).map_or(&[], |d| d.as_slice())
    }

    /// Domain of `cpu` at `level`
    #[inline]
    pub fn domain(&self, cpu: usize, level: usize) -> Option<&SchedDomain> {
        self.domains.get(cpu)?.get(level)
    }

    /// Full-speed capacity of `cpu`
    #[inline]
    pub fn capacity_orig(&self, cpu: usize) -> u64 {
        self.capacity_orig.get(cpu).copied().unwrap_or(SCHED_CAPACITY_SCALE)
    }

    /// Largest CPU capacity in the system
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    /// Smallest CPU capacity in the system
    pub fn min_capacity(&self) -> u64 {
        self.min_capacity
    }

    /// Whether CPUs differ in capacity
    pub fn asymmetric(&self) -> bool {
        self.max_capacity != self.min_capacity
    }

    /// Identifier of the last-level cache of `cpu`
    #[inline]
    pub fn llc_id(&self, cpu: usize) -> usize {
        self.llc_id.get(cpu).copied().unwrap_or(cpu)
    }

    /// CPUs sharing the last-level cache of `cpu`
    #[inline]
    pub fn llc_size(&self, cpu: usize) -> u32 {
        self.llc_size.get(cpu).copied().unwrap_or(1)
    }

    /// Level of the last-level-cache domain of `cpu`
    #[inline]
    pub fn llc_level(&self, cpu: usize) -> Option<usize> {
        self.llc_level.get(cpu).copied().flatten()
    }

    /// Whether two CPUs share a last-level cache
    #[inline]
    pub fn cpus_share_cache(&self, a: usize, b: usize) -> bool {
        self.llc_id(a) == self.llc_id(b)
    }

    /// Memory node of `cpu`
    #[inline]
    pub fn node_of(&self, cpu: usize) -> usize {
        self.node_of.get(cpu).copied().unwrap_or(0)
    }

    /// Number of memory nodes
    #[inline]
    pub fn nr_nodes(&self) -> usize {
        self.nr_nodes
    }

    /// CPUs on `node`
    pub fn node_mask(&self, node: usize) -> CpuMask {
        (0..self.nr_cpus).filter(|&c| self.node_of[c] == node).fold(CpuMask::EMPTY, |m, c| m.with(c))
    }

    /// Last-level cache group of `cpu`, whose busy count is tracked
    pub fn llc_group(&self, cpu: usize) -> Option<Arc<GroupCapacity>> {
        let llc = self.llc_level(cpu)?;
        self.domain(cpu, llc + 1)?.group_of(cpu).map(|g| g.sgc.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpumask_ops() {
        let m = CpuMask::from_cpus(&[1, 3, 5]);
        assert_eq!(m.weight(), 3);
        assert_eq!(m.first_cpu(), Some(1));
        assert_eq!(m.iter().collect::<Vec<_>>(), [1, 3, 5]);
        assert!(m.without(3).is_subset(m));
        assert!(!m.contains(2));
        assert_eq!(CpuMask::first(64).weight(), 64);
    }

    #[test]
    fn test_flat_topology() {
        let topo = Topology::build(&TopologySpec::flat(), 4, &[]).unwrap();
        let sd = &topo.domains(2)[0];
        assert_eq!(topo.domains(2).len(), 1);
        assert_eq!(sd.kind, LevelKind::Mc);
        assert_eq!(sd.groups.len(), 4);
        assert!(sd.groups[0].span.contains(2));
        assert_eq!(sd.imbalance_pct, 117);
        assert!(topo.cpus_share_cache(0, 3));
        assert_eq!(topo.llc_size(1), 4);
    }

    #[test]
    fn test_single_cpu_has_no_domains() {
        let topo = Topology::build(&TopologySpec::flat(), 1, &[]).unwrap();
        assert!(topo.domains(0).is_empty());
    }

    #[test]
    fn test_symmetric_two_packages() {
        let topo = Topology::build(&TopologySpec::symmetric(2, 2, 2), 8, &[]).unwrap();
        let chain = topo.domains(5);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].kind, LevelKind::Smt);
        assert_eq!(chain[0].span, CpuMask::from_cpus(&[4, 5]));
        assert_eq!(chain[1].span, CpuMask::from_cpus(&[4, 5, 6, 7]));
        assert_eq!(chain[1].groups.len(), 2);
        assert_eq!(chain[1].groups[0].span, CpuMask::from_cpus(&[4, 5]));
        assert_eq!(chain[2].groups.len(), 2);
        assert_eq!(chain[2].groups[0].span, CpuMask::from_cpus(&[4, 5, 6, 7]));
        assert_eq!(topo.node_of(5), 1);
        assert_eq!(topo.nr_nodes(), 2);
        assert!(!topo.cpus_share_cache(1, 5));
        assert_eq!(chain[2].groups[0].capacity(), 4 * 1024);
    }

    #[test]
    fn test_shared_group_state() {
        let topo = Topology::build(&TopologySpec::symmetric(2, 2, 1), 4, &[]).unwrap();
        let a = &topo.domains(0)[1].groups[0];
        let b = &topo.domains(1)[1].groups[0];
        a.sgc.set_imbalanced(true);
        assert!(b.sgc.is_imbalanced());
    }

    #[test]
    fn test_rejects_bad_partition() {
        let spec = TopologySpec::flat().level(LevelKind::Mc, vec![vec![0, 1], vec![1, 2]]);
        assert_eq!(Topology::build(&spec, 3, &[]).unwrap_err(), CfsError::InvalidTopology);
        let spec = TopologySpec::flat()
            .level(LevelKind::Smt, vec![vec![0, 1], vec![2, 3]])
            .level(LevelKind::Mc, vec![vec![0, 2], vec![1, 3]]);
        assert_eq!(Topology::build(&spec, 4, &[]).unwrap_err(), CfsError::InvalidTopology);
    }

    #[test]
    fn test_system_level_appended() {
        let spec = TopologySpec::flat().level(LevelKind::Package, vec![vec![0, 1], vec![2, 3]]);
        let topo = Topology::build(&spec, 4, &[]).unwrap();
        let chain = topo.domains(0);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].kind, LevelKind::System);
        assert!(chain[1].child_prefers_sibling);
    }
}
