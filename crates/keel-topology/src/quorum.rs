//! Subgroup bitmaps and the mirror-3dc quorum predicates.

use std::fmt;

use crate::GroupTopology;

/// A bitmap over the positions of one blob's subgroup.
///
/// Positions are subgroup indices (0..subgroup_size), not disk order
/// numbers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SubgroupMap {
    bits: u16,
    size: u8,
}

impl SubgroupMap {
    /// Create an empty bitmap for the given topology.
    pub fn empty(topology: &GroupTopology) -> Self {
        let size = topology.subgroup_size() as u8;
        debug_assert!(size <= 16);
        Self { bits: 0, size }
    }

    /// Create a bitmap with every position set.
    pub fn full(topology: &GroupTopology) -> Self {
        let mut map = Self::empty(topology);
        map.bits = if map.size >= 16 {
            u16::MAX
        } else {
            (1u16 << map.size) - 1
        };
        map
    }

    /// Set the bit for `subgroup_idx`.
    pub fn insert(&mut self, subgroup_idx: u32) {
        debug_assert!(subgroup_idx < self.size as u32);
        self.bits |= 1 << subgroup_idx;
    }

    /// Whether the bit for `subgroup_idx` is set.
    pub fn contains(&self, subgroup_idx: u32) -> bool {
        subgroup_idx < self.size as u32 && self.bits & (1 << subgroup_idx) != 0
    }

    /// Number of set positions.
    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    /// Whether no positions are set.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// The positions NOT in this map.
    pub fn complement(&self) -> SubgroupMap {
        let mask = if self.size >= 16 {
            u16::MAX
        } else {
            (1u16 << self.size) - 1
        };
        SubgroupMap {
            bits: !self.bits & mask,
            size: self.size,
        }
    }

    /// Iterate over set subgroup indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        let bits = self.bits;
        (0..self.size as u32).filter(move |i| bits & (1 << i) != 0)
    }
}

impl fmt::Debug for SubgroupMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subgroup{{")?;
        for (i, idx) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{idx}")?;
        }
        write!(f, "}}")
    }
}

/// Fail-model and write-quorum predicates for the mirror-3dc flavor.
///
/// Mirror-3dc tolerates the loss of one full ring (datacenter) plus one
/// more disk anywhere else. The write quorum is the dual: a disk set could
/// have absorbed a successful write iff the disks *outside* the set form a
/// tolerable failure.
#[derive(Debug, Clone, Copy)]
pub struct QuorumChecker {
    topology: GroupTopology,
}

impl QuorumChecker {
    /// Create a checker for the given topology.
    pub fn new(topology: GroupTopology) -> Self {
        Self { topology }
    }

    /// Whether the `failed` set of subgroup positions is tolerable.
    ///
    /// Tolerable iff there is a ring such that all failures outside that
    /// ring affect at most one disk.
    pub fn check_fail_model_for_subgroup(&self, failed: &SubgroupMap) -> bool {
        let rings = self.topology.num_rings as u32;

        let mut per_ring = [0u32; 16];
        let mut total = 0u32;
        for idx in failed.iter() {
            per_ring[(idx % rings) as usize] += 1;
            total += 1;
        }

        (0..rings).any(|sacrificed| total - per_ring[sacrificed as usize] <= 1)
    }

    /// Whether `possibly_written` constitutes a legal write quorum.
    pub fn check_quorum_for_subgroup(&self, possibly_written: &SubgroupMap) -> bool {
        self.check_fail_model_for_subgroup(&possibly_written.complement())
    }
}
