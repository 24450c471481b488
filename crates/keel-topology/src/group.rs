//! Group geometry and deterministic blob-to-subgroup placement.

use keel_types::{BlobId, VDiskId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Disk order numbers of one blob's subgroup, inline up to the mirror-3dc
/// subgroup size.
pub type SubgroupOrderNums = SmallVec<[u32; 9]>;

/// The fixed geometry of a storage group.
///
/// Disks are addressed by *order number*: ring-major, then fail domain,
/// then disk within the domain. For the mirror-3dc flavor the part index of
/// a subgroup position always equals its ring index (`idx % num_rings`),
/// an invariant the get strategy relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTopology {
    /// Number of rings (fail realms, usually datacenters).
    pub num_rings: u8,
    /// Fail domains (racks) per ring.
    pub num_fail_domains_per_ring: u8,
    /// Disks per fail domain.
    pub num_disks_per_fail_domain: u8,
}

impl GroupTopology {
    /// The mirror-3dc flavor: 3 rings × 3 fail domains × 1 disk.
    pub fn mirror_3dc() -> Self {
        Self {
            num_rings: 3,
            num_fail_domains_per_ring: 3,
            num_disks_per_fail_domain: 1,
        }
    }

    /// Total number of disks in the group.
    pub fn total_disks(&self) -> u32 {
        self.num_rings as u32
            * self.num_fail_domains_per_ring as u32
            * self.num_disks_per_fail_domain as u32
    }

    /// Number of disks in one blob's subgroup.
    pub fn subgroup_size(&self) -> u32 {
        self.num_rings as u32 * self.num_fail_domains_per_ring as u32
    }

    /// Number of parts per blob. For mirror flavors this equals the number
    /// of rings: each ring holds one full copy.
    pub fn num_parts(&self) -> u8 {
        self.num_rings
    }

    /// Ring index of a subgroup position. Part index equals ring index.
    pub fn ring_of_subgroup_idx(&self, subgroup_idx: u32) -> u8 {
        (subgroup_idx % self.num_rings as u32) as u8
    }

    /// Whether a subgroup position is a main replica (the rest are handoff).
    pub fn is_main(&self, subgroup_idx: u32) -> bool {
        subgroup_idx < self.num_rings as u32
    }

    /// Compute the ordered subgroup for a blob placement hash.
    ///
    /// Position `i` maps to a disk in ring `i % num_rings`, so the first
    /// `num_rings` positions are the main replicas (one per ring) and the
    /// rest are handoff. The walk over fail domains is seeded from the hash,
    /// so the same blob always lands on the same disks while distinct blobs
    /// spread across the group.
    pub fn pick_subgroup(&self, hash: u64) -> SubgroupOrderNums {
        let rings = self.num_rings as u32;
        let domains = self.num_fail_domains_per_ring as u32;
        let disks = self.num_disks_per_fail_domain as u32;

        let mut out = SubgroupOrderNums::new();
        out.resize(self.subgroup_size() as usize, 0);

        for ring in 0..rings {
            // Each ring gets its own starting domain derived from the hash.
            let start_domain = ((hash >> (ring * 8)) as u32 ^ hash as u32) % domains;
            let disk_in_domain = ((hash >> 48) as u32) % disks;

            for step in 0..domains {
                let domain = (start_domain + step) % domains;
                let order_number = (ring * domains + domain) * disks + disk_in_domain;
                out[(ring + step * rings) as usize] = order_number;
            }
        }

        out
    }

    /// Position of `order_number` within a subgroup, if it belongs to it.
    pub fn subgroup_idx_of(&self, subgroup: &[u32], order_number: u32) -> Option<u32> {
        subgroup
            .iter()
            .position(|&n| n == order_number)
            .map(|i| i as u32)
    }
}

/// A storage group: identity plus geometry.
///
/// Cheap to clone; shared between the job, the planner, and the strategy as
/// an immutable snapshot of the group configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Group identifier.
    pub group_id: u32,
    /// Configuration generation.
    pub generation: u32,
    /// The group's geometry.
    pub topology: GroupTopology,
}

impl GroupInfo {
    /// Create a group descriptor.
    pub fn new(group_id: u32, generation: u32, topology: GroupTopology) -> Self {
        Self {
            group_id,
            generation,
            topology,
        }
    }

    /// The [`VDiskId`] of the disk at `order_number`.
    pub fn vdisk_id(&self, order_number: u32) -> VDiskId {
        let domains = self.topology.num_fail_domains_per_ring as u32;
        let disks = self.topology.num_disks_per_fail_domain as u32;
        let slot = order_number / disks;
        VDiskId::new(
            self.group_id,
            self.generation,
            (slot / domains) as u8,
            (slot % domains) as u8,
            (order_number % disks) as u8,
        )
    }

    /// Subgroup order numbers for a blob.
    pub fn subgroup_for(&self, blob: &BlobId) -> SubgroupOrderNums {
        self.topology.pick_subgroup(blob.hash())
    }
}
