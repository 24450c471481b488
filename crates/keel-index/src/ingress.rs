//! Per-blob part-layout metadata.

use keel_topology::GroupTopology;
use keel_types::PartSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Which parts each subgroup disk is known to hold for one blob.
///
/// Ingress travels with the blob's index record and is the planner's source
/// of truth for two questions: which parts *we* are supposed to hold, and
/// which peers are expected to answer for which parts (used to pre-size
/// proxy requests).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingress {
    /// Known parts per subgroup position.
    per_disk: SmallVec<[PartSet; 9]>,
    num_parts: u8,
}

impl Ingress {
    /// Create an empty ingress for a subgroup of `subgroup_size` disks and
    /// `num_parts` parts.
    pub fn new(subgroup_size: u32, num_parts: u8) -> Self {
        Self {
            per_disk: (0..subgroup_size)
                .map(|_| PartSet::empty(num_parts))
                .collect(),
            num_parts,
        }
    }

    /// Record that the disk at `subgroup_idx` holds `part_idx`.
    pub fn set_part(&mut self, subgroup_idx: u32, part_idx: u8) {
        self.per_disk[subgroup_idx as usize].set(part_idx);
    }

    /// Parts the disk at `subgroup_idx` is known to hold.
    pub fn known_parts(&self, subgroup_idx: u32) -> PartSet {
        self.per_disk
            .get(subgroup_idx as usize)
            .copied()
            .unwrap_or(PartSet::empty(self.num_parts))
    }

    /// Parts the disk at `self_idx` is *supposed* to hold.
    ///
    /// A main replica must hold the part of its ring regardless of what the
    /// ingress records. A handoff position must hold exactly the parts that
    /// were handed off to it.
    pub fn parts_we_must_have_locally(
        &self,
        topology: &GroupTopology,
        self_idx: u32,
    ) -> PartSet {
        if topology.is_main(self_idx) {
            let mut parts = PartSet::empty(self.num_parts);
            parts.set(topology.ring_of_subgroup_idx(self_idx));
            parts
        } else {
            self.known_parts(self_idx)
        }
    }
}
