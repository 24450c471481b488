//! Garbage-collection barriers and keep-flag evaluation.

use std::collections::BTreeMap;

use keel_types::BlobId;
use serde::{Deserialize, Serialize};

use crate::snapshot::{KeepMode, MemRec};

/// A collected GC barrier for one (tablet, channel) pair: everything at or
/// below `(collect_generation, collect_step)` is collectible unless a
/// keep-flag protects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barrier {
    /// Generation up to which collection was requested.
    pub collect_generation: u32,
    /// Step within the generation.
    pub collect_step: u32,
}

/// The answer to "should this blob's data still exist".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepStatus {
    /// The data must be preserved (by barrier position or keep-flag).
    pub keep_data: bool,
    /// The blob sits above the collect barrier, so the barrier itself
    /// mandates keeping it. False when only a keep-flag saves it.
    pub keep_by_barrier: bool,
}

/// Snapshot of all collected barriers, evaluated against blob ids.
///
/// Built once per planning pass from the index owner's barrier log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierEssence {
    barriers: BTreeMap<(u64, u8), Barrier>,
}

impl BarrierEssence {
    /// Create an essence with no barriers (everything is kept).
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the collected barrier for a (tablet, channel) pair.
    pub fn set_barrier(&mut self, tablet_id: u64, channel: u8, barrier: Barrier) {
        self.barriers.insert((tablet_id, channel), barrier);
    }

    /// Evaluate whether `blob`'s data must be preserved.
    ///
    /// `allow_keep_flags` gates whether a `Keep` flag on the record can
    /// save a blob that the barrier has already passed.
    pub fn keep(&self, blob: &BlobId, memrec: &MemRec, allow_keep_flags: bool) -> KeepStatus {
        let keep_by_barrier = match self.barriers.get(&(blob.tablet_id, blob.channel)) {
            Some(barrier) => {
                (blob.generation, blob.step) > (barrier.collect_generation, barrier.collect_step)
            }
            // No barrier collected yet: nothing is collectible.
            None => true,
        };

        let keep_by_flag = allow_keep_flags && memrec.keep_mode == KeepMode::Keep;
        let doomed = memrec.keep_mode == KeepMode::DoNotKeep;

        KeepStatus {
            keep_data: !doomed && (keep_by_barrier || keep_by_flag),
            keep_by_barrier,
        }
    }
}
