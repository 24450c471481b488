//! The mirror-3dc get strategy.

use std::sync::Arc;

use keel_types::{AccelerationMode, IntervalSet, PartId};
use keel_topology::{DelayEstimator, GroupTopology, NodeLayout, QuorumChecker, SubgroupMap};
use smallvec::SmallVec;
use tracing::warn;

use crate::blob_state::{BlobState, Situation};
use crate::requests::DiskRequests;

/// Result of one strategy step over one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// Terminal for this quantum: read `whole_situation` /
    /// `looks_like_phantom` off the blob state.
    Done,
    /// A request was emitted or is still outstanding; call again on the
    /// next reply.
    InProgress,
    /// The subgroup's failure set exceeds what the fail model tolerates.
    Error(String),
}

/// Decision logic for reading one blob from a mirror-3dc subgroup.
///
/// The strategy exploits the flavor's layout invariant: subgroup position
/// `i` lives in ring `i % 3`, and the part stored in a ring equals the ring
/// index, so position `i` can only ever serve part `i % 3`.
pub struct Mirror3dcGetStrategy {
    node_layout: Option<Arc<NodeLayout>>,
    acceleration_mode: AccelerationMode,
    /// True when this get itself is a phantom-verification probe: absence
    /// is then decided without requiring a write quorum of errors.
    phantom_check: bool,
}

impl Mirror3dcGetStrategy {
    /// Create a strategy instance.
    pub fn new(
        node_layout: Option<Arc<NodeLayout>>,
        acceleration_mode: AccelerationMode,
        phantom_check: bool,
    ) -> Self {
        Self {
            node_layout,
            acceleration_mode,
            phantom_check,
        }
    }

    /// Run one step: merge newly arrived data, pick the next disk to query,
    /// or classify the blob terminally.
    pub fn process(
        &self,
        state: &mut BlobState,
        topology: &GroupTopology,
        quorum: &QuorumChecker,
        delays: &dyn DelayEstimator,
        requests: &mut DiskRequests,
    ) -> StrategyOutcome {
        // Short-circuit: a previous step already finished this blob.
        if state.whole_situation == Situation::Present {
            return StrategyOutcome::Done;
        }

        // Merge any data collected per part into the whole-blob buffer.
        if state.merge_parts_into_whole() {
            state.whole_situation = Situation::Present;
            return StrategyOutcome::Done;
        }

        self.mark_slow_disk(state, delays);

        let disk_idx_list = self.traversal_order(state, topology);

        // Walk disks in preference order until one has an outstanding or
        // newly issued request; the rest only contribute status.
        let mut requested = false;
        for &disk_idx in &disk_idx_list {
            if self.request_disk(state, topology, requests, disk_idx) {
                requested = true;
                break;
            }
        }

        // Aggregate per-disk situations for the terminal decision.
        let mut failed = SubgroupMap::empty(topology);
        let mut possibly_written = SubgroupMap::empty(topology);
        let mut situations: SmallVec<[Situation; 9]> = SmallVec::new();
        for &disk_idx in &disk_idx_list {
            let part_idx = topology.ring_of_subgroup_idx(disk_idx);
            let situation = state.disks[disk_idx as usize].parts[part_idx as usize].situation;
            match situation {
                Situation::Error => {
                    failed.insert(disk_idx);
                    possibly_written.insert(disk_idx);
                }
                Situation::Lost => {
                    possibly_written.insert(disk_idx);
                }
                _ => {}
            }
            situations.push(situation);
        }

        if !quorum.check_fail_model_for_subgroup(&failed) {
            return StrategyOutcome::Error(format!(
                "mirror-3dc get for {} failed the fail model check",
                state.id
            ));
        }

        if requested {
            return StrategyOutcome::InProgress;
        }

        if !state.is_complete() {
            // Nothing outstanding and still missing data: every disk that
            // could answer has answered, and none produced the blob.
            warn!(blob = %state.id, "missing blob, no surviving replica produced data");
            state.whole_situation = Situation::Absent;
            state.looks_like_phantom = true;

            if self.phantom_check || quorum.check_quorum_for_subgroup(&possibly_written) {
                // Absent stands only when every reply was Absent or Lost;
                // any Error means the blob may yet be restorable.
                for situation in situations {
                    match situation {
                        Situation::Absent | Situation::Lost => {}
                        Situation::Unknown | Situation::Present | Situation::Sent => {
                            // Cannot occur once no disk has work left; log
                            // the anomaly and treat it as an error reply.
                            debug_assert!(false, "unexpected situation {situation:?}");
                            warn!(blob = %state.id, ?situation,
                                "anomalous situation in terminal phantom branch");
                            state.whole_situation = Situation::Error;
                        }
                        Situation::Error => {
                            state.whole_situation = Situation::Error;
                        }
                    }
                }
            }
            return StrategyOutcome::Done;
        }

        unreachable!("no request emitted yet blob is complete and not Present");
    }

    /// Identify and mark the slow disk per the acceleration mode.
    fn mark_slow_disk(&self, state: &mut BlobState, delays: &dyn DelayEstimator) {
        match self.acceleration_mode {
            AccelerationMode::SkipOneSlowest => {
                let (worst_idx, worst_ns, next_ns) = state.get_worst_predicted_delays(delays);

                // Only skip a disk that is exceptionally slow, not merely
                // the slowest of a tight pack.
                let slow_idx = match worst_idx {
                    Some(idx) if next_ns > 0 && worst_ns > next_ns * 2 => Some(idx),
                    _ => None,
                };

                for disk in state.disks.iter_mut() {
                    disk.is_slow = false;
                }
                if let Some(idx) = slow_idx {
                    state.disks[idx].is_slow = true;
                }
            }
            AccelerationMode::SkipMarked => {
                // Slow marks were set by the caller; take them as-is.
            }
        }
    }

    /// Disk traversal order: main replicas before handoff, fast before
    /// slow, near before far, index as the tie-break.
    fn traversal_order(
        &self,
        state: &BlobState,
        topology: &GroupTopology,
    ) -> SmallVec<[u32; 9]> {
        let distance = |disk_idx: u32| -> u64 {
            let is_main = topology.is_main(disk_idx);
            let is_slow = state.disks[disk_idx as usize].is_slow;
            let base = (if is_main { 0u64 } else { 1 }) + (if is_slow { 2 } else { 0 });
            let proximity = match &self.node_layout {
                Some(layout) => {
                    layout.proximity_score(state.disks[disk_idx as usize].order_number)
                }
                None => 0,
            };
            (base << 32) | proximity
        };

        let mut disk_idx_list: SmallVec<[u32; 9]> =
            (0..state.disks.len() as u32).collect();
        disk_idx_list.sort_by_key(|&idx| (distance(idx), idx));
        disk_idx_list
    }

    /// Issue a request to one disk if it still has something to tell us.
    ///
    /// Returns true when this disk has a request outstanding (newly issued
    /// or pending from an earlier step).
    fn request_disk(
        &self,
        state: &mut BlobState,
        topology: &GroupTopology,
        requests: &mut DiskRequests,
        disk_idx: u32,
    ) -> bool {
        let part_idx = topology.ring_of_subgroup_idx(disk_idx);

        match state.disks[disk_idx as usize].parts[part_idx as usize].situation {
            Situation::Unknown => {
                // Everything still needed, minus what arrived, minus what
                // this disk was already asked for.
                let mut request: IntervalSet = state.needed().clone();
                request.subtract(state.whole_here());
                request.subtract(&state.disks[disk_idx as usize].parts[part_idx as usize].requested);

                if !request.is_empty() {
                    let part_id = PartId::from_part_idx(state.id, part_idx);
                    let order_number = state.disks[disk_idx as usize].order_number;
                    requests.add_get(order_number, part_id, request.clone());
                    state.disks[disk_idx as usize].parts[part_idx as usize]
                        .requested
                        .union_with(&request);
                } else {
                    // Nothing new to ask, so a prior request must still be
                    // in flight.
                    assert!(
                        !state.disks[disk_idx as usize].parts[part_idx as usize]
                            .requested
                            .is_empty(),
                        "unknown situation with nothing requested on {}",
                        state.id
                    );
                }
                true
            }
            Situation::Present
            | Situation::Error
            | Situation::Absent
            | Situation::Lost => false,
            Situation::Sent => unreachable!("Sent is a write-path situation"),
        }
    }
}
