//! Per-blob reconstruction from merged peer replies.
//!
//! The planner fills a [`RecoveryMachine`] with one task per blob that
//! needs local parts; the job then feeds it merged peer replies one blob
//! at a time. For the mirror flavor a blob is recovered from any complete
//! replica part; blobs nothing answered for either go to phantom
//! verification (when the planner marked them phantom-like) or onto the
//! unreplicated queue for a later quantum.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use keel_index::Ingress;
use keel_types::{BlobId, PartId, PartSet, RecoveredBlob, ReplConfig, ReplyStatus};
use tracing::{debug, info, warn};

use crate::events::PeerItem;
use crate::info::ReplInfo;

/// Merged replies from every peer for one blob.
#[derive(Debug, Default)]
pub struct BlobReplies {
    /// The blob all items answer for.
    pub id: BlobId,
    /// `(part, status, data)` tuples from all consumer proxies.
    pub items: Vec<PeerItem>,
}

impl BlobReplies {
    /// Start collecting replies for `id`.
    pub fn new(id: BlobId) -> Self {
        Self {
            id,
            items: Vec::new(),
        }
    }

    /// Append one reply item.
    pub fn add(&mut self, item: PeerItem) {
        debug_assert_eq!(item.part_id.blob, self.id);
        self.items.push(item);
    }
}

/// One planned unit of recovery work.
#[derive(Debug, Clone)]
pub struct RecoveryTask {
    /// Parts the local disk must obtain.
    pub parts: PartSet,
    /// Candidate for phantom verification if recovery finds no data.
    pub phantom_like: bool,
    /// Part-layout metadata, used to pre-size peer requests.
    pub ingress: Ingress,
}

/// Task queue plus reconstruction logic for one quantum.
#[derive(Debug)]
pub struct RecoveryMachine {
    tasks: BTreeMap<BlobId, RecoveryTask>,
    metadata_parts: Vec<PartId>,
    unreplicated: VecDeque<BlobId>,
    max_tasks: usize,
    min_huge_blob_size: u32,
}

impl RecoveryMachine {
    /// Create a machine; `unreplicated` carries blobs left over from prior
    /// quanta so they are retried and re-counted.
    pub fn new(config: &ReplConfig, unreplicated: VecDeque<BlobId>) -> Self {
        Self {
            tasks: BTreeMap::new(),
            metadata_parts: Vec::new(),
            unreplicated,
            max_tasks: config.max_recovery_tasks,
            min_huge_blob_size: config.min_huge_blob_size,
        }
    }

    /// Enqueue a recovery task.
    pub fn add_task(&mut self, blob: BlobId, parts: PartSet, phantom_like: bool, ingress: Ingress) {
        debug_assert!(!parts.is_empty());
        self.tasks.insert(
            blob,
            RecoveryTask {
                parts,
                phantom_like,
                ingress,
            },
        );
    }

    /// Register a zero-length part; it is materialized at finish without
    /// any peer traffic.
    pub fn add_metadata_part(&mut self, part: PartId) {
        self.metadata_parts.push(part);
    }

    /// Visit every task in blob order (used to seed the peer proxies).
    pub fn for_each(&self, mut f: impl FnMut(&BlobId, &PartSet, &Ingress)) {
        for (blob, task) in &self.tasks {
            f(blob, &task.parts, &task.ingress);
        }
    }

    /// Donor mode disables phantom verification.
    pub fn clear_possible_phantom(&mut self) {
        for task in self.tasks.values_mut() {
            task.phantom_like = false;
        }
    }

    /// Whether the planner must stop adding tasks.
    pub fn full_of_tasks(&self) -> bool {
        self.tasks.len() >= self.max_tasks
    }

    /// Whether nothing was planned at all.
    pub fn no_tasks(&self) -> bool {
        self.tasks.is_empty() && self.metadata_parts.is_empty()
    }

    /// Number of planned tasks.
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Attempt to reconstruct one blob from its merged replies.
    ///
    /// Returns `(true, parts)` when the blob was handled — recovered into
    /// `out`, or recorded as unreplicated. Returns `(false, parts)` when
    /// the blob produced no data and is phantom-like: the caller must run
    /// phantom verification and then call
    /// [`process_phantom_blob`](Self::process_phantom_blob).
    pub fn recover(
        &mut self,
        replies: BlobReplies,
        out: &mut VecDeque<RecoveredBlob>,
    ) -> (bool, PartSet) {
        let id = replies.id;
        let Some(task) = self.tasks.remove(&id) else {
            // A peer answered for a blob we never planned; nothing to do.
            warn!(blob = %id, "reply for unplanned blob ignored");
            return (true, PartSet::empty(0));
        };

        // Mirror flavor: any complete replica part reconstructs the blob.
        let part_size = id.part_size() as usize;
        let data = replies.items.iter().find_map(|item| {
            (item.status == ReplyStatus::Ok && item.data.len() == part_size)
                .then(|| item.data.clone())
        });

        match data {
            Some(data) => {
                let is_huge = id.blob_size >= self.min_huge_blob_size;
                out.push_back(RecoveredBlob { id, data, is_huge });
                (true, task.parts)
            }
            None if task.phantom_like => {
                debug!(blob = %id, "no replica data, deferring to phantom verification");
                (false, task.parts)
            }
            None => {
                info!(blob = %id, "blob not recovered this quantum, requeueing");
                self.unreplicated.push_back(id);
                (true, task.parts)
            }
        }
    }

    /// Finalize a blob whose phantom verification completed.
    pub fn process_phantom_blob(
        &mut self,
        id: BlobId,
        _parts: PartSet,
        is_phantom: bool,
        looks_like_phantom: bool,
    ) {
        if is_phantom {
            // Confirmed never durably written: not missing, nothing to
            // requeue.
            debug!(blob = %id, "confirmed phantom");
        } else {
            debug!(
                blob = %id,
                looks_like_phantom,
                "phantom check came back negative, requeueing"
            );
            self.unreplicated.push_back(id);
        }
    }

    /// Flush trailing synthesized entries (metadata-only parts) and count
    /// leftovers.
    pub fn finish(&mut self, out: &mut VecDeque<RecoveredBlob>, info: &mut ReplInfo) {
        for part in self.metadata_parts.drain(..) {
            out.push_back(RecoveredBlob {
                id: part.blob,
                data: Bytes::new(),
                is_huge: false,
            });
            info.metadata_blobs += 1;
        }

        // Tasks never reached by the merge (e.g. all proxies aborted) are
        // carried to the next quantum.
        for (blob, _) in std::mem::take(&mut self.tasks) {
            warn!(blob = %blob, "task received no replies, requeueing");
            self.unreplicated.push_back(blob);
        }
    }

    /// Requeue a blob for a later quantum.
    pub fn push_unreplicated(&mut self, id: BlobId) {
        self.unreplicated.push_back(id);
    }

    /// Hand the unreplicated queue to the quantum result.
    pub fn take_unreplicated(&mut self) -> Vec<BlobId> {
        std::mem::take(&mut self.unreplicated).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReplConfig {
        ReplConfig {
            min_huge_blob_size: 1 << 20,
            ..ReplConfig::default()
        }
    }

    fn blob(step: u32, size: u32) -> BlobId {
        BlobId::new(9, 1, step, 0, 0, size)
    }

    fn parts() -> PartSet {
        let mut p = PartSet::empty(3);
        p.set(0);
        p
    }

    fn ingress() -> Ingress {
        Ingress::new(9, 3)
    }

    fn ok_item(id: BlobId, part_idx: u8, len: usize) -> PeerItem {
        PeerItem {
            part_id: PartId::from_part_idx(id, part_idx),
            status: ReplyStatus::Ok,
            data: Bytes::from(vec![0x5A; len]),
        }
    }

    #[test]
    fn test_recover_from_complete_part() {
        let mut machine = RecoveryMachine::new(&config(), VecDeque::new());
        let id = blob(1, 4096);
        machine.add_task(id, parts(), false, ingress());

        let mut replies = BlobReplies::new(id);
        replies.add(ok_item(id, 1, 4096));

        let mut out = VecDeque::new();
        let (handled, _) = machine.recover(replies, &mut out);

        assert!(handled);
        assert_eq!(out.len(), 1);
        let recovered = &out[0];
        assert_eq!(recovered.id, id);
        assert!(!recovered.is_huge);
        assert!(machine.no_tasks());
    }

    #[test]
    fn test_recover_marks_huge_blob() {
        let mut machine = RecoveryMachine::new(&config(), VecDeque::new());
        let id = blob(1, 2 << 20);
        machine.add_task(id, parts(), false, ingress());

        let mut replies = BlobReplies::new(id);
        replies.add(ok_item(id, 0, 2 << 20));

        let mut out = VecDeque::new();
        let (handled, _) = machine.recover(replies, &mut out);
        assert!(handled);
        assert!(out[0].is_huge);
    }

    #[test]
    fn test_incomplete_part_does_not_recover() {
        let mut machine = RecoveryMachine::new(&config(), VecDeque::new());
        let id = blob(1, 4096);
        machine.add_task(id, parts(), false, ingress());

        let mut replies = BlobReplies::new(id);
        replies.add(ok_item(id, 0, 1000)); // truncated

        let mut out = VecDeque::new();
        let (handled, _) = machine.recover(replies, &mut out);
        assert!(handled, "non-phantom-like failures are requeued, not deferred");
        assert!(out.is_empty());
        assert_eq!(machine.take_unreplicated(), vec![id]);
    }

    #[test]
    fn test_phantom_like_defers_to_verification() {
        let mut machine = RecoveryMachine::new(&config(), VecDeque::new());
        let id = blob(1, 4096);
        machine.add_task(id, parts(), true, ingress());

        let mut out = VecDeque::new();
        let (handled, returned_parts) =
            machine.recover(BlobReplies::new(id), &mut out);

        assert!(!handled);
        assert_eq!(returned_parts.iter().collect::<Vec<_>>(), vec![0]);

        // Verification says it is real after all: requeue.
        machine.process_phantom_blob(id, returned_parts, false, true);
        assert_eq!(machine.take_unreplicated(), vec![id]);
    }

    #[test]
    fn test_confirmed_phantom_not_requeued() {
        let mut machine = RecoveryMachine::new(&config(), VecDeque::new());
        let id = blob(1, 4096);
        machine.add_task(id, parts(), true, ingress());

        let mut out = VecDeque::new();
        let (_, p) = machine.recover(BlobReplies::new(id), &mut out);
        machine.process_phantom_blob(id, p, true, true);
        assert!(machine.take_unreplicated().is_empty());
    }

    #[test]
    fn test_donor_mode_clears_phantom_like() {
        let mut machine = RecoveryMachine::new(&config(), VecDeque::new());
        let id = blob(1, 4096);
        machine.add_task(id, parts(), true, ingress());
        machine.clear_possible_phantom();

        let mut out = VecDeque::new();
        let (handled, _) =
            machine.recover(BlobReplies::new(id), &mut out);
        assert!(handled, "donor mode never defers to phantom checks");
    }

    #[test]
    fn test_finish_emits_metadata_parts() {
        let mut machine = RecoveryMachine::new(&config(), VecDeque::new());
        let id = blob(1, 0);
        machine.add_metadata_part(PartId::from_part_idx(id, 0));

        let mut out = VecDeque::new();
        let mut info = ReplInfo::default();
        machine.finish(&mut out, &mut info);

        assert_eq!(out.len(), 1);
        assert!(out[0].data.is_empty());
        assert_eq!(info.metadata_blobs, 1);
    }

    #[test]
    fn test_finish_requeues_untouched_tasks() {
        let mut machine = RecoveryMachine::new(&config(), VecDeque::new());
        let id = blob(1, 4096);
        machine.add_task(id, parts(), false, ingress());

        let mut out = VecDeque::new();
        machine.finish(&mut out, &mut ReplInfo::default());
        assert_eq!(machine.take_unreplicated(), vec![id]);
    }

    #[test]
    fn test_full_of_tasks() {
        let cfg = ReplConfig {
            max_recovery_tasks: 2,
            ..config()
        };
        let mut machine = RecoveryMachine::new(&cfg, VecDeque::new());
        assert!(!machine.full_of_tasks());
        machine.add_task(blob(1, 10), parts(), false, ingress());
        machine.add_task(blob(2, 10), parts(), false, ingress());
        assert!(machine.full_of_tasks());
    }
}
