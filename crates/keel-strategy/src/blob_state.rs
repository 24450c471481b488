//! Aggregation state for one blob under recovery.

use bytes::{Bytes, BytesMut};
use keel_types::{IntervalSet, PartId, ReplyStatus};
use smallvec::SmallVec;
use tracing::trace;

/// What we know about one part on one disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Situation {
    /// No reply yet.
    Unknown,
    /// The disk returned the requested data.
    Present,
    /// The disk positively reported it does not hold the part.
    Absent,
    /// The disk knows of the part but cannot serve it.
    Lost,
    /// The disk failed with a transient error.
    Error,
    /// A put was sent (write path only; never observed by the get path).
    Sent,
}

/// A fixed-size byte buffer written in fragments.
///
/// Backs both per-part and whole-blob data. Which ranges are actually
/// valid is tracked separately by the owner's [`IntervalSet`]s.
#[derive(Debug, Clone, Default)]
pub struct DataBuffer {
    bytes: BytesMut,
}

impl DataBuffer {
    /// Create a zeroed buffer of `size` bytes.
    pub fn new(size: usize) -> Self {
        let mut bytes = BytesMut::with_capacity(size);
        bytes.resize(size, 0);
        Self { bytes }
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let begin = offset as usize;
        let end = begin + data.len();
        debug_assert!(end <= self.bytes.len());
        self.bytes[begin..end].copy_from_slice(data);
    }

    /// Borrow the bytes in `[begin, end)`.
    pub fn read(&self, begin: u64, end: u64) -> &[u8] {
        &self.bytes[begin as usize..end as usize]
    }

    /// Freeze the whole buffer into an immutable payload.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bytes)
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer has zero length.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Per-disk, per-part reply tracking.
#[derive(Debug, Clone)]
pub struct DiskPartState {
    /// Current knowledge about the part on this disk.
    pub situation: Situation,
    /// Byte ranges requested from this disk and not yet answered.
    pub requested: IntervalSet,
}

impl Default for DiskPartState {
    fn default() -> Self {
        Self {
            situation: Situation::Unknown,
            requested: IntervalSet::new(),
        }
    }
}

/// State of one subgroup disk.
#[derive(Debug, Clone)]
pub struct DiskState {
    /// The disk's order number within the group.
    pub order_number: u32,
    /// Marked slow by the acceleration logic; deprioritized in traversal.
    pub is_slow: bool,
    /// Reply tracking per part index.
    pub parts: SmallVec<[DiskPartState; 3]>,
}

/// Byte ranges and data collected for one part, merged across disks.
#[derive(Debug, Clone)]
struct PartState {
    here: IntervalSet,
    data: DataBuffer,
}

/// The aggregation buffer for one blob under recovery.
///
/// Invariants:
/// - `whole.here ⊆ whole.needed`.
/// - `whole_situation == Present` iff `whole.needed ⊆ whole.here`.
/// - A transition into `Error` or `Absent` is terminal within a quantum.
#[derive(Debug, Clone)]
pub struct BlobState {
    /// The blob being recovered.
    pub id: keel_types::BlobId,
    /// Per-subgroup-position disk state, indexed by subgroup index.
    pub disks: SmallVec<[DiskState; 9]>,
    /// Aggregated outcome for the whole blob.
    pub whole_situation: Situation,
    /// Tentatively missing; pending cluster-wide phantom verification.
    pub looks_like_phantom: bool,

    parts: SmallVec<[PartState; 3]>,
    needed: IntervalSet,
    whole_here: IntervalSet,
    whole_data: DataBuffer,
}

impl BlobState {
    /// Create state for a blob mapped onto `subgroup` (disk order numbers),
    /// needing the byte ranges in `needed`.
    pub fn new(
        id: keel_types::BlobId,
        needed: IntervalSet,
        subgroup: &[u32],
        num_parts: u8,
    ) -> Self {
        let part_size = id.part_size() as usize;
        Self {
            id,
            disks: subgroup
                .iter()
                .map(|&order_number| DiskState {
                    order_number,
                    is_slow: false,
                    parts: (0..num_parts).map(|_| DiskPartState::default()).collect(),
                })
                .collect(),
            whole_situation: Situation::Unknown,
            looks_like_phantom: false,
            parts: (0..num_parts)
                .map(|_| PartState {
                    here: IntervalSet::new(),
                    data: DataBuffer::new(part_size),
                })
                .collect(),
            needed,
            whole_here: IntervalSet::new(),
            whole_data: DataBuffer::new(part_size),
        }
    }

    /// Number of parts per blob.
    pub fn num_parts(&self) -> u8 {
        self.parts.len() as u8
    }

    /// Ranges the caller requires.
    pub fn needed(&self) -> &IntervalSet {
        &self.needed
    }

    /// Ranges already reconstructed into the whole-blob buffer.
    pub fn whole_here(&self) -> &IntervalSet {
        &self.whole_here
    }

    /// Ranges collected for `part_idx` across all disks.
    pub fn part_here(&self, part_idx: u8) -> &IntervalSet {
        &self.parts[part_idx as usize].here
    }

    /// Whether every needed byte has been reconstructed.
    pub fn is_complete(&self) -> bool {
        self.needed.is_subset_of(&self.whole_here)
    }

    /// The reconstructed payload. Only meaningful once complete.
    pub fn whole_data(&self) -> Bytes {
        self.whole_data.to_bytes()
    }

    /// Union a received fragment into a part's buffer.
    pub fn merge_part_here(&mut self, part_idx: u8, offset: u64, data: &[u8]) {
        let part = &mut self.parts[part_idx as usize];
        part.data.write(offset, data);
        part.here.add(offset, offset + data.len() as u64);
    }

    /// Copy everything collected per part but not yet in the whole-blob
    /// buffer. Mirror flavor: every part is a full copy, so part offsets
    /// and whole offsets coincide.
    ///
    /// Returns true when the blob became complete.
    pub fn merge_parts_into_whole(&mut self) -> bool {
        for part_idx in 0..self.parts.len() {
            if self.parts[part_idx].here.is_subset_of(&self.whole_here) {
                continue;
            }
            let mut fresh = self.parts[part_idx].here.clone();
            fresh.subtract(&self.whole_here);
            for (begin, end) in fresh.iter().collect::<Vec<_>>() {
                let chunk = self.parts[part_idx].data.read(begin, end).to_vec();
                self.whole_data.write(begin, &chunk);
            }
            self.whole_here.union_with(&fresh);
        }
        // Clamp to what was asked for; bytes outside `needed` don't count.
        let mut extra = self.whole_here.clone();
        extra.subtract(&self.needed);
        if !extra.is_empty() {
            self.whole_here.subtract(&extra);
        }
        self.is_complete()
    }

    /// Apply one peer reply for `(order_number, part_id)`.
    pub fn process_reply(
        &mut self,
        order_number: u32,
        part_id: PartId,
        status: ReplyStatus,
        offset: u64,
        data: &[u8],
    ) {
        let part_idx = part_id.part_idx();
        let Some(disk_idx) = self.disks.iter().position(|d| d.order_number == order_number)
        else {
            trace!(%part_id, order_number, "reply from disk outside subgroup, ignored");
            return;
        };

        match status {
            ReplyStatus::Ok => {
                if !data.is_empty() {
                    self.merge_part_here(part_idx, offset, data);
                }
                let disk_part = &mut self.disks[disk_idx].parts[part_idx as usize];
                let mut answered = IntervalSet::from_range(offset, offset + data.len() as u64);
                answered.union_with(&self.parts[part_idx as usize].here);
                disk_part.requested.subtract(&answered);
                disk_part.situation = Situation::Present;
            }
            ReplyStatus::NoData => {
                let disk_part = &mut self.disks[disk_idx].parts[part_idx as usize];
                disk_part.requested = IntervalSet::new();
                disk_part.situation = Situation::Absent;
            }
            ReplyStatus::NotYet => {
                let disk_part = &mut self.disks[disk_idx].parts[part_idx as usize];
                disk_part.requested = IntervalSet::new();
                disk_part.situation = Situation::Lost;
            }
            ReplyStatus::Error => {
                let disk_part = &mut self.disks[disk_idx].parts[part_idx as usize];
                disk_part.requested = IntervalSet::new();
                disk_part.situation = Situation::Error;
            }
        }
    }

    /// Find the worst and next-to-worst predicted disk latency over the
    /// subgroup.
    ///
    /// Returns `(worst_subgroup_idx, worst_ns, next_to_worst_ns)`.
    pub fn get_worst_predicted_delays(
        &self,
        estimator: &dyn keel_topology::DelayEstimator,
    ) -> (Option<usize>, u64, u64) {
        let mut worst_idx = None;
        let mut worst = 0u64;
        let mut next = 0u64;
        for (idx, disk) in self.disks.iter().enumerate() {
            let ns = estimator.predicted_delay_ns(disk.order_number);
            if ns > worst {
                next = worst;
                worst = ns;
                worst_idx = Some(idx);
            } else if ns > next {
                next = ns;
            }
        }
        (worst_idx, worst, next)
    }
}
