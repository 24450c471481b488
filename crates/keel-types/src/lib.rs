//! Shared types and identifiers for Keel.
//!
//! This crate defines the types used across the Keel workspace:
//! identifiers ([`BlobId`], [`PartId`], [`VDiskId`]), byte-range and part
//! bitmaps ([`IntervalSet`], [`PartSet`]), peer reply statuses
//! ([`ReplyStatus`]), recovered-blob records ([`RecoveredBlob`]), and
//! configuration ([`ReplConfig`]).

pub mod intervals;
pub mod parts;

pub use intervals::IntervalSet;
pub use parts::PartSet;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Identifier of an immutable blob within a storage group.
///
/// Field order matters: the derived `Ord` sorts by
/// `(tablet_id, channel, generation, step, cookie)`, which is the order the
/// local index iterates in and the order the merge loop relies on.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlobId {
    /// Owning tablet.
    pub tablet_id: u64,
    /// Storage channel within the tablet.
    pub channel: u8,
    /// Tablet generation that wrote the blob.
    pub generation: u32,
    /// Step within the generation.
    pub step: u32,
    /// Discriminator for blobs written in the same step.
    pub cookie: u32,
    /// Size of the whole blob in bytes.
    pub blob_size: u32,
}

impl BlobId {
    /// Create a blob id.
    pub fn new(
        tablet_id: u64,
        generation: u32,
        step: u32,
        cookie: u32,
        channel: u8,
        blob_size: u32,
    ) -> Self {
        Self {
            tablet_id,
            channel,
            generation,
            step,
            cookie,
            blob_size,
        }
    }

    /// Placement hash: determines which subgroup of disks holds the blob.
    ///
    /// Deterministic across nodes; the size field is excluded so that the
    /// placement of a blob never depends on how large it is.
    pub fn hash(&self) -> u64 {
        let mut input = [0u8; 21];
        input[..8].copy_from_slice(&self.tablet_id.to_le_bytes());
        input[8..12].copy_from_slice(&self.generation.to_le_bytes());
        input[12..16].copy_from_slice(&self.step.to_le_bytes());
        input[16..20].copy_from_slice(&self.cookie.to_le_bytes());
        input[20] = self.channel;
        let hash = blake3::hash(&input);
        u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("8-byte slice"))
    }

    /// Size in bytes of one part of this blob.
    ///
    /// Mirror flavors store a full copy per part; a zero-size blob has
    /// metadata-only parts.
    pub fn part_size(&self) -> u32 {
        self.blob_size
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}:{}:{}:{}:{}]",
            self.tablet_id, self.generation, self.step, self.cookie, self.channel, self.blob_size
        )
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId{self}")
    }
}

/// Identifier of one part of a blob.
///
/// The part index is 1-based on the wire (part 0 means "whole blob" in
/// queries), matching what peers expect in GET requests.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartId {
    /// The blob this part belongs to.
    pub blob: BlobId,
    /// 1-based part index.
    pub part_index: u8,
}

impl PartId {
    /// Create a part id from a 0-based part index.
    pub fn from_part_idx(blob: BlobId, part_idx: u8) -> Self {
        Self {
            blob,
            part_index: part_idx + 1,
        }
    }

    /// The 0-based part index.
    pub fn part_idx(&self) -> u8 {
        debug_assert!(self.part_index >= 1);
        self.part_index - 1
    }

    /// Size in bytes of this part's data.
    pub fn part_size(&self) -> u32 {
        self.blob.part_size()
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}p{}", self.blob, self.part_index)
    }
}

impl fmt::Debug for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartId({self})")
    }
}

/// Identifier of a disk (vdisk) within a storage group.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VDiskId {
    /// Group the disk belongs to.
    pub group_id: u32,
    /// Group generation (bumped on reconfiguration).
    pub group_generation: u32,
    /// Ring (fail realm) index.
    pub ring: u8,
    /// Fail domain index within the ring.
    pub fail_domain: u8,
    /// Disk index within the fail domain.
    pub vdisk: u8,
}

impl VDiskId {
    /// Create a vdisk id.
    pub fn new(group_id: u32, group_generation: u32, ring: u8, fail_domain: u8, vdisk: u8) -> Self {
        Self {
            group_id,
            group_generation,
            ring,
            fail_domain,
            vdisk,
        }
    }
}

impl fmt::Display for VDiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:x}:{}:{}:{}:{}]",
            self.group_id, self.group_generation, self.ring, self.fail_domain, self.vdisk
        )
    }
}

impl fmt::Debug for VDiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VDiskId{self}")
    }
}

// ---------------------------------------------------------------------------
// Peer replies and recovered blobs
// ---------------------------------------------------------------------------

/// Status a peer disk attaches to one part in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// The part (or requested byte range) is present; data follows.
    Ok,
    /// The disk positively does not hold the part.
    NoData,
    /// The disk knows the part was written but cannot serve it yet
    /// (e.g. it is itself mid-replication).
    NotYet,
    /// Transient I/O or transport failure.
    Error,
}

/// A blob reconstructed from peer data, ready to be persisted locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredBlob {
    /// The blob's identifier.
    pub id: BlobId,
    /// The reconstructed payload (empty for metadata-only blobs).
    pub data: Bytes,
    /// Huge blobs bypass the SST writer and go through the out-of-band
    /// huge-blob channel.
    pub is_huge: bool,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Slow-disk handling mode for the get strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccelerationMode {
    /// Query the delay oracle and skip the single disk whose predicted
    /// latency is more than twice the next-worst.
    #[default]
    SkipOneSlowest,
    /// Trust externally provided slow marks unchanged.
    SkipMarked,
}

/// Replication engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplConfig {
    /// Wall-time budget for a single planning pass before the planner
    /// refreshes its snapshot.
    pub plan_quantum: Duration,
    /// Byte cap on the sum of part sizes planned into one quantum.
    pub max_quantum_bytes: u64,
    /// Maximum huge-blob writes in flight at once.
    pub huge_blobs_in_flight_max: u32,
    /// Blobs at or above this size bypass the SST writer.
    pub min_huge_blob_size: u32,
    /// Task-count cap in the recovery machine.
    pub max_recovery_tasks: usize,
    /// Slow-disk handling mode.
    pub acceleration_mode: AccelerationMode,
    /// Whether the barrier essence may consult keep-flags.
    pub allow_keep_flags: bool,
    /// Byte rate for the block-device write quoter.
    pub pdisk_write_rate: u64,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            plan_quantum: Duration::from_millis(50),
            max_quantum_bytes: 384 << 20, // 384 MB
            huge_blobs_in_flight_max: 3,
            min_huge_blob_size: 512 << 10, // 512 KB
            max_recovery_tasks: 8192,
            acceleration_mode: AccelerationMode::default(),
            allow_keep_flags: true,
            pdisk_write_rate: 100 << 20, // 100 MB/s
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
