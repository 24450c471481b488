//! Pull-style iterator over one peer disk's contribution.
//!
//! A [`VDiskProxy`] is seeded with the blobs a peer is expected to answer
//! for, fetches them in bounded batches through the [`PeerReader`] seam,
//! and exposes the replies as an iterator ordered by blob id — the shape
//! the job's k-way merge needs.

use bytes::Bytes;
use keel_types::{BlobId, VDiskId};
use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::error::ReplError;
use crate::events::PeerItem;

/// Soft byte limit for one proxy batch.
const BATCH_BYTES: u64 = 1 << 20;
/// Blob-count limit for one proxy batch.
const BATCH_BLOBS: usize = 64;

/// Transfer statistics for one proxy, summed into the quantum result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStat {
    /// Batches requested from the peer.
    pub batches_requested: u64,
    /// Reply items received.
    pub items_received: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Transport-level failures observed.
    pub transient_errors: u64,
}

impl ProxyStat {
    /// Sum another proxy's stats into this one.
    pub fn merge(&mut self, other: &ProxyStat) {
        self.batches_requested += other.batches_requested;
        self.items_received += other.items_received;
        self.bytes_received += other.bytes_received;
        self.transient_errors += other.transient_errors;
    }
}

/// The async seam to the peer transport.
///
/// `fetch` reads the listed blobs from one peer disk and returns every
/// part the peer holds for them, as `(part, status, data)` items sorted by
/// blob id. Implementations enforce their own deadlines and surface
/// failures as `Err` or per-item [`ReplyStatus::Error`](keel_types::ReplyStatus::Error).
#[async_trait::async_trait]
pub trait PeerReader: Send + Sync + 'static {
    /// Fetch the peer's contribution for `blobs` (id + expected reply
    /// size).
    async fn fetch(
        &self,
        vdisk: VDiskId,
        blobs: Vec<(BlobId, u32)>,
    ) -> Result<Vec<PeerItem>, ReplError>;
}

/// Iterator over one peer's replies, refilled batch by batch.
#[derive(Debug)]
pub struct VDiskProxy {
    /// The peer disk this proxy reads from.
    pub vdisk_id: VDiskId,
    /// Seeded requests: `(blob, expected_reply_size)`, sorted by blob id.
    seeds: Vec<(BlobId, u32)>,
    /// Position of the next batch's first seed.
    next_seed: usize,
    /// Prefetched reply items, ascending by blob id.
    items: VecDeque<PeerItem>,
    /// A batch is currently in flight.
    awaiting: bool,
    /// The peer failed at transport level; no further batches are fetched.
    aborted: bool,
    /// Transfer statistics.
    pub stat: ProxyStat,
}

impl VDiskProxy {
    /// Create a proxy for a peer disk.
    pub fn new(vdisk_id: VDiskId) -> Self {
        Self {
            vdisk_id,
            seeds: Vec::new(),
            next_seed: 0,
            items: VecDeque::new(),
            awaiting: false,
            aborted: false,
            stat: ProxyStat::default(),
        }
    }

    /// Seed the proxy with a blob it is expected to answer for.
    ///
    /// Callers seed in ascending blob order (the planner iterates the
    /// index forward), which is what keeps replies mergeable.
    pub fn put(&mut self, blob: BlobId, expected_reply_size: u32) {
        debug_assert!(
            self.seeds.last().map_or(true, |(last, _)| *last <= blob),
            "proxy seeds must arrive in ascending blob order"
        );
        if self.seeds.last().map(|(last, _)| *last) == Some(blob) {
            return; // one request per blob
        }
        self.seeds.push((blob, expected_reply_size));
    }

    /// Whether the proxy was seeded at all.
    pub fn has_seeds(&self) -> bool {
        !self.seeds.is_empty()
    }

    /// Whether the proxy currently has a reply item to consume.
    pub fn valid(&self) -> bool {
        !self.items.is_empty()
    }

    /// Blob id of the current reply item.
    pub fn current_blob(&self) -> Option<BlobId> {
        self.items.front().map(|item| item.part_id.blob)
    }

    /// Take the current reply item.
    pub fn take_item(&mut self) -> Option<PeerItem> {
        self.items.pop_front()
    }

    /// All replies delivered and no more batches to fetch.
    pub fn is_eof(&self) -> bool {
        self.items.is_empty() && (self.aborted || self.next_seed >= self.seeds.len())
    }

    /// Whether a batch request is outstanding.
    pub fn is_awaiting(&self) -> bool {
        self.awaiting
    }

    /// No transport-level failures were observed on this proxy.
    pub fn no_transient_errors(&self) -> bool {
        self.stat.transient_errors == 0
    }

    /// Claim the next batch of seeds to fetch, bounded by bytes and count.
    ///
    /// Returns `None` when everything was already requested. The caller
    /// dispatches the fetch and later feeds the result to
    /// [`handle_next`](Self::handle_next).
    pub fn next_batch(&mut self) -> Option<Vec<(BlobId, u32)>> {
        if self.aborted || self.awaiting || self.next_seed >= self.seeds.len() {
            return None;
        }

        let mut batch = Vec::new();
        let mut bytes = 0u64;
        while self.next_seed < self.seeds.len() && batch.len() < BATCH_BLOBS {
            let (blob, expected) = self.seeds[self.next_seed];
            if !batch.is_empty() && bytes + expected as u64 > BATCH_BYTES {
                break;
            }
            batch.push((blob, expected));
            bytes += expected as u64;
            self.next_seed += 1;
        }

        self.awaiting = true;
        self.stat.batches_requested += 1;
        trace!(vdisk = %self.vdisk_id, blobs = batch.len(), bytes, "proxy batch requested");
        Some(batch)
    }

    /// Apply a fetched batch (or its failure).
    pub fn handle_next(&mut self, result: Result<Vec<PeerItem>, ReplError>) {
        debug_assert!(self.awaiting);
        self.awaiting = false;

        match result {
            Ok(batch) => {
                debug_assert!(
                    batch
                        .windows(2)
                        .all(|w| w[0].part_id.blob <= w[1].part_id.blob),
                    "peer replies must be sorted by blob id"
                );
                for item in batch {
                    self.stat.items_received += 1;
                    self.stat.bytes_received += item.data.len() as u64;
                    self.items.push_back(item);
                }
            }
            Err(e) => {
                // Give up on this peer for the quantum; blobs it did not
                // answer for simply lack its contribution.
                debug!(vdisk = %self.vdisk_id, error = %e, "peer fetch failed, aborting proxy");
                self.stat.transient_errors += 1;
                self.aborted = true;
            }
        }
    }
}
