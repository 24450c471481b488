//! Message contracts between a replication job and its collaborators.
//!
//! The job is a single cooperative task driven by [`ReplEvent`]s arriving
//! on one channel; everything it asks of the outside world goes out on the
//! typed channels bundled in [`ReplEnv`](crate::job::ReplEnv).

use bytes::Bytes;
use keel_types::{BlobId, PartId, ReplyStatus};

use crate::error::ReplError;
use crate::info::ReplInfo;
use crate::planner::PlanFinished;
use crate::writer::{CommitMsg, PdiskMsg};

/// One `(part, status, data)` tuple from a peer's reply run.
#[derive(Debug, Clone)]
pub struct PeerItem {
    /// The part the peer is answering for.
    pub part_id: PartId,
    /// Reply status for this part.
    pub status: ReplyStatus,
    /// Part payload; empty unless `status` is [`ReplyStatus::Ok`].
    pub data: Bytes,
}

/// Per-blob answer from a phantom-verification GET.
#[derive(Debug, Clone, Copy)]
pub struct PhantomResponse {
    /// The queried blob.
    pub id: BlobId,
    /// `NoData` means the cluster confirms the blob was never durably
    /// written.
    pub status: ReplyStatus,
    /// The cluster GET path's own phantom assessment.
    pub looks_like_phantom: bool,
}

/// Events delivered to a replication job.
#[derive(Debug)]
pub enum ReplEvent {
    /// The planner finished one planning pass.
    PlanFinished(Box<PlanFinished>),
    /// The planner failed; the job terminates.
    PlanFailed(ReplError),
    /// Admission control grants the job its execution token.
    Resume,
    /// A batch of items from one peer proxy (or its failure).
    ProxyNext {
        /// Index into the job's proxy set.
        proxy_slot: usize,
        /// Fetched items, sorted by blob id.
        result: Result<Vec<PeerItem>, ReplError>,
    },
    /// The block device reserved chunks for the writer.
    ChunkReserved {
        /// Reserved chunk indices.
        chunk_ids: Vec<u32>,
    },
    /// The block device acknowledged one chunk write.
    ChunkWritten {
        /// The chunk that was written.
        chunk_idx: u32,
    },
    /// The index layer committed the writer's SST.
    SstCommitted,
    /// One huge-blob write completed.
    HugeBlobWritten,
    /// Reply to a batched phantom-verification GET.
    PhantomGetResult {
        /// Request cookie.
        cookie: u64,
        /// Per-blob verdicts.
        responses: Vec<PhantomResponse>,
    },
    /// The owner durably recorded the detected phantom blobs.
    DetectedPhantomBlobCommitted,
    /// Shut down immediately.
    Poison,
}

/// Messages the job sends to its owner.
#[derive(Debug)]
pub enum OwnerMsg {
    /// Planning produced work; the job now waits for a [`ReplEvent::Resume`]
    /// token.
    ReplStarted,
    /// Blobs confirmed phantom; the owner must record them and reply with
    /// [`ReplEvent::DetectedPhantomBlobCommitted`].
    DetectedPhantomBlob(Vec<BlobId>),
    /// The quantum is complete.
    ReplFinished(Box<ReplInfo>),
}

/// A batched phantom-verification GET through the cluster's regular read
/// path.
#[derive(Debug, Clone)]
pub struct PhantomGetRequest {
    /// Cookie echoed back in [`ReplEvent::PhantomGetResult`].
    pub cookie: u64,
    /// Blobs to verify; all share one tablet, at most 32 per request.
    pub queries: Vec<BlobId>,
    /// Always true: tells the read path to report phantom likelihood
    /// instead of penalizing missing data.
    pub phantom_check: bool,
}

/// A write or reserve operation bound for the block device.
#[derive(Debug)]
pub struct PdiskRequest {
    /// The operation.
    pub msg: PdiskMsg,
}

/// An SST commit record bound for the index layer.
#[derive(Debug)]
pub struct CommitRequest {
    /// The commit payload.
    pub msg: CommitMsg,
}

/// A recovered huge blob, routed around the SST writer.
#[derive(Debug, Clone)]
pub struct RecoveredHugeBlob {
    /// The blob's identifier.
    pub id: BlobId,
    /// The payload.
    pub data: Bytes,
}
