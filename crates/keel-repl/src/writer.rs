//! Streaming SST writer with a commit fencepost.
//!
//! Recovered blobs are packed into chunk-sized buffers, written to the
//! block device, and sealed with one commit record per SST. The writer is
//! a pull-style state machine: the job inspects [`SstWriter::state`], asks
//! for the pending block-device or commit message, and feeds acks back in.
//! Chunk writes carry their byte size so the job can route them through
//! the write-rate quoter.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use keel_types::{BlobId, RecoveredBlob};
use tracing::{debug, warn};

/// States of the SST writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// No SST in progress.
    Stopped,
    /// Accepting blobs.
    Collect,
    /// A block-device message is ready to be taken.
    PdiskMessagePending,
    /// Waiting for a block-device ack.
    NotReady,
    /// The SST is fully on disk; a commit record is ready to be taken.
    CommitPending,
    /// Waiting for the commit ack.
    WaitingForCommit,
    /// Unrecoverable failure; fatal to the job.
    Error,
}

/// A block-device operation emitted by the writer.
#[derive(Debug, Clone)]
pub enum PdiskMsg {
    /// Reserve `count` chunks for upcoming writes.
    ChunkReserve {
        /// Number of chunks to reserve.
        count: u32,
    },
    /// Write one buffer into a reserved chunk.
    ChunkWrite {
        /// Target chunk.
        chunk_idx: u32,
        /// Payload.
        data: Bytes,
    },
}

/// Location of one blob inside a written SST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstEntry {
    /// The blob.
    pub id: BlobId,
    /// Chunk holding the blob's data.
    pub chunk_idx: u32,
    /// Byte offset within the chunk.
    pub offset: u32,
    /// Data length (zero for metadata-only entries).
    pub len: u32,
}

/// The commit record sealing one SST.
#[derive(Debug, Clone)]
pub struct CommitMsg {
    /// Every blob in the SST, in key order.
    pub entries: Vec<SstEntry>,
    /// Chunks the SST occupies.
    pub chunks: Vec<u32>,
}

/// Streaming writer for one SST at a time.
#[derive(Debug)]
pub struct SstWriter {
    state: WriterState,
    /// Payload capacity of one chunk.
    chunk_payload: usize,
    /// SST is sealed once it spans this many chunks.
    max_chunks_per_sst: usize,

    /// Chunks reserved by the block device and not yet written.
    reserved_chunks: VecDeque<u32>,
    /// Buffer being filled for the current chunk.
    buffer: BytesMut,
    /// Entries of the SST under construction.
    entries: Vec<SstEntry>,
    /// Chunks already written for this SST.
    written_chunks: Vec<u32>,
    /// Entries buffered but not yet flushed get patched with their chunk
    /// index at flush time.
    unflushed_from: usize,

    /// A flush is required before more blobs are accepted.
    flush_wanted: bool,
    /// `finish` was called: flush and commit.
    finishing: bool,
}

impl SstWriter {
    /// Create a writer.
    pub fn new(chunk_payload: usize, max_chunks_per_sst: usize) -> Self {
        Self {
            state: WriterState::Stopped,
            chunk_payload,
            max_chunks_per_sst,
            reserved_chunks: VecDeque::new(),
            buffer: BytesMut::new(),
            entries: Vec::new(),
            written_chunks: Vec::new(),
            unflushed_from: 0,
            flush_wanted: false,
            finishing: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Start a new SST. Only valid when stopped.
    pub fn begin(&mut self) {
        assert_eq!(self.state, WriterState::Stopped);
        self.entries.clear();
        self.written_chunks.clear();
        self.buffer.clear();
        self.unflushed_from = 0;
        self.flush_wanted = false;
        self.finishing = false;
        self.state = WriterState::Collect;
        debug!("sst writer: new sst started");
    }

    /// Offer a recovered blob.
    ///
    /// Returns false when the writer must flush or seal first; the caller
    /// drives the state machine and retries once the state is `Collect`
    /// again.
    pub fn add_recovered_blob(&mut self, blob: &RecoveredBlob) -> bool {
        assert_eq!(self.state, WriterState::Collect);
        debug_assert!(!blob.is_huge, "huge blobs bypass the sst writer");
        debug_assert!(
            self.entries.last().map_or(true, |e| e.id < blob.id),
            "sst entries must arrive in ascending key order"
        );

        if blob.data.len() > self.chunk_payload {
            warn!(blob = %blob.id, len = blob.data.len(), "blob exceeds chunk payload");
            self.state = WriterState::Error;
            return false;
        }

        // Seal the SST once it spans enough chunks.
        if self.written_chunks.len() >= self.max_chunks_per_sst {
            self.finishing = true;
            self.flush_wanted = !self.buffer.is_empty();
            self.step();
            return false;
        }

        // Flush before this blob if it does not fit the current buffer.
        if !self.buffer.is_empty() && self.buffer.len() + blob.data.len() > self.chunk_payload {
            self.flush_wanted = true;
            self.step();
            return false;
        }

        self.entries.push(SstEntry {
            id: blob.id,
            chunk_idx: u32::MAX, // patched at flush
            offset: self.buffer.len() as u32,
            len: blob.data.len() as u32,
        });
        self.buffer.extend_from_slice(&blob.data);
        true
    }

    /// Seal the SST: flush the tail buffer and emit the commit record.
    pub fn finish(&mut self) {
        assert!(matches!(
            self.state,
            WriterState::Collect | WriterState::Stopped
        ));
        if self.state == WriterState::Stopped {
            return;
        }
        self.finishing = true;
        self.flush_wanted = !self.buffer.is_empty();
        self.step();
    }

    /// Take the pending block-device message. Valid in
    /// `PdiskMessagePending`; the state moves to `NotReady` until the ack.
    pub fn get_pending_pdisk_msg(&mut self) -> PdiskMsg {
        assert_eq!(self.state, WriterState::PdiskMessagePending);
        self.state = WriterState::NotReady;

        if self.reserved_chunks.is_empty() {
            return PdiskMsg::ChunkReserve { count: 1 };
        }

        let chunk_idx = self.reserved_chunks.pop_front().expect("checked non-empty");
        let data = self.buffer.split().freeze();

        // Patch buffered entries with their now-known chunk.
        for entry in &mut self.entries[self.unflushed_from..] {
            entry.chunk_idx = chunk_idx;
        }
        self.unflushed_from = self.entries.len();
        self.written_chunks.push(chunk_idx);
        self.flush_wanted = false;

        debug!(chunk_idx, bytes = data.len(), "sst writer: chunk write emitted");
        PdiskMsg::ChunkWrite { chunk_idx, data }
    }

    /// Apply a chunk reservation ack.
    pub fn apply_chunk_reserved(&mut self, chunk_ids: &[u32]) {
        assert_eq!(self.state, WriterState::NotReady);
        if chunk_ids.is_empty() {
            warn!("block device reserved no chunks");
            self.state = WriterState::Error;
            return;
        }
        self.reserved_chunks.extend(chunk_ids.iter().copied());
        self.step_from_not_ready();
    }

    /// Apply a chunk write ack.
    pub fn apply_chunk_written(&mut self, _chunk_idx: u32) {
        assert_eq!(self.state, WriterState::NotReady);
        self.step_from_not_ready();
    }

    /// Take the pending commit record. Valid in `CommitPending`; the state
    /// moves to `WaitingForCommit` until the ack.
    pub fn get_pending_commit_msg(&mut self) -> CommitMsg {
        assert_eq!(self.state, WriterState::CommitPending);
        self.state = WriterState::WaitingForCommit;
        CommitMsg {
            entries: std::mem::take(&mut self.entries),
            chunks: self.written_chunks.clone(),
        }
    }

    /// Apply the commit ack; the writer resets to `Stopped`.
    pub fn apply_commit(&mut self) {
        assert_eq!(self.state, WriterState::WaitingForCommit);
        self.unflushed_from = 0;
        self.state = WriterState::Stopped;
        debug!(chunks = self.written_chunks.len(), "sst writer: sst committed");
    }

    /// Decide the next state while collecting.
    fn step(&mut self) {
        if self.flush_wanted {
            // A write (possibly preceded by a reserve) must go out.
            self.state = WriterState::PdiskMessagePending;
        } else if self.finishing {
            if self.entries.is_empty() {
                // Nothing was ever added: no commit needed.
                self.state = WriterState::Stopped;
            } else {
                self.state = WriterState::CommitPending;
            }
        } else {
            self.state = WriterState::Collect;
        }
    }

    fn step_from_not_ready(&mut self) {
        if self.flush_wanted || (self.finishing && !self.buffer.is_empty()) {
            self.state = WriterState::PdiskMessagePending;
        } else if self.finishing {
            self.state = if self.entries.is_empty() && self.unflushed_from == 0 {
                WriterState::Stopped
            } else {
                WriterState::CommitPending
            };
        } else {
            self.state = WriterState::Collect;
        }
    }
}
