//! Error types for replication jobs.

/// Errors that can occur while running a replication job.
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    /// The local index owner failed to produce a snapshot.
    #[error("index error: {0}")]
    Index(#[from] keel_index::IndexError),

    /// A peer fetch failed at the transport level.
    #[error("peer transport error: {0}")]
    PeerTransport(String),

    /// The SST writer or block device reported an unrecoverable failure.
    /// Fatal to the job; outer supervision restarts replication.
    #[error("writer failure: {0}")]
    WriterFailure(String),

    /// An outbound channel was closed while the job was still running.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
