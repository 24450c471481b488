//! Error types for index access.

/// Errors surfaced by the index owner.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The index owner is gone or shutting down.
    #[error("index snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
}
