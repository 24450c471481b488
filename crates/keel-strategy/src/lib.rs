//! Per-blob reply aggregation and the mirror-3dc get strategy.
//!
//! This crate provides:
//!
//! - [`BlobState`] — the aggregation buffer for one blob under recovery:
//!   which disks answered what, which byte ranges are held, which are still
//!   outstanding.
//! - [`Mirror3dcGetStrategy`] — the decision logic that, given the current
//!   state of peer replies, picks the next disk to query, skips slow disks,
//!   and classifies the blob as recovered, absent, or lost.
//! - [`DiskRequests`] — the batch of peer GETs one strategy step emits.

mod blob_state;
mod mirror3dc;
mod requests;

pub use blob_state::{BlobState, DataBuffer, DiskPartState, DiskState, Situation};
pub use mirror3dc::{Mirror3dcGetStrategy, StrategyOutcome};
pub use requests::{DiskRequests, GetRequest};
