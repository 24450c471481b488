//! Local blob index snapshots, ingress metadata, and GC barriers.
//!
//! This crate provides the planner's view of local state:
//!
//! - [`Ingress`] — per-blob part-layout metadata: which parts each subgroup
//!   disk is known to hold, and which parts the local disk must hold.
//! - [`IndexSnapshot`] / [`MemRec`] — an immutable, cheaply clonable
//!   snapshot of the local blob index with forward iteration.
//! - [`BarrierEssence`] — collected garbage-collection barriers and
//!   keep-flag evaluation.
//! - [`SnapshotSource`] — the async seam to the index owner.

mod barriers;
mod error;
mod ingress;
mod snapshot;

pub use barriers::{Barrier, BarrierEssence, KeepStatus};
pub use error::IndexError;
pub use ingress::Ingress;
pub use snapshot::{IndexSnapshot, KeepMode, LocalSnapshot, MemRec, SnapshotSource};
