//! Group topology, subgroup placement, and quorum predicates for Keel.
//!
//! This crate provides:
//!
//! - [`GroupTopology`] / [`GroupInfo`] — the fixed geometry of a storage
//!   group (rings × fail domains × disks) and deterministic blob-to-subgroup
//!   placement.
//! - [`SubgroupMap`] — a bitmap over the disks of one blob's subgroup.
//! - [`QuorumChecker`] — the mirror-3dc fail-model and write-quorum
//!   predicates.
//! - [`NodeLayout`] / [`Location`] — the physical placement hierarchy used
//!   to prefer nearby replicas.
//! - [`DelayEstimator`] — seam to the per-disk predicted-latency oracle.

mod group;
mod layout;
mod quorum;

pub use group::{GroupInfo, GroupTopology, SubgroupOrderNums};
pub use layout::{DelayEstimator, Location, NoDelayData, NodeLayout};
pub use quorum::{QuorumChecker, SubgroupMap};
