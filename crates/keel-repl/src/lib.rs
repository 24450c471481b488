//! Replication jobs for Keel.
//!
//! This crate restores blobs the local disk is supposed to hold but is
//! missing, one bounded quantum at a time:
//!
//! - [`ReplPlanner`] — scans the local index and fills a
//!   [`RecoveryMachine`] within time and byte budgets.
//! - [`VDiskProxy`] — pull-style iterator over one peer disk's
//!   contribution, fetched in bounded batches.
//! - [`RecoveryMachine`] — reconstructs blobs from merged peer replies and
//!   tracks phantom candidates and unreplicated leftovers.
//! - [`SstWriter`] — streams recovered blobs into chunk-based SSTs with a
//!   commit fencepost.
//! - [`ReplQuoter`] — token-bucket admission for replication writes.
//! - [`ReplJob`] — the state machine tying it all together, including
//!   batched phantom verification and donor mode.

pub mod error;
pub mod events;
pub mod info;
pub mod job;
pub mod machine;
pub mod planner;
pub mod proxy;
pub mod quoter;
pub mod writer;

pub use error::ReplError;
pub use events::{
    CommitRequest, OwnerMsg, PdiskRequest, PeerItem, PhantomGetRequest, PhantomResponse,
    RecoveredHugeBlob, ReplEvent,
};
pub use info::{ReplInfo, ReplMonGroup, TimeAccount, TimeState, TimeStats};
pub use job::{ReplEnv, ReplJob, ReplJobOptions};
pub use machine::{BlobReplies, RecoveryMachine, RecoveryTask};
pub use planner::{PlanFinished, ReplPlanner};
pub use proxy::{PeerReader, ProxyStat, VDiskProxy};
pub use quoter::ReplQuoter;
pub use writer::{CommitMsg, PdiskMsg, SstEntry, SstWriter, WriterState};
