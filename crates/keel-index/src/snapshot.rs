//! Immutable snapshots of the local blob index.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use keel_types::{BlobId, PartSet};
use serde::{Deserialize, Serialize};

use crate::{BarrierEssence, Ingress, IndexError};

/// Keep-flag state recorded on an index entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepMode {
    /// No flag: barrier position alone decides.
    #[default]
    Default,
    /// The owner requested this blob be kept past barriers.
    Keep,
    /// The owner explicitly released this blob.
    DoNotKeep,
}

/// One record of the local blob index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRec {
    /// Part-layout metadata for the blob.
    pub ingress: Ingress,
    /// Parts whose data is actually present on the local disk. Distinct
    /// from what the ingress says we *should* hold; the difference is what
    /// replication must fetch.
    pub local_parts: PartSet,
    /// Keep-flag state.
    pub keep_mode: KeepMode,
}

/// An immutable snapshot of the local blob index.
///
/// Cloning is cheap (shared `Arc`); a planner holds one snapshot for at
/// most a plan quantum before refreshing.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    entries: Arc<BTreeMap<BlobId, MemRec>>,
}

impl IndexSnapshot {
    /// Build a snapshot from explicit entries.
    pub fn from_entries(entries: impl IntoIterator<Item = (BlobId, MemRec)>) -> Self {
        Self {
            entries: Arc::new(entries.into_iter().collect()),
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a single record.
    pub fn get(&self, id: &BlobId) -> Option<&MemRec> {
        self.entries.get(id)
    }

    /// Iterate forward starting at `start` (inclusive).
    pub fn iter_from(&self, start: &BlobId) -> impl Iterator<Item = (&BlobId, &MemRec)> {
        self.entries
            .range((Bound::Included(*start), Bound::Unbounded))
    }
}

/// Everything a planning pass needs: the index, the collected barriers,
/// and the keep-flag policy in force when the snapshot was taken.
#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    /// The blob index.
    pub index: IndexSnapshot,
    /// Collected GC barriers.
    pub barriers: Arc<BarrierEssence>,
    /// Whether keep-flags may be consulted.
    pub allow_keep_flags: bool,
}

/// Async seam to the index owner.
///
/// Each call returns a *fresh* consistent snapshot; the planner re-takes
/// one whenever its plan quantum expires to bound snapshot lifetime.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Take a consistent snapshot of the local index and barriers.
    async fn take_snapshot(&self) -> Result<LocalSnapshot, IndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(step: u32) -> BlobId {
        BlobId::new(1, 1, step, 0, 0, 512)
    }

    fn rec() -> MemRec {
        MemRec {
            ingress: Ingress::new(9, 3),
            local_parts: PartSet::empty(3),
            keep_mode: KeepMode::Default,
        }
    }

    #[test]
    fn test_iter_from_is_inclusive_and_ordered() {
        let snap = IndexSnapshot::from_entries([
            (blob(1), rec()),
            (blob(5), rec()),
            (blob(9), rec()),
        ]);

        let keys: Vec<u32> = snap.iter_from(&blob(5)).map(|(id, _)| id.step).collect();
        assert_eq!(keys, vec![5, 9]);

        let keys: Vec<u32> = snap.iter_from(&blob(0)).map(|(id, _)| id.step).collect();
        assert_eq!(keys, vec![1, 5, 9]);
    }

    #[test]
    fn test_iter_from_past_end() {
        let snap = IndexSnapshot::from_entries([(blob(1), rec())]);
        assert_eq!(snap.iter_from(&blob(2)).count(), 0);
    }

    #[test]
    fn test_clone_shares_entries() {
        let snap = IndexSnapshot::from_entries([(blob(1), rec())]);
        let clone = snap.clone();
        assert_eq!(clone.len(), 1);
        assert!(clone.get(&blob(1)).is_some());
    }
}
