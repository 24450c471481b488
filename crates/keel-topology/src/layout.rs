//! Physical placement hierarchy and the per-disk latency oracle seam.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A position in the infrastructure hierarchy.
///
/// Items are `(level_key, value)` pairs ordered from the widest level to
/// the narrowest (e.g. datacenter, room, rack, host). Level keys are
/// arbitrary but consistent across all locations in one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    items: SmallVec<[(i32, u32); 4]>,
}

impl Location {
    /// Build a location from `(level_key, value)` items, widest first.
    pub fn new(items: &[(i32, u32)]) -> Self {
        Self {
            items: items.iter().copied().collect(),
        }
    }

    /// The hierarchy items, widest level first.
    pub fn items(&self) -> &[(i32, u32)] {
        &self.items
    }

    /// The deepest level key at which `self` and `other` agree.
    ///
    /// A larger key means a narrower shared level, i.e. a closer peer.
    /// Returns `i64::MIN` when even the widest level differs.
    pub fn common_prefix_key(&self, other: &Location) -> i64 {
        let mut key = i64::MIN;
        for (a, b) in self.items.iter().zip(other.items.iter()) {
            if a != b {
                break;
            }
            key = a.0 as i64;
        }
        key
    }
}

/// Locations of every disk in the group, plus our own.
///
/// Optional: when absent, the get strategy falls back to topology-only
/// ordering (main replicas first).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeLayout {
    /// The local node's location.
    pub self_location: Location,
    /// Location per disk order number.
    pub location_per_order_number: Vec<Location>,
}

impl NodeLayout {
    /// Proximity score component for a disk: closer disks score lower.
    ///
    /// Maps the common-prefix key into `[0, u32::MAX]` so it can occupy the
    /// low word of a compound sort key.
    pub fn proximity_score(&self, order_number: u32) -> u64 {
        let location = match self.location_per_order_number.get(order_number as usize) {
            Some(l) => l,
            None => return i32::MAX as u64,
        };
        let key = self.self_location.common_prefix_key(location);
        (i32::MAX as i64).saturating_sub(key.clamp(i32::MIN as i64, i32::MAX as i64)) as u64
    }
}

/// Oracle for per-disk predicted request latency, fed by queue statistics.
pub trait DelayEstimator {
    /// Predicted latency in nanoseconds for a request to the disk at
    /// `order_number`. Zero means "no estimate".
    fn predicted_delay_ns(&self, order_number: u32) -> u64;
}

/// Estimator with no data: every disk predicts zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelayData;

impl DelayEstimator for NoDelayData {
    fn predicted_delay_ns(&self, _order_number: u32) -> u64 {
        0
    }
}
