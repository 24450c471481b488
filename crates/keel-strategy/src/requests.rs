//! Peer GET requests emitted by a strategy step.

use keel_types::{IntervalSet, PartId};

/// One GET to a peer disk for specific byte ranges of one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    /// Target disk order number.
    pub order_number: u32,
    /// The part to read.
    pub part_id: PartId,
    /// Byte ranges to read.
    pub ranges: IntervalSet,
}

/// Accumulator for requests produced while processing blob states.
///
/// Recording a request here and into the disk's `requested` set happens in
/// the same strategy step, so the two can never disagree.
#[derive(Debug, Default)]
pub struct DiskRequests {
    requests: Vec<GetRequest>,
}

impl DiskRequests {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a GET.
    pub fn add_get(&mut self, order_number: u32, part_id: PartId, ranges: IntervalSet) {
        self.requests.push(GetRequest {
            order_number,
            part_id,
            ranges,
        });
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no requests were emitted.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Drain the accumulated requests.
    pub fn drain(&mut self) -> impl Iterator<Item = GetRequest> + '_ {
        self.requests.drain(..)
    }

    /// Inspect the accumulated requests.
    pub fn iter(&self) -> impl Iterator<Item = &GetRequest> {
        self.requests.iter()
    }
}
