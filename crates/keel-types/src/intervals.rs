//! Sets of disjoint byte ranges.
//!
//! [`IntervalSet`] tracks which byte ranges of a blob are needed, held, or
//! requested. Ranges are half-open `[begin, end)` over `u64` offsets and are
//! kept sorted, disjoint, and coalesced at all times.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A sorted, coalesced set of disjoint half-open byte ranges.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSet {
    /// Invariant: sorted by begin, pairwise disjoint, no empty or adjacent
    /// ranges (adjacent ranges are merged on insert).
    ranges: Vec<(u64, u64)>,
}

impl IntervalSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set holding a single range `[begin, end)`.
    ///
    /// An empty range (`begin >= end`) yields an empty set.
    pub fn from_range(begin: u64, end: u64) -> Self {
        let mut set = Self::new();
        set.add(begin, end);
        set
    }

    /// Whether the set contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of bytes covered.
    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(|(b, e)| e - b).sum()
    }

    /// The covering range `[min_begin, max_end)`, or `None` when empty.
    pub fn extent(&self) -> Option<(u64, u64)> {
        match (self.ranges.first(), self.ranges.last()) {
            (Some(&(begin, _)), Some(&(_, end))) => Some((begin, end)),
            _ => None,
        }
    }

    /// Iterate over the disjoint ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }

    /// Insert `[begin, end)`, merging with any overlapping or adjacent ranges.
    pub fn add(&mut self, begin: u64, end: u64) {
        if begin >= end {
            return;
        }

        // Find the span of existing ranges that overlap or touch [begin, end).
        let first = self.ranges.partition_point(|&(_, e)| e < begin);
        let last = self.ranges.partition_point(|&(b, _)| b <= end);

        if first == last {
            self.ranges.insert(first, (begin, end));
            return;
        }

        let merged_begin = begin.min(self.ranges[first].0);
        let merged_end = end.max(self.ranges[last - 1].1);
        self.ranges.splice(first..last, [(merged_begin, merged_end)]);
    }

    /// Union another set into this one.
    pub fn union_with(&mut self, other: &IntervalSet) {
        for (begin, end) in other.iter() {
            self.add(begin, end);
        }
    }

    /// Remove every byte of `other` from this set.
    pub fn subtract(&mut self, other: &IntervalSet) {
        if self.is_empty() || other.is_empty() {
            return;
        }

        let mut out = Vec::with_capacity(self.ranges.len());
        let mut cut = other.ranges.iter().copied().peekable();

        for (mut begin, end) in self.ranges.iter().copied() {
            while begin < end {
                // Skip cuts that end before the current position.
                while matches!(cut.peek(), Some(&(_, ce)) if ce <= begin) {
                    cut.next();
                }
                match cut.peek() {
                    Some(&(cb, ce)) if cb < end => {
                        if begin < cb {
                            out.push((begin, cb));
                        }
                        begin = ce.min(end);
                    }
                    _ => {
                        out.push((begin, end));
                        break;
                    }
                }
            }
        }

        self.ranges = out;
    }

    /// Whether every byte of `self` is also in `other`.
    pub fn is_subset_of(&self, other: &IntervalSet) -> bool {
        let mut cover = other.ranges.iter().copied();
        let mut current = cover.next();

        for (begin, end) in self.iter() {
            loop {
                match current {
                    Some((_, ce)) if ce <= begin => current = cover.next(),
                    // Both sets are coalesced, so a single covering range
                    // must contain the whole inner range.
                    Some((cb, ce)) if cb <= begin && ce >= end => break,
                    _ => return false,
                }
            }
        }
        true
    }

    /// Whether any byte is shared with `other`.
    pub fn intersects(&self, other: &IntervalSet) -> bool {
        let (mut a, mut b) = (self.ranges.iter().peekable(), other.ranges.iter().peekable());
        while let (Some(&&(ab, ae)), Some(&&(bb, be))) = (a.peek(), b.peek()) {
            if ae <= bb {
                a.next();
            } else if be <= ab {
                b.next();
            } else {
                return true;
            }
        }
        false
    }
}

impl fmt::Debug for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (begin, end)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "[{begin},{end})")?;
        }
        write!(f, "}}")
    }
}
