//! Compact bitmap over the parts of a blob.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed-size bitmap over part indices `0..num_parts`.
///
/// Every erasure flavor in a group has at most 8 parts, so the bits fit in
/// a `u8`. Part indices here are 0-based; the wire-level 1-based numbering
/// lives in [`PartId`](crate::PartId).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSet {
    bits: u8,
    num_parts: u8,
}

impl PartSet {
    /// Create an empty set over `num_parts` parts.
    pub fn empty(num_parts: u8) -> Self {
        debug_assert!(num_parts <= 8);
        Self { bits: 0, num_parts }
    }

    /// Create a set with all `num_parts` bits set.
    pub fn full(num_parts: u8) -> Self {
        debug_assert!(num_parts <= 8);
        Self {
            bits: if num_parts >= 8 {
                u8::MAX
            } else {
                (1u8 << num_parts) - 1
            },
            num_parts,
        }
    }

    /// Number of parts this set ranges over.
    pub fn num_parts(&self) -> u8 {
        self.num_parts
    }

    /// Set the bit for `part_idx`.
    pub fn set(&mut self, part_idx: u8) {
        debug_assert!(part_idx < self.num_parts);
        self.bits |= 1 << part_idx;
    }

    /// Clear the bit for `part_idx`.
    pub fn clear(&mut self, part_idx: u8) {
        debug_assert!(part_idx < self.num_parts);
        self.bits &= !(1 << part_idx);
    }

    /// Whether the bit for `part_idx` is set.
    pub fn contains(&self, part_idx: u8) -> bool {
        part_idx < self.num_parts && self.bits & (1 << part_idx) != 0
    }

    /// Whether no bits are set.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    /// The lowest set part index, if any.
    pub fn first(&self) -> Option<u8> {
        (!self.is_empty()).then(|| self.bits.trailing_zeros() as u8)
    }

    /// Iterate over set part indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        let bits = self.bits;
        (0..self.num_parts).filter(move |i| bits & (1 << i) != 0)
    }

    /// Set difference: bits of `self` not in `other`.
    pub fn difference(&self, other: &PartSet) -> PartSet {
        debug_assert_eq!(self.num_parts, other.num_parts);
        PartSet {
            bits: self.bits & !other.bits,
            num_parts: self.num_parts,
        }
    }

    /// Set union.
    pub fn union(&self, other: &PartSet) -> PartSet {
        debug_assert_eq!(self.num_parts, other.num_parts);
        PartSet {
            bits: self.bits | other.bits,
            num_parts: self.num_parts,
        }
    }
}

impl fmt::Debug for PartSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parts{{")?;
        for (i, p) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, "}}")
    }
}
