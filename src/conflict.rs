//! Conflict-range bookkeeping.
//!
//! Two interval sets accumulate as operations run: ranges whose contents a
//! read depended on, and ranges a write touched. At commit both sets are
//! handed to the remote transaction verbatim; it alone decides whether
//! they overlap another transaction's activity.

use crate::types::{key_after, Key, KeyRange};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};

/// A set of disjoint key ranges, merged on insertion so no two stored
/// ranges touch or overlap.
#[derive(Debug, Default, Clone)]
pub struct RangeSet {
    ranges: BTreeMap<Key, Key>,
}

impl RangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of stored (merged) ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Removes every range.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Inserts `range`, merging with every stored range it overlaps or
    /// touches.
    pub fn insert(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }
        let mut begin = range.begin;
        let mut end = range.end;

        // A predecessor reaching begin (or past it) absorbs the new range.
        if let Some((b, e)) = self
            .ranges
            .range::<[u8], _>((Unbounded, Included(&begin[..])))
            .next_back()
            .map(|(b, e)| (b.clone(), e.clone()))
        {
            if e >= begin {
                self.ranges.remove(&b);
                begin = b;
                end = end.max(e);
            }
        }
        // Successors starting inside (or touching) the merged span.
        loop {
            let next = self
                .ranges
                .range::<[u8], _>((Excluded(&begin[..]), Unbounded))
                .next()
                .map(|(b, e)| (b.clone(), e.clone()));
            match next {
                Some((b, e)) if b <= end => {
                    self.ranges.remove(&b);
                    end = end.max(e);
                }
                _ => break,
            }
        }
        self.ranges.insert(begin, end);
    }

    /// The stored ranges (full extents, not clipped) intersecting `range`.
    pub fn intersecting(&self, range: &KeyRange) -> Vec<KeyRange> {
        if range.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some((b, e)) = self
            .ranges
            .range::<[u8], _>((Unbounded, Included(&range.begin[..])))
            .next_back()
        {
            if *e > range.begin {
                out.push(KeyRange {
                    begin: b.clone(),
                    end: e.clone(),
                });
            }
        }
        for (b, e) in self
            .ranges
            .range::<[u8], _>((Excluded(&range.begin[..]), Excluded(&range.end[..])))
        {
            out.push(KeyRange {
                begin: b.clone(),
                end: e.clone(),
            });
        }
        out
    }

    /// All stored ranges in order.
    pub fn ranges(&self) -> Vec<KeyRange> {
        self.ranges
            .iter()
            .map(|(b, e)| KeyRange {
                begin: b.clone(),
                end: e.clone(),
            })
            .collect()
    }
}

/// The read and write conflict sets of one transaction.
#[derive(Debug, Default)]
pub struct ConflictRanges {
    reads: RangeSet,
    writes: RangeSet,
}

impl ConflictRanges {
    /// Creates empty sets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a read depended on `range`.
    pub fn add_read(&mut self, range: KeyRange) {
        self.reads.insert(range);
    }

    /// Records that a write touched `range`.
    pub fn add_write(&mut self, range: KeyRange) {
        self.writes.insert(range);
    }

    /// Unions one synthetic single-key range into both sets so any two
    /// instances of this transaction conflict with each other.
    pub fn make_self_conflicting(&mut self) -> KeyRange {
        let token: u128 = rand::random();
        let mut raw = vec![0xffu8];
        raw.extend_from_slice(b"/selfConflict/");
        raw.extend_from_slice(format!("{token:032x}").as_bytes());
        let key = Bytes::from(raw);
        let range = KeyRange {
            begin: key.clone(),
            end: key_after(&key),
        };
        self.reads.insert(range.clone());
        self.writes.insert(range.clone());
        range
    }

    /// The merged read set.
    pub fn reads(&self) -> &RangeSet {
        &self.reads
    }

    /// The merged write set.
    pub fn writes(&self) -> &RangeSet {
        &self.writes
    }

    /// True when neither set holds a range.
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Drops both sets.
    pub fn clear(&mut self) {
        self.reads.clear();
        self.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> Key {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn range(b: &str, e: &str) -> KeyRange {
        KeyRange::new(k(b), k(e))
    }

    #[test]
    fn disjoint_ranges_stay_separate() {
        let mut s = RangeSet::new();
        s.insert(range("a", "c"));
        s.insert(range("f", "h"));
        assert_eq!(s.ranges(), vec![range("a", "c"), range("f", "h")]);
    }

    #[test]
    fn touching_ranges_merge() {
        let mut s = RangeSet::new();
        s.insert(range("a", "c"));
        s.insert(range("c", "f"));
        assert_eq!(s.ranges(), vec![range("a", "f")]);
    }

    #[test]
    fn insert_bridges_multiple_ranges() {
        let mut s = RangeSet::new();
        s.insert(range("a", "c"));
        s.insert(range("f", "h"));
        s.insert(range("m", "p"));
        s.insert(range("b", "n"));
        assert_eq!(s.ranges(), vec![range("a", "p")]);
    }

    #[test]
    fn contained_insert_is_absorbed() {
        let mut s = RangeSet::new();
        s.insert(range("a", "z"));
        s.insert(range("f", "h"));
        assert_eq!(s.ranges(), vec![range("a", "z")]);
    }

    #[test]
    fn intersecting_returns_full_extents() {
        let mut s = RangeSet::new();
        s.insert(range("m", "p"));
        assert_eq!(s.intersecting(&range("n", "o")), vec![range("m", "p")]);
        assert_eq!(s.intersecting(&range("a", "m")), Vec::<KeyRange>::new());
        assert_eq!(s.intersecting(&range("o", "z")), vec![range("m", "p")]);
    }

    #[test]
    fn self_conflict_lands_in_both_sets() {
        let mut c = ConflictRanges::new();
        let r = c.make_self_conflicting();
        assert_eq!(c.reads().intersecting(&r), vec![r.clone()]);
        assert_eq!(c.writes().intersecting(&r), vec![r]);
    }
}
