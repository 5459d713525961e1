//! Read-result cache.
//!
//! The cache records which key ranges have already been fetched from the
//! remote transaction and exactly which entries exist there, so repeated
//! reads resolve locally. A cache segment asserts complete knowledge of
//! its range: every key it does not list is known absent. Entries are only
//! trusted where the write map has no overlapping operation; any local
//! write invalidates the intersecting spans.

use crate::types::{Key, KeyRange, KeyValue, Value};
use crate::write_map::WriteMap;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};

#[derive(Debug, Clone)]
struct CacheSegment {
    end: Key,
    /// Entries within `[begin, end)`, ascending by key.
    entries: Vec<KeyValue>,
}

/// Interval map of ranges already observed from the remote store.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    segments: BTreeMap<Key, CacheSegment>,
}

impl SnapshotCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all cached knowledge.
    pub fn clear_all(&mut self) {
        self.segments.clear();
    }

    /// Number of cached segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Records that `range` was observed to contain exactly `entries`.
    ///
    /// Silently does nothing unless the write map's coverage of `range` is
    /// entirely unknown: a write may have landed while the read was in
    /// flight, and a cache entry must never shadow one.
    pub fn record(&mut self, range: &KeyRange, entries: &[KeyValue], writes: &WriteMap) {
        if range.is_empty() || !writes.is_unknown(range) {
            return;
        }
        self.carve(range);
        let mut begin = range.begin.clone();
        let mut end = range.end.clone();
        let mut merged: Vec<KeyValue> = entries.to_vec();

        let left = self
            .segments
            .range::<[u8], _>((Unbounded, Excluded(&begin[..])))
            .next_back()
            .filter(|(_, seg)| seg.end == begin)
            .map(|(b, _)| b.clone());
        if let Some(b) = left {
            let seg = self.segments.remove(&b).expect("left neighbor vanished");
            let mut combined = seg.entries;
            combined.extend(merged);
            merged = combined;
            begin = b;
        }

        let right = self.segments.get(&end).map(|seg| seg.end.clone());
        if let Some(e) = right {
            let seg = self.segments.remove(&end).expect("right neighbor vanished");
            merged.extend(seg.entries);
            end = e;
        }

        self.segments.insert(
            begin,
            CacheSegment {
                end,
                entries: merged,
            },
        );
    }

    /// Drops cached knowledge intersecting `range`; called for every local
    /// write.
    pub fn invalidate(&mut self, range: &KeyRange) {
        self.carve(range);
    }

    /// Cached state of a single key: `Some(Some(v))` present, `Some(None)`
    /// known absent, `None` not covered.
    pub fn lookup_point(&self, key: &[u8]) -> Option<Option<Value>> {
        let (_, seg) = self.covering(key)?;
        Some(
            seg.entries
                .iter()
                .find(|kv| &kv.key[..] == key)
                .map(|kv| kv.value.clone()),
        )
    }

    /// The covered prefix of `[begin, end)` starting exactly at `begin`,
    /// with its entries, or `None` when `begin` is not covered.
    pub fn known_prefix(&self, begin: &Key, end: &Key) -> Option<(Key, Vec<KeyValue>)> {
        let (_, seg) = self.covering(begin)?;
        let covered_end = seg.end.clone().min(end.clone());
        let entries = seg
            .entries
            .iter()
            .filter(|kv| kv.key >= *begin && kv.key < covered_end)
            .cloned()
            .collect();
        Some((covered_end, entries))
    }

    /// The covered suffix of `[begin, end)` reaching exactly `end`, with
    /// its entries in ascending order, or `None` when the span just below
    /// `end` is not covered.
    pub fn known_suffix(&self, begin: &Key, end: &Key) -> Option<(Key, Vec<KeyValue>)> {
        let (b, seg) = self
            .segments
            .range::<[u8], _>((Unbounded, Excluded(&end[..])))
            .next_back()
            .filter(|(_, seg)| seg.end >= *end)?;
        let covered_begin = b.clone().max(begin.clone());
        let entries = seg
            .entries
            .iter()
            .filter(|kv| kv.key >= covered_begin && kv.key < *end)
            .cloned()
            .collect();
        Some((covered_begin, entries))
    }

    fn covering(&self, key: &[u8]) -> Option<(&Key, &CacheSegment)> {
        self.segments
            .range::<[u8], _>((Unbounded, Included(key)))
            .next_back()
            .filter(|(_, seg)| &seg.end[..] > key)
    }

    fn carve(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        let straddle = self
            .covering(&range.begin)
            .filter(|(b, _)| **b < range.begin)
            .map(|(b, _)| b.clone());
        if let Some(b) = straddle {
            let seg = self.segments.remove(&b).expect("straddle vanished");
            let (left, rest): (Vec<_>, Vec<_>) = seg
                .entries
                .into_iter()
                .partition(|kv| kv.key < range.begin);
            self.segments.insert(
                b,
                CacheSegment {
                    end: range.begin.clone(),
                    entries: left,
                },
            );
            if seg.end > range.end {
                let tail = rest
                    .into_iter()
                    .filter(|kv| kv.key >= range.end)
                    .collect();
                self.segments.insert(
                    range.end.clone(),
                    CacheSegment {
                        end: seg.end,
                        entries: tail,
                    },
                );
            }
        }
        let inside: Vec<Key> = self
            .segments
            .range::<[u8], _>((Included(&range.begin[..]), Excluded(&range.end[..])))
            .map(|(k, _)| k.clone())
            .collect();
        for k in inside {
            if let Some(seg) = self.segments.remove(&k) {
                if seg.end > range.end {
                    let tail = seg
                        .entries
                        .into_iter()
                        .filter(|kv| kv.key >= range.end)
                        .collect();
                    self.segments.insert(
                        range.end.clone(),
                        CacheSegment {
                            end: seg.end,
                            entries: tail,
                        },
                    );
                }
            }
        }
    }

    /// Validates ordering and containment of entries.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut prev_end: Option<&Key> = None;
        for (b, seg) in &self.segments {
            assert!(*b < seg.end, "empty cache segment at {b:?}");
            if let Some(pe) = prev_end {
                assert!(*pe <= *b, "overlapping cache segments at {b:?}");
            }
            let mut prev_key: Option<&Key> = None;
            for kv in &seg.entries {
                assert!(kv.key >= *b && kv.key < seg.end, "entry outside segment");
                if let Some(pk) = prev_key {
                    assert!(*pk < kv.key, "unsorted cache entries");
                }
                prev_key = Some(&kv.key);
            }
            prev_end = Some(&seg.end);
        }
    }
}
