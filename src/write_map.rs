//! Coalesced write buffer.
//!
//! The write map is an ordered, non-overlapping interval map from key
//! ranges to pending write operations. Gaps between stored segments mean
//! "unknown": nothing has been written there and reads fall through to the
//! cache or the remote store. The map is kept maximally coalesced after
//! every mutation so merge-time work is proportional to the number of
//! distinct segments touched, not the number of operations issued.
//!
//! Segment shape invariants:
//! - `Set` and `Deferred` segments are always exactly one key wide.
//! - `Clear` segments may span any range and never touch another `Clear`.
//! - `Unknown` is never stored; it only appears in lookup output.

use crate::atomic::{self, AtomicMutation};
use crate::remote::Mutation;
use crate::types::{key_after, Key, KeyRange, Value};
use bytes::Bytes;
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};

/// A pending operation over a key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// The range (always a single key) holds this value.
    Set(Value),
    /// Every key in the range is deleted.
    Clear,
    /// Atomic mutations waiting for the base value, oldest first.
    Deferred(SmallVec<[AtomicMutation; 1]>),
    /// No local write; defer to the cache or the remote view.
    Unknown,
}

#[derive(Debug, Clone)]
struct Segment {
    end: Key,
    op: WriteOp,
}

/// Ordered, non-overlapping, maximally coalesced buffer of uncommitted
/// writes.
#[derive(Debug, Default)]
pub struct WriteMap {
    segments: BTreeMap<Key, Segment>,
}

impl WriteMap {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no writes are buffered.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of stored segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Discards every buffered write.
    pub fn clear_all(&mut self) {
        self.segments.clear();
    }

    /// The operation covering `key`, or `Unknown`.
    pub fn op_at(&self, key: &[u8]) -> WriteOp {
        self.covering(key)
            .map(|(_, seg)| seg.op.clone())
            .unwrap_or(WriteOp::Unknown)
    }

    /// True when no stored segment intersects `range`.
    pub fn is_unknown(&self, range: &KeyRange) -> bool {
        if range.is_empty() {
            return true;
        }
        if self.covering(&range.begin).is_some() {
            return false;
        }
        self.segments
            .range::<[u8], _>((Included(&range.begin[..]), Excluded(&range.end[..])))
            .next()
            .is_none()
    }

    /// Buffers `value` at `key`, superseding anything the key held.
    pub fn set(&mut self, key: Key, value: Value) {
        let range = KeyRange::single(key.clone());
        self.carve(&range);
        self.segments.insert(
            key,
            Segment {
                end: range.end,
                op: WriteOp::Set(value),
            },
        );
    }

    /// Buffers a clear of `range`, replacing every overlapped operation and
    /// coalescing with adjacent clears.
    pub fn clear(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }
        self.carve(&range);
        let mut begin = range.begin;
        let mut end = range.end;

        let left = self
            .segments
            .range::<[u8], _>((Unbounded, Excluded(&begin[..])))
            .next_back()
            .filter(|(_, seg)| seg.end == begin && seg.op == WriteOp::Clear)
            .map(|(b, _)| b.clone());
        if let Some(b) = left {
            self.segments.remove(&b);
            begin = b;
        }

        let right = self
            .segments
            .get(&end)
            .filter(|seg| seg.op == WriteOp::Clear)
            .map(|seg| seg.end.clone());
        if let Some(e) = right {
            self.segments.remove(&end);
            end = e;
        }

        self.segments.insert(begin, Segment { end, op: WriteOp::Clear });
    }

    /// Buffers an atomic mutation at `key`.
    ///
    /// Over a known `Set` the mutation evaluates immediately; over a clear
    /// it evaluates against the cleared identity; over unknown state it is
    /// deferred until a read resolves the base or commit ships it to the
    /// remote store.
    pub fn atomic(&mut self, key: Key, m: AtomicMutation) {
        match self.op_at(&key) {
            WriteOp::Set(v) => match atomic::apply(m.op, Some(&v), &m.operand) {
                Some(bytes) => self.set(key, Bytes::from(bytes)),
                None => self.clear(KeyRange::single(key)),
            },
            WriteOp::Clear => {
                if let Some(bytes) = atomic::apply(m.op, None, &m.operand) {
                    self.set(key, Bytes::from(bytes));
                }
                // A clearing result leaves the covering clear in place.
            }
            WriteOp::Deferred(mut stack) => {
                stack.push(m);
                let range = KeyRange::single(key.clone());
                self.carve(&range);
                self.segments.insert(
                    key,
                    Segment {
                        end: range.end,
                        op: WriteOp::Deferred(stack),
                    },
                );
            }
            WriteOp::Unknown => {
                self.segments.insert(
                    key.clone(),
                    Segment {
                        end: key_after(&key),
                        op: WriteOp::Deferred(smallvec![m]),
                    },
                );
            }
        }
    }

    /// Replaces a deferred stack with its resolved result.
    ///
    /// No-op unless `key` still carries exactly `expected`; a later local
    /// write is authoritative over a resolution that raced it.
    pub fn materialize(&mut self, key: Key, expected: &[AtomicMutation], resolved: Option<Value>) {
        match self.op_at(&key) {
            WriteOp::Deferred(stack) if stack[..] == *expected => match resolved {
                Some(v) => self.set(key, v),
                None => self.clear(KeyRange::single(key)),
            },
            _ => {}
        }
    }

    /// The ordered `(sub-range, op)` segments intersecting `range`, with
    /// explicit `Unknown` fillers so the output exactly tiles the query
    /// range. This is the primitive the merge path consumes.
    pub fn segments_in(&self, range: &KeyRange) -> Vec<(KeyRange, WriteOp)> {
        let mut out = Vec::new();
        if range.is_empty() {
            return out;
        }
        let mut cursor = range.begin.clone();
        if let Some((_, seg)) = self.covering(&range.begin) {
            let clip_end = seg.end.clone().min(range.end.clone());
            out.push((
                KeyRange {
                    begin: cursor.clone(),
                    end: clip_end.clone(),
                },
                seg.op.clone(),
            ));
            cursor = clip_end;
        }
        let resume = cursor.clone();
        for (b, seg) in self
            .segments
            .range::<[u8], _>((Included(&resume[..]), Excluded(&range.end[..])))
        {
            if cursor < *b {
                out.push((
                    KeyRange {
                        begin: cursor.clone(),
                        end: b.clone(),
                    },
                    WriteOp::Unknown,
                ));
            }
            let clip_end = seg.end.clone().min(range.end.clone());
            out.push((
                KeyRange {
                    begin: b.clone(),
                    end: clip_end.clone(),
                },
                seg.op.clone(),
            ));
            cursor = clip_end;
        }
        if cursor < range.end {
            out.push((
                KeyRange {
                    begin: cursor,
                    end: range.end.clone(),
                },
                WriteOp::Unknown,
            ));
        }
        out
    }

    /// Flush-order mutations for commit: sets, clear ranges and still
    /// unresolved atomic stacks.
    pub fn mutations(&self) -> Vec<Mutation> {
        let mut out = Vec::new();
        for (b, seg) in &self.segments {
            match &seg.op {
                WriteOp::Set(v) => out.push(Mutation::Set {
                    key: b.clone(),
                    value: v.clone(),
                }),
                WriteOp::Clear => out.push(Mutation::ClearRange {
                    range: KeyRange {
                        begin: b.clone(),
                        end: seg.end.clone(),
                    },
                }),
                WriteOp::Deferred(stack) => {
                    for m in stack {
                        out.push(Mutation::Atomic {
                            key: b.clone(),
                            op: m.op,
                            operand: m.operand.clone(),
                        });
                    }
                }
                WriteOp::Unknown => {}
            }
        }
        out
    }

    fn covering(&self, key: &[u8]) -> Option<(&Key, &Segment)> {
        self.segments
            .range::<[u8], _>((Unbounded, Included(key)))
            .next_back()
            .filter(|(_, seg)| &seg.end[..] > key)
    }

    /// Removes `range` from every stored segment, truncating stragglers at
    /// both boundaries.
    fn carve(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        let straddle = self
            .covering(&range.begin)
            .filter(|(b, _)| **b < range.begin)
            .map(|(b, seg)| (b.clone(), seg.end.clone(), seg.op.clone()));
        if let Some((b, seg_end, op)) = straddle {
            if let Some(seg) = self.segments.get_mut(&b) {
                seg.end = range.begin.clone();
            }
            if seg_end > range.end {
                self.segments.insert(
                    range.end.clone(),
                    Segment {
                        end: seg_end,
                        op,
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
                    self.segments.insert(range.end.clone(), seg);
                }
            }
        }
    }

    /// Validates ordering, disjointness and maximal coalescing.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut prev: Option<(&Key, &Segment)> = None;
        for (b, seg) in &self.segments {
            assert!(*b < seg.end, "empty segment at {b:?}");
            assert!(seg.op != WriteOp::Unknown, "stored Unknown at {b:?}");
            if let Some((_, pseg)) = prev {
                assert!(pseg.end <= *b, "overlapping segments at {b:?}");
                if pseg.end == *b {
                    assert!(
                        !(pseg.op == WriteOp::Clear && seg.op == WriteOp::Clear),
                        "uncoalesced adjacent clears at {b:?}"
                    );
                }
            }
            prev = Some((b, seg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::AtomicOp;

    fn k(s: &str) -> Key {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn v(s: &str) -> Value {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn range(b: &str, e: &str) -> KeyRange {
        KeyRange::new(k(b), k(e))
    }

    #[test]
    fn later_set_supersedes_earlier() {
        let mut w = WriteMap::new();
        w.set(k("x"), v("1"));
        w.set(k("x"), v("2"));
        assert_eq!(w.op_at(b"x"), WriteOp::Set(v("2")));
        assert_eq!(w.segment_count(), 1);
        w.check_invariants();
    }

    #[test]
    fn clear_supersedes_covered_sets() {
        let mut w = WriteMap::new();
        w.set(k("a"), v("1"));
        w.set(k("b"), v("2"));
        w.clear(range("a", "c"));
        assert_eq!(w.op_at(b"a"), WriteOp::Clear);
        assert_eq!(w.op_at(b"b"), WriteOp::Clear);
        assert_eq!(w.segment_count(), 1);
        w.check_invariants();
    }

    #[test]
    fn adjacent_clears_coalesce() {
        let mut w = WriteMap::new();
        w.clear(range("a", "b"));
        w.clear(range("b", "c"));
        assert_eq!(w.segment_count(), 1);
        let segs = w.segments_in(&range("a", "c"));
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].0, range("a", "c"));
        w.check_invariants();
    }

    #[test]
    fn overlapping_clears_coalesce() {
        let mut w = WriteMap::new();
        w.clear(range("a", "m"));
        w.clear(range("f", "z"));
        assert_eq!(w.segment_count(), 1);
        assert_eq!(w.segments_in(&range("a", "z"))[0].0, range("a", "z"));
        w.check_invariants();
    }

    #[test]
    fn set_splits_a_clear() {
        let mut w = WriteMap::new();
        w.clear(range("a", "z"));
        w.set(k("m"), v("1"));
        let segs = w.segments_in(&range("a", "z"));
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].1, WriteOp::Clear);
        assert_eq!(segs[1].1, WriteOp::Set(v("1")));
        assert_eq!(segs[2].1, WriteOp::Clear);
        w.check_invariants();
    }

    #[test]
    fn clearing_the_split_heals_the_clear() {
        let mut w = WriteMap::new();
        w.clear(range("a", "z"));
        w.set(k("m"), v("1"));
        w.clear(KeyRange::single(k("m")));
        assert_eq!(w.segment_count(), 1);
        w.check_invariants();
    }

    #[test]
    fn segments_in_tiles_with_unknown() {
        let mut w = WriteMap::new();
        w.set(k("c"), v("1"));
        w.clear(range("f", "h"));
        let segs = w.segments_in(&range("a", "z"));
        assert_eq!(segs.len(), 5);
        assert_eq!(segs[0], (range("a", "c"), WriteOp::Unknown));
        assert_eq!(segs[1].1, WriteOp::Set(v("1")));
        assert_eq!(segs[2].1, WriteOp::Unknown);
        assert_eq!(segs[3], (range("f", "h"), WriteOp::Clear));
        assert_eq!(segs[4], (range("h", "z"), WriteOp::Unknown));
    }

    #[test]
    fn segments_in_clips_to_query() {
        let mut w = WriteMap::new();
        w.clear(range("a", "z"));
        let segs = w.segments_in(&range("f", "h"));
        assert_eq!(segs, vec![(range("f", "h"), WriteOp::Clear)]);
    }

    #[test]
    fn atomic_over_set_evaluates_eagerly() {
        let mut w = WriteMap::new();
        w.set(k("n"), Bytes::from_static(b"\x05"));
        w.atomic(
            k("n"),
            AtomicMutation {
                op: AtomicOp::Add,
                operand: Bytes::from_static(b"\x03"),
            },
        );
        assert_eq!(w.op_at(b"n"), WriteOp::Set(Bytes::from_static(b"\x08")));
        w.check_invariants();
    }

    #[test]
    fn atomic_over_clear_uses_identity() {
        let mut w = WriteMap::new();
        w.clear(range("a", "z"));
        w.atomic(
            k("n"),
            AtomicMutation {
                op: AtomicOp::Add,
                operand: Bytes::from_static(b"\x03"),
            },
        );
        assert_eq!(w.op_at(b"n"), WriteOp::Set(Bytes::from_static(b"\x03")));
        assert_eq!(w.op_at(b"m"), WriteOp::Clear);
        w.check_invariants();
    }

    #[test]
    fn atomic_over_unknown_defers_and_stacks() {
        let mut w = WriteMap::new();
        let m1 = AtomicMutation {
            op: AtomicOp::Add,
            operand: Bytes::from_static(b"\x01"),
        };
        let m2 = AtomicMutation {
            op: AtomicOp::Add,
            operand: Bytes::from_static(b"\x02"),
        };
        w.atomic(k("n"), m1.clone());
        w.atomic(k("n"), m2.clone());
        match w.op_at(b"n") {
            WriteOp::Deferred(stack) => assert_eq!(&stack[..], &[m1, m2]),
            other => panic!("expected deferred stack, got {other:?}"),
        }
        w.check_invariants();
    }

    #[test]
    fn materialize_respects_later_writes() {
        let mut w = WriteMap::new();
        let m = AtomicMutation {
            op: AtomicOp::Add,
            operand: Bytes::from_static(b"\x01"),
        };
        w.atomic(k("n"), m.clone());
        // A later set wins over a stale resolution.
        w.set(k("n"), v("fresh"));
        w.materialize(k("n"), &[m.clone()], Some(Bytes::from_static(b"\x09")));
        assert_eq!(w.op_at(b"n"), WriteOp::Set(v("fresh")));

        // An untouched stack resolves in place.
        w.atomic(k("p"), m.clone());
        w.materialize(k("p"), &[m], Some(Bytes::from_static(b"\x09")));
        assert_eq!(w.op_at(b"p"), WriteOp::Set(Bytes::from_static(b"\x09")));
        w.check_invariants();
    }

    #[test]
    fn mutations_flush_in_key_order() {
        let mut w = WriteMap::new();
        w.set(k("b"), v("1"));
        w.clear(range("d", "f"));
        w.atomic(
            k("a"),
            AtomicMutation {
                op: AtomicOp::Add,
                operand: Bytes::from_static(b"\x01"),
            },
        );
        let muts = w.mutations();
        assert_eq!(muts.len(), 3);
        assert!(matches!(muts[0], Mutation::Atomic { .. }));
        assert!(matches!(muts[1], Mutation::Set { .. }));
        assert!(matches!(muts[2], Mutation::ClearRange { .. }));
    }

    #[test]
    fn unknown_probe_sees_stored_segments() {
        let mut w = WriteMap::new();
        assert!(w.is_unknown(&range("a", "z")));
        w.set(k("m"), v("1"));
        assert!(!w.is_unknown(&range("a", "z")));
        assert!(w.is_unknown(&range("a", "m")));
        assert!(w.is_unknown(&range("m\x00", "z")));
    }
}
