//! The public transaction: read/write merge and lifecycle.
//!
//! A [`Transaction`] composes four exclusively-owned local structures (the
//! arena, the write map, the snapshot cache and the conflict sets) with one
//! remote transaction. Reads consult the write map, then the cache, then
//! the remote store, in that priority order; writes land in the write map
//! and invalidate the cache; every operation records the conflict ranges
//! the commit will submit.
//!
//! One cooperative context drives a transaction at a time (`&mut self`
//! API). Every suspension point races the cancellation signal and the
//! timeout deadline, so `cancel` and an elapsed timeout resolve in-flight
//! operations promptly instead of letting them hang.

use crate::arena::Arena;
use crate::atomic::{apply_stack, AtomicMutation, AtomicOp};
use crate::conflict::ConflictRanges;
use crate::error::{Result, TxError, UsageError};
use crate::options::{OptionState, TransactionOption};
use crate::remote::{CommitPayload, ErrorClass, RemoteTransaction};
use crate::snapshot_cache::SnapshotCache;
use crate::types::{
    key_after, system_space_end, user_space_end, Key, KeyRange, KeySelector, KeyValue,
    RangeResult, Value, Version, MAX_KEY_SIZE, MAX_VALUE_SIZE,
};
use crate::watch::Watch;
use crate::write_map::{WriteMap, WriteOp};
use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch as signal;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Rows fetched beyond the caller's limit to warm the cache.
const READ_AHEAD_ROWS: usize = 256;
/// First retry backoff; doubles per retry up to the cap.
const BACKOFF_INITIAL_MS: u64 = 10;
const BACKOFF_MAX_MS: u64 = 1000;
/// Per-mutation size-accounting overhead beyond key and value bytes.
const MUTATION_OVERHEAD: usize = 20;
/// Per-conflict-range size-accounting overhead beyond the boundary keys.
const CONFLICT_RANGE_OVERHEAD: usize = 8;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting reads and writes.
    Active,
    /// A commit is in flight.
    Committing,
    /// Commit succeeded; the transaction is finished.
    Committed,
    /// Cancelled, timed out, or a commit failed; `on_error` may revive it.
    Failed,
}

enum RaceOutcome<T> {
    Done(Result<T>),
    Cancelled,
    TimedOut,
}

/// Races a suspension point against the cancellation signal and the
/// deadline so no remote call can outlive a cancel or timeout.
async fn race<T>(
    mut cancel: signal::Receiver<bool>,
    deadline: Option<Instant>,
    fut: impl Future<Output = Result<T>>,
) -> RaceOutcome<T> {
    tokio::pin!(fut);
    let expiry = async {
        match deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.wait_for(|c| *c) => RaceOutcome::Cancelled,
        _ = expiry => RaceOutcome::TimedOut,
        r = &mut fut => RaceOutcome::Done(r),
    }
}

/// A read-your-writes transaction over a remote collaborator `R`.
pub struct Transaction<R: RemoteTransaction> {
    remote: R,
    arena: Arena,
    writes: WriteMap,
    cache: SnapshotCache,
    conflicts: ConflictRanges,
    options: OptionState,
    persistent_options: Vec<TransactionOption>,
    state: TxState,
    commit_started: bool,
    retries: u32,
    creation_time: std::time::Instant,
    deadline: Option<Instant>,
    cancel_tx: signal::Sender<bool>,
    cancel_rx: signal::Receiver<bool>,
    deferred_error: Option<TxError>,
    committed_version: Option<Version>,
    approximate_size: usize,
    used: bool,
    /// Conflict ranges were added explicitly (not by read tracking), so a
    /// commit must reach the conflict-resolution path even with no writes.
    explicit_conflicts: bool,
}

impl<R: RemoteTransaction> Transaction<R> {
    /// Wraps a remote transaction in a fresh overlay.
    pub fn new(remote: R) -> Self {
        let (cancel_tx, cancel_rx) = signal::channel(false);
        Self {
            remote,
            arena: Arena::new(),
            writes: WriteMap::new(),
            cache: SnapshotCache::new(),
            conflicts: ConflictRanges::new(),
            options: OptionState::default(),
            persistent_options: Vec::new(),
            state: TxState::Active,
            commit_started: false,
            retries: 0,
            creation_time: std::time::Instant::now(),
            deadline: None,
            cancel_tx,
            cancel_rx,
            deferred_error: None,
            committed_version: None,
            approximate_size: 0,
            used: false,
            explicit_conflicts: false,
        }
    }

    // ---- reads -----------------------------------------------------------

    /// Reads the value at `key` through the merged local/remote view.
    ///
    /// `snapshot` reads record no read-conflict range.
    pub async fn get(&mut self, key: &[u8], snapshot: bool) -> Result<Option<Value>> {
        self.ensure_active()?;
        self.validate_read_key(key)?;
        self.used = true;
        let key = self.arena.alloc(key);
        self.get_merged(key, snapshot).await
    }

    /// Resolves a key selector against the merged view.
    pub async fn get_key(&mut self, selector: &KeySelector, snapshot: bool) -> Result<Key> {
        self.ensure_active()?;
        self.used = true;
        self.resolve_selector(selector, snapshot).await
    }

    /// Range read between two selectors. `limit == 0` means unlimited;
    /// `reverse` returns entries in descending key order.
    pub async fn get_range(
        &mut self,
        begin: KeySelector,
        end: KeySelector,
        limit: usize,
        snapshot: bool,
        reverse: bool,
    ) -> Result<RangeResult> {
        self.ensure_active()?;
        self.used = true;
        let begin = match self.trivial_bound(&begin)? {
            Some(k) => k,
            None => self.resolve_selector(&begin, snapshot).await?,
        };
        let end = match self.trivial_bound(&end)? {
            Some(k) => k,
            None => self.resolve_selector(&end, snapshot).await?,
        };
        if begin >= end {
            return Ok(RangeResult::default());
        }
        let range = KeyRange { begin, end };
        let (result, traversed) = self.merged_scan(range, limit, reverse, snapshot).await?;
        self.note_read(traversed, snapshot);
        Ok(result)
    }

    /// Range read between two plain keys, `[begin, end)`.
    pub async fn get_range_between(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        snapshot: bool,
        reverse: bool,
    ) -> Result<RangeResult> {
        self.get_range(
            KeySelector::first_greater_or_equal(Bytes::copy_from_slice(begin)),
            KeySelector::first_greater_or_equal(Bytes::copy_from_slice(end)),
            limit,
            snapshot,
            reverse,
        )
        .await
    }

    /// Obtains the transaction's read version from the remote store.
    pub async fn get_read_version(&mut self) -> Result<Version> {
        self.ensure_active()?;
        let outcome = race(
            self.cancel_rx.clone(),
            self.deadline,
            self.remote.read_version(),
        )
        .await;
        self.absorb(outcome)
    }

    // ---- writes ----------------------------------------------------------

    /// Buffers `value` at `key`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.validate_write_key(key)?;
        if value.len() > MAX_VALUE_SIZE {
            return Err(UsageError::ValueTooLarge.into());
        }
        self.used = true;
        let key = self.arena.alloc(key);
        let value = self.arena.alloc(value);
        let range = KeyRange::single(key.clone());
        self.cache.invalidate(&range);
        let bytes = key.len() + value.len();
        self.writes.set(key, value);
        self.note_write(range, bytes);
        Ok(())
    }

    /// Buffers a clear of a single key.
    pub fn clear(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.validate_write_key(key)?;
        self.used = true;
        let key = self.arena.alloc(key);
        let range = KeyRange::single(key);
        self.cache.invalidate(&range);
        self.writes.clear(range.clone());
        let bytes = range.begin.len() + range.end.len();
        self.note_write(range, bytes);
        Ok(())
    }

    /// Buffers a clear of `[begin, end)`.
    pub fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.validate_write_range(begin, end)?;
        self.used = true;
        let range = KeyRange {
            begin: self.arena.alloc(begin),
            end: self.arena.alloc(end),
        };
        if range.is_empty() {
            return Ok(());
        }
        self.cache.invalidate(&range);
        self.writes.clear(range.clone());
        let bytes = range.begin.len() + range.end.len();
        self.note_write(range, bytes);
        Ok(())
    }

    /// Buffers an atomic mutation at `key`.
    pub fn atomic_op(&mut self, key: &[u8], operand: &[u8], op: AtomicOp) -> Result<()> {
        self.ensure_active()?;
        self.validate_write_key(key)?;
        if operand.len() > MAX_VALUE_SIZE {
            return Err(UsageError::ValueTooLarge.into());
        }
        self.used = true;
        let key = self.arena.alloc(key);
        let operand = self.arena.alloc(operand);
        let range = KeyRange::single(key.clone());
        self.cache.invalidate(&range);
        let bytes = key.len() + operand.len();
        self.writes.atomic(key, AtomicMutation { op, operand });
        self.note_write(range, bytes);
        Ok(())
    }

    // ---- conflict ranges -------------------------------------------------

    /// Explicitly adds `[begin, end)` to the read-conflict set.
    pub fn add_read_conflict_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.validate_read_range(begin, end)?;
        let range = KeyRange {
            begin: self.arena.alloc(begin),
            end: self.arena.alloc(end),
        };
        if range.is_empty() {
            return Ok(());
        }
        self.explicit_conflicts = true;
        self.note_read(range, false);
        Ok(())
    }

    /// Explicitly adds `[begin, end)` to the write-conflict set. Unlike a
    /// mutation, this is never exempted by the next-write option.
    pub fn add_write_conflict_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.validate_write_range(begin, end)?;
        let range = KeyRange {
            begin: self.arena.alloc(begin),
            end: self.arena.alloc(end),
        };
        if range.is_empty() {
            return Ok(());
        }
        self.explicit_conflicts = true;
        self.approximate_size +=
            range.begin.len() + range.end.len() + CONFLICT_RANGE_OVERHEAD;
        self.conflicts.add_write(range);
        Ok(())
    }

    /// Forces any two concurrent instances of this transaction to conflict
    /// with each other.
    pub fn make_self_conflicting(&mut self) -> Result<()> {
        self.ensure_active()?;
        let range = self.conflicts.make_self_conflicting();
        self.explicit_conflicts = true;
        self.approximate_size +=
            2 * (range.begin.len() + range.end.len()) + 2 * CONFLICT_RANGE_OVERHEAD;
        Ok(())
    }

    /// The merged write-conflict ranges commit would submit right now.
    pub fn get_write_conflict_ranges(&self) -> Vec<KeyRange> {
        self.conflicts.writes().ranges()
    }

    /// Read-conflict ranges intersecting `[begin, end)`, full extents.
    pub fn read_conflict_ranges_intersecting(&self, begin: &[u8], end: &[u8]) -> Vec<KeyRange> {
        let range = KeyRange::new(Bytes::copy_from_slice(begin), Bytes::copy_from_slice(end));
        self.conflicts.reads().intersecting(&range)
    }

    /// Write-conflict ranges intersecting `[begin, end)`, full extents.
    pub fn write_conflict_ranges_intersecting(&self, begin: &[u8], end: &[u8]) -> Vec<KeyRange> {
        let range = KeyRange::new(Bytes::copy_from_slice(begin), Bytes::copy_from_slice(end));
        self.conflicts.writes().intersecting(&range)
    }

    // ---- watches ---------------------------------------------------------

    /// Registers a watch on `key`, resolving once when its remote value
    /// changes. The handle outlives reset and commit.
    pub fn watch(&mut self, key: &[u8]) -> Result<Watch> {
        self.ensure_active()?;
        self.validate_read_key(key)?;
        let baseline = match self.writes.op_at(key) {
            WriteOp::Set(v) => Some(v),
            _ => None,
        };
        self.remote.register_watch(key, baseline)
    }

    // ---- lifecycle -------------------------------------------------------

    /// Commits buffered writes and conflict ranges.
    ///
    /// With nothing buffered and no explicit conflict ranges this is a
    /// local no-op success. On failure the local structures are left
    /// untouched so `on_error` can retry from the same state.
    pub async fn commit(&mut self) -> Result<()> {
        self.check_deferred()?;
        if self.commit_started {
            return Err(UsageError::UsedDuringCommit.into());
        }
        match self.state {
            TxState::Active => {}
            TxState::Committing => return Err(UsageError::UsedDuringCommit.into()),
            TxState::Committed | TxState::Failed => {
                return Err(UsageError::NotActive.into())
            }
        }
        if self.writes.is_empty() && !self.explicit_conflicts {
            self.commit_started = true;
            self.state = TxState::Committed;
            debug!("read-only transaction committed locally");
            return Ok(());
        }
        self.commit_started = true;
        self.state = TxState::Committing;
        let payload = CommitPayload {
            mutations: self.writes.mutations(),
            read_conflicts: self.conflicts.reads().ranges(),
            write_conflicts: self.conflicts.writes().ranges(),
        };
        let mutations = payload.len();
        let started = std::time::Instant::now();
        let outcome = race(
            self.cancel_rx.clone(),
            self.deadline,
            self.remote.commit(payload),
        )
        .await;
        match self.absorb(outcome) {
            Ok(version) => {
                self.state = TxState::Committed;
                self.committed_version = Some(version);
                info!(
                    version,
                    mutations,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                self.state = TxState::Failed;
                debug!(error = %e, "commit failed");
                Err(e)
            }
        }
    }

    /// Converts a retryable failure into a fresh attempt.
    ///
    /// Classification belongs to the remote store. On a retryable error
    /// this backs off (exponential with jitter), clears local state the
    /// way `reset` does, bumps the retry counter, re-arms the timeout and
    /// returns `Ok`; anything else comes back unchanged.
    pub async fn on_error(&mut self, error: TxError) -> Result<()> {
        if matches!(error, TxError::Usage(_)) {
            return Err(error);
        }
        let retryable = self.remote.classify(&error) == ErrorClass::Retryable;
        if self.options.debug_retry_logging {
            warn!(
                name = self.options.transaction_name.as_deref().unwrap_or("<unnamed>"),
                retries = self.retries,
                elapsed_ms = self.creation_time.elapsed().as_millis() as u64,
                retryable,
                error = %error,
                "transaction error"
            );
        }
        if !retryable {
            return Err(error);
        }
        if let Some(limit) = self.options.retry_limit {
            if self.retries >= limit {
                debug!(retries = self.retries, "retry limit exhausted");
                return Err(error);
            }
        }
        let shift = self.retries.min(10);
        let base = (BACKOFF_INITIAL_MS << shift).min(BACKOFF_MAX_MS);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_millis((base as f64 * jitter) as u64);
        let outcome = race(self.cancel_rx.clone(), None, async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await;
        self.absorb(outcome)?;
        self.retries += 1;
        self.reset_local();
        self.remote.reset();
        if let Err(e) = self.replay_options() {
            return Err(e);
        }
        self.rearm_deadline();
        self.state = TxState::Active;
        debug!(retries = self.retries, "transaction retrying");
        Ok(())
    }

    /// Returns the transaction to a pristine `Active` state: every local
    /// structure is discarded and persistent options are replayed onto a
    /// fresh remote attempt. The retry counter and creation time survive.
    pub fn reset(&mut self) {
        self.reset_local();
        self.remote.reset();
        if let Err(e) = self.replay_options() {
            self.deferred_error = Some(e);
        }
        self.rearm_deadline();
        self.state = TxState::Active;
        debug!(retries = self.retries, "transaction reset");
    }

    /// Aborts the transaction. Every outstanding suspended operation
    /// resolves promptly with [`TxError::Cancelled`].
    pub fn cancel(&mut self) {
        if self.state == TxState::Committed {
            return;
        }
        self.poison(TxError::Cancelled);
        info!("transaction cancelled");
    }

    /// Applies an option, recording persistent ones for replay after
    /// reset.
    pub fn set_option(&mut self, option: TransactionOption) -> Result<()> {
        self.check_deferred()?;
        if matches!(option, TransactionOption::ReadYourWritesDisable) && self.used {
            return Err(UsageError::OptionAfterFirstOperation.into());
        }
        self.options.apply(&option);
        if matches!(option, TransactionOption::Timeout(_)) {
            self.rearm_deadline();
        }
        self.remote.set_option(&option)?;
        if option.is_persistent() {
            self.persistent_options.push(option);
        }
        Ok(())
    }

    // ---- introspection ---------------------------------------------------

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Number of retries so far; survives `reset`.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Version the store assigned at commit, if one has happened.
    pub fn committed_version(&self) -> Option<Version> {
        self.committed_version
    }

    /// Rough byte footprint of the mutations and conflict ranges
    /// accumulated so far, for transaction-size limits.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    /// When this transaction object was created; survives `reset`.
    pub fn created_at(&self) -> std::time::Instant {
        self.creation_time
    }

    // ---- merge internals -------------------------------------------------

    fn use_writes_for(&self, snapshot: bool) -> bool {
        !self.options.ryw_disabled && (!snapshot || self.options.snapshot_ryw_enabled())
    }

    async fn get_merged(&mut self, key: Key, snapshot: bool) -> Result<Option<Value>> {
        let use_writes = self.use_writes_for(snapshot);
        let point = KeyRange::single(key.clone());
        if use_writes {
            match self.writes.op_at(&key) {
                WriteOp::Set(v) => {
                    self.note_read(point, snapshot);
                    return Ok(Some(v));
                }
                WriteOp::Clear => {
                    self.note_read(point, snapshot);
                    return Ok(None);
                }
                WriteOp::Deferred(stack) => {
                    let base = self.fetch_point_base(&key).await?;
                    let resolved = apply_stack(base.as_deref(), &stack).map(Bytes::from);
                    self.writes
                        .materialize(key.clone(), &stack, resolved.clone());
                    self.note_read(point, snapshot);
                    return Ok(resolved);
                }
                WriteOp::Unknown => {}
            }
            if let Some(hit) = self.cache.lookup_point(&key) {
                self.note_read(point, snapshot);
                return Ok(hit);
            }
        }
        let outcome = race(self.cancel_rx.clone(), self.deadline, self.remote.fetch(&key)).await;
        let fetched = self.absorb(outcome)?;
        let fetched = fetched.map(|v| self.arena.alloc(&v));
        if use_writes {
            let entries: Vec<KeyValue> = fetched
                .clone()
                .map(|value| {
                    vec![KeyValue {
                        key: key.clone(),
                        value,
                    }]
                })
                .unwrap_or_default();
            self.cache.record(&point, &entries, &self.writes);
        }
        self.note_read(point, snapshot);
        Ok(fetched)
    }

    /// Base value for resolving a deferred atomic stack: cache first, then
    /// the remote store. Not recorded in the cache — the write map covers
    /// this key, so the cache would refuse it anyway.
    async fn fetch_point_base(&mut self, key: &Key) -> Result<Option<Value>> {
        if let Some(hit) = self.cache.lookup_point(key) {
            return Ok(hit);
        }
        let outcome = race(self.cancel_rx.clone(), self.deadline, self.remote.fetch(key)).await;
        Ok(self.absorb(outcome)?.map(|v| self.arena.alloc(&v)))
    }

    /// Walks the merged view over `range`, forward or reverse, stopping at
    /// `limit` returned entries. Returns the entries and the span actually
    /// traversed, which the caller records as a read conflict: absence was
    /// observed everywhere the walk covered, not just at returned keys.
    async fn merged_scan(
        &mut self,
        range: KeyRange,
        limit: usize,
        reverse: bool,
        snapshot: bool,
    ) -> Result<(RangeResult, KeyRange)> {
        if reverse {
            self.merged_scan_reverse(range, limit, snapshot).await
        } else {
            self.merged_scan_forward(range, limit, snapshot).await
        }
    }

    async fn merged_scan_forward(
        &mut self,
        range: KeyRange,
        limit: usize,
        snapshot: bool,
    ) -> Result<(RangeResult, KeyRange)> {
        let use_writes = self.use_writes_for(snapshot);
        let mut entries: Vec<KeyValue> = Vec::new();
        let mut cursor = range.begin.clone();
        let mut traversed_end = range.begin.clone();
        let mut more = false;

        while cursor < range.end {
            let (span_end, base) = self
                .base_span_forward(&cursor, &range.end, limit, entries.len(), use_writes)
                .await?;
            let span = KeyRange {
                begin: cursor.clone(),
                end: span_end.clone(),
            };
            let segs = if use_writes {
                self.writes.segments_in(&span)
            } else {
                vec![(span.clone(), WriteOp::Unknown)]
            };
            let mut base_iter = base.into_iter().peekable();
            let mut materialize: Vec<(Key, Vec<AtomicMutation>, Option<Value>)> = Vec::new();
            let mut stopped = false;

            'segs: for (seg_range, op) in segs {
                match op {
                    WriteOp::Set(v) => {
                        while base_iter
                            .peek()
                            .is_some_and(|kv| kv.key < seg_range.end)
                        {
                            base_iter.next();
                        }
                        entries.push(KeyValue {
                            key: seg_range.begin.clone(),
                            value: v,
                        });
                        if limit != 0 && entries.len() >= limit {
                            stopped = true;
                            break 'segs;
                        }
                    }
                    WriteOp::Clear => {
                        while base_iter
                            .peek()
                            .is_some_and(|kv| kv.key < seg_range.end)
                        {
                            base_iter.next();
                        }
                    }
                    WriteOp::Deferred(stack) => {
                        let mut base_value = None;
                        while base_iter
                            .peek()
                            .is_some_and(|kv| kv.key < seg_range.end)
                        {
                            let kv = base_iter.next().expect("peeked entry");
                            if kv.key == seg_range.begin {
                                base_value = Some(kv.value);
                            }
                        }
                        let resolved =
                            apply_stack(base_value.as_deref(), &stack).map(Bytes::from);
                        materialize.push((
                            seg_range.begin.clone(),
                            stack.to_vec(),
                            resolved.clone(),
                        ));
                        if let Some(v) = resolved {
                            entries.push(KeyValue {
                                key: seg_range.begin.clone(),
                                value: v,
                            });
                            if limit != 0 && entries.len() >= limit {
                                stopped = true;
                                break 'segs;
                            }
                        }
                    }
                    WriteOp::Unknown => {
                        while base_iter
                            .peek()
                            .is_some_and(|kv| kv.key < seg_range.end)
                        {
                            let kv = base_iter.next().expect("peeked entry");
                            entries.push(kv);
                            if limit != 0 && entries.len() >= limit {
                                stopped = true;
                                break 'segs;
                            }
                        }
                    }
                }
            }

            for (key, stack, resolved) in materialize {
                self.writes.materialize(key, &stack, resolved);
            }
            if stopped {
                more = true;
                traversed_end = key_after(&entries.last().expect("limit stop").key);
                break;
            }
            cursor = span_end.clone();
            traversed_end = span_end;
        }

        let traversed = KeyRange {
            begin: range.begin,
            end: traversed_end,
        };
        Ok((RangeResult { entries, more }, traversed))
    }

    async fn merged_scan_reverse(
        &mut self,
        range: KeyRange,
        limit: usize,
        snapshot: bool,
    ) -> Result<(RangeResult, KeyRange)> {
        let use_writes = self.use_writes_for(snapshot);
        let mut entries: Vec<KeyValue> = Vec::new();
        let mut cursor_end = range.end.clone();
        let mut traversed_begin = range.end.clone();
        let mut more = false;

        while cursor_end > range.begin {
            let (span_begin, base) = self
                .base_span_reverse(&range.begin, &cursor_end, limit, entries.len(), use_writes)
                .await?;
            let span = KeyRange {
                begin: span_begin.clone(),
                end: cursor_end.clone(),
            };
            let segs = if use_writes {
                self.writes.segments_in(&span)
            } else {
                vec![(span.clone(), WriteOp::Unknown)]
            };
            let mut base_iter = base.into_iter().rev().peekable();
            let mut materialize: Vec<(Key, Vec<AtomicMutation>, Option<Value>)> = Vec::new();
            let mut stopped = false;

            'segs: for (seg_range, op) in segs.into_iter().rev() {
                match op {
                    WriteOp::Set(v) => {
                        while base_iter
                            .peek()
                            .is_some_and(|kv| kv.key >= seg_range.begin)
                        {
                            base_iter.next();
                        }
                        entries.push(KeyValue {
                            key: seg_range.begin.clone(),
                            value: v,
                        });
                        if limit != 0 && entries.len() >= limit {
                            stopped = true;
                            break 'segs;
                        }
                    }
                    WriteOp::Clear => {
                        while base_iter
                            .peek()
                            .is_some_and(|kv| kv.key >= seg_range.begin)
                        {
                            base_iter.next();
                        }
                    }
                    WriteOp::Deferred(stack) => {
                        let mut base_value = None;
                        while base_iter
                            .peek()
                            .is_some_and(|kv| kv.key >= seg_range.begin)
                        {
                            let kv = base_iter.next().expect("peeked entry");
                            if kv.key == seg_range.begin {
                                base_value = Some(kv.value);
                            }
                        }
                        let resolved =
                            apply_stack(base_value.as_deref(), &stack).map(Bytes::from);
                        materialize.push((
                            seg_range.begin.clone(),
                            stack.to_vec(),
                            resolved.clone(),
                        ));
                        if let Some(v) = resolved {
                            entries.push(KeyValue {
                                key: seg_range.begin.clone(),
                                value: v,
                            });
                            if limit != 0 && entries.len() >= limit {
                                stopped = true;
                                break 'segs;
                            }
                        }
                    }
                    WriteOp::Unknown => {
                        while base_iter
                            .peek()
                            .is_some_and(|kv| kv.key >= seg_range.begin)
                        {
                            let kv = base_iter.next().expect("peeked entry");
                            entries.push(kv);
                            if limit != 0 && entries.len() >= limit {
                                stopped = true;
                                break 'segs;
                            }
                        }
                    }
                }
            }

            for (key, stack, resolved) in materialize {
                self.writes.materialize(key, &stack, resolved);
            }
            if stopped {
                more = true;
                traversed_begin = entries.last().expect("limit stop").key.clone();
                break;
            }
            cursor_end = span_begin.clone();
            traversed_begin = span_begin;
        }

        let traversed = KeyRange {
            begin: traversed_begin,
            end: range.end,
        };
        Ok((RangeResult { entries, more }, traversed))
    }

    /// Base (cache/remote) view of the longest resolvable span starting at
    /// `cursor`. Entries come back ascending and arena-owned.
    async fn base_span_forward(
        &mut self,
        cursor: &Key,
        end: &Key,
        limit: usize,
        have: usize,
        use_writes: bool,
    ) -> Result<(Key, Vec<KeyValue>)> {
        if use_writes {
            if let Some(hit) = self.cache.known_prefix(cursor, end) {
                return Ok(hit);
            }
        }
        let want = self.batch_limit(limit, have);
        let fetch = KeyRange {
            begin: cursor.clone(),
            end: end.clone(),
        };
        let outcome = race(
            self.cancel_rx.clone(),
            self.deadline,
            self.remote.fetch_range(fetch, want, false),
        )
        .await;
        let batch = self.absorb(outcome)?;
        let entries: Vec<KeyValue> = batch
            .entries
            .iter()
            .map(|kv| KeyValue {
                key: self.arena.alloc(&kv.key),
                value: self.arena.alloc(&kv.value),
            })
            .collect();
        let span_end = match entries.last() {
            Some(last) if batch.more => key_after(&last.key),
            _ => end.clone(),
        };
        if use_writes {
            let span = KeyRange {
                begin: cursor.clone(),
                end: span_end.clone(),
            };
            self.cache.record(&span, &entries, &self.writes);
        }
        Ok((span_end, entries))
    }

    /// Reverse counterpart of [`Self::base_span_forward`]: the longest
    /// resolvable span ending at `cursor_end`, entries ascending.
    async fn base_span_reverse(
        &mut self,
        begin: &Key,
        cursor_end: &Key,
        limit: usize,
        have: usize,
        use_writes: bool,
    ) -> Result<(Key, Vec<KeyValue>)> {
        if use_writes {
            if let Some(hit) = self.cache.known_suffix(begin, cursor_end) {
                return Ok(hit);
            }
        }
        let want = self.batch_limit(limit, have);
        let fetch = KeyRange {
            begin: begin.clone(),
            end: cursor_end.clone(),
        };
        let outcome = race(
            self.cancel_rx.clone(),
            self.deadline,
            self.remote.fetch_range(fetch, want, true),
        )
        .await;
        let batch = self.absorb(outcome)?;
        let mut entries: Vec<KeyValue> = batch
            .entries
            .iter()
            .map(|kv| KeyValue {
                key: self.arena.alloc(&kv.key),
                value: self.arena.alloc(&kv.value),
            })
            .collect();
        // Remote reverse batches arrive descending; keep them ascending.
        entries.reverse();
        let span_begin = match entries.first() {
            Some(first) if batch.more => first.key.clone(),
            _ => begin.clone(),
        };
        if use_writes {
            let span = KeyRange {
                begin: span_begin.clone(),
                end: cursor_end.clone(),
            };
            self.cache.record(&span, &entries, &self.writes);
        }
        Ok((span_begin, entries))
    }

    fn batch_limit(&self, limit: usize, have: usize) -> usize {
        if limit == 0 {
            return 0;
        }
        let needed = limit.saturating_sub(have).max(1);
        if self.options.read_ahead_disabled {
            needed
        } else {
            needed.max(READ_AHEAD_ROWS)
        }
    }

    /// Forward selectors with offset one are plain range boundaries:
    /// `first_greater_or_equal(k)` bounds at `k`, `first_greater_than(k)`
    /// at the key after `k`. Resolving them with a scan would observe (and
    /// conflict on) far more of the keyspace than the range read itself.
    fn trivial_bound(&self, sel: &KeySelector) -> Result<Option<Key>> {
        if sel.offset != 1 {
            return Ok(None);
        }
        if sel.key.len() > MAX_KEY_SIZE {
            return Err(UsageError::KeyTooLarge.into());
        }
        let bound = if sel.or_equal {
            key_after(&sel.key)
        } else {
            sel.key.clone()
        };
        if bound > self.max_read_key() {
            return Err(UsageError::KeyOutsideLegalRange.into());
        }
        Ok(Some(bound))
    }

    async fn resolve_selector(&mut self, sel: &KeySelector, snapshot: bool) -> Result<Key> {
        if sel.key.len() > MAX_KEY_SIZE {
            return Err(UsageError::KeyTooLarge.into());
        }
        if sel.key > self.max_read_key() {
            return Err(UsageError::KeyOutsideLegalRange.into());
        }
        if sel.offset > 0 {
            let start = if sel.or_equal {
                key_after(&sel.key)
            } else {
                sel.key.clone()
            };
            let scan = KeyRange {
                begin: start,
                end: self.max_read_key(),
            };
            let (result, traversed) = self
                .merged_scan(scan, sel.offset as usize, false, snapshot)
                .await?;
            self.note_read(traversed, snapshot);
            if result.entries.len() == sel.offset as usize {
                Ok(result.entries.last().expect("offset entries").key.clone())
            } else {
                Ok(self.max_read_key())
            }
        } else {
            let count = 1usize.saturating_add((-sel.offset) as usize);
            let end = if sel.or_equal {
                key_after(&sel.key)
            } else {
                sel.key.clone()
            };
            let scan = KeyRange {
                begin: Bytes::new(),
                end,
            };
            let (result, traversed) = self.merged_scan(scan, count, true, snapshot).await?;
            self.note_read(traversed, snapshot);
            if result.entries.len() == count {
                Ok(result.entries.last().expect("count entries").key.clone())
            } else {
                Ok(Bytes::new())
            }
        }
    }

    // ---- bookkeeping -----------------------------------------------------

    fn note_read(&mut self, range: KeyRange, snapshot: bool) {
        if snapshot || range.is_empty() {
            return;
        }
        self.approximate_size +=
            range.begin.len() + range.end.len() + CONFLICT_RANGE_OVERHEAD;
        self.conflicts.add_read(range);
    }

    fn note_write(&mut self, range: KeyRange, bytes: usize) {
        self.approximate_size += bytes + MUTATION_OVERHEAD;
        if !self.options.take_next_write_exemption() {
            self.approximate_size +=
                range.begin.len() + range.end.len() + CONFLICT_RANGE_OVERHEAD;
            self.conflicts.add_write(range);
        }
    }

    fn max_read_key(&self) -> Key {
        if self.options.read_system_keys || self.options.access_system_keys {
            system_space_end()
        } else {
            user_space_end()
        }
    }

    fn max_write_key(&self) -> Key {
        if self.options.access_system_keys {
            system_space_end()
        } else {
            user_space_end()
        }
    }

    fn validate_read_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(UsageError::KeyTooLarge.into());
        }
        if key >= &self.max_read_key()[..] {
            return Err(UsageError::KeyOutsideLegalRange.into());
        }
        Ok(())
    }

    fn validate_read_range(&self, begin: &[u8], end: &[u8]) -> Result<()> {
        if begin.len() > MAX_KEY_SIZE || end.len() > MAX_KEY_SIZE {
            return Err(UsageError::KeyTooLarge.into());
        }
        if begin > end {
            return Err(UsageError::InvertedRange.into());
        }
        if end > &self.max_read_key()[..] {
            return Err(UsageError::KeyOutsideLegalRange.into());
        }
        Ok(())
    }

    fn validate_write_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(UsageError::KeyTooLarge.into());
        }
        if key >= &self.max_write_key()[..] {
            return Err(UsageError::KeyOutsideLegalRange.into());
        }
        Ok(())
    }

    fn validate_write_range(&self, begin: &[u8], end: &[u8]) -> Result<()> {
        if begin.len() > MAX_KEY_SIZE || end.len() > MAX_KEY_SIZE {
            return Err(UsageError::KeyTooLarge.into());
        }
        if begin > end {
            return Err(UsageError::InvertedRange.into());
        }
        if end > &self.max_write_key()[..] {
            return Err(UsageError::KeyOutsideLegalRange.into());
        }
        Ok(())
    }

    // ---- state machine internals ----------------------------------------

    fn absorb<T>(&mut self, outcome: RaceOutcome<T>) -> Result<T> {
        match outcome {
            RaceOutcome::Done(r) => r,
            RaceOutcome::Cancelled => Err(self
                .deferred_error
                .clone()
                .unwrap_or(TxError::Cancelled)),
            RaceOutcome::TimedOut => {
                self.poison(TxError::TimedOut);
                Err(TxError::TimedOut)
            }
        }
    }

    fn poison(&mut self, error: TxError) {
        if self.deferred_error.is_none() {
            self.deferred_error = Some(error);
        }
        self.state = TxState::Failed;
        self.remote.cancel();
        let _ = self.cancel_tx.send(true);
    }

    /// Re-raises an out-of-band error (timeout, cancel) at the next call.
    fn check_deferred(&mut self) -> Result<()> {
        if let Some(d) = self.deadline {
            if self.state == TxState::Active
                && Instant::now() >= d
                && self.deferred_error.is_none()
            {
                self.poison(TxError::TimedOut);
            }
        }
        if let Some(e) = &self.deferred_error {
            return Err(e.clone());
        }
        Ok(())
    }

    fn ensure_active(&mut self) -> Result<()> {
        self.check_deferred()?;
        if self.commit_started && !self.options.used_during_commit_protection_disabled {
            return Err(UsageError::UsedDuringCommit.into());
        }
        match self.state {
            TxState::Active => Ok(()),
            TxState::Committing => Err(UsageError::UsedDuringCommit.into()),
            TxState::Committed | TxState::Failed => Err(UsageError::NotActive.into()),
        }
    }

    fn reset_local(&mut self) {
        self.arena.clear();
        self.writes.clear_all();
        self.cache.clear_all();
        self.conflicts.clear();
        self.options = OptionState::default();
        self.deferred_error = None;
        self.commit_started = false;
        self.committed_version = None;
        self.approximate_size = 0;
        self.used = false;
        self.explicit_conflicts = false;
        let (tx, rx) = signal::channel(false);
        self.cancel_tx = tx;
        self.cancel_rx = rx;
    }

    fn replay_options(&mut self) -> Result<()> {
        let options = self.persistent_options.clone();
        for option in &options {
            self.options.apply(option);
            self.remote.set_option(option)?;
        }
        Ok(())
    }

    fn rearm_deadline(&mut self) {
        self.deadline = self.options.timeout.map(|t| Instant::now() + t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::Cluster;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn tx(cluster: &Cluster) -> Transaction<crate::remote::memory::MemoryRemote> {
        Transaction::new(cluster.create_transaction())
    }

    #[tokio::test]
    async fn key_guards_reject_illegal_input() {
        let cluster = Cluster::new();
        let mut t = tx(&cluster);
        let long_key = vec![0u8; MAX_KEY_SIZE + 1];
        assert_eq!(
            t.set(&long_key, b"v"),
            Err(TxError::Usage(UsageError::KeyTooLarge))
        );
        assert_eq!(
            t.set(b"\xff\x01", b"v"),
            Err(TxError::Usage(UsageError::KeyOutsideLegalRange))
        );
        assert_eq!(
            t.clear_range(b"z", b"a"),
            Err(TxError::Usage(UsageError::InvertedRange))
        );
        let big = vec![0u8; MAX_VALUE_SIZE + 1];
        assert_eq!(
            t.set(b"k", &big),
            Err(TxError::Usage(UsageError::ValueTooLarge))
        );
    }

    #[tokio::test]
    async fn system_keys_open_with_option() {
        let cluster = Cluster::new();
        let mut t = tx(&cluster);
        assert!(t.get(b"\xff/x", false).await.is_err());
        t.set_option(TransactionOption::AccessSystemKeys).unwrap();
        assert_eq!(t.get(b"\xff/x", false).await.unwrap(), None);
        t.set(b"\xff/x", b"1").unwrap();
        assert_eq!(t.get(b"\xff/x", false).await.unwrap(), Some(b("1")));
    }

    #[tokio::test]
    async fn ryw_disable_rejected_after_use() {
        let cluster = Cluster::new();
        let mut t = tx(&cluster);
        t.set(b"k", b"v").unwrap();
        assert_eq!(
            t.set_option(TransactionOption::ReadYourWritesDisable),
            Err(TxError::Usage(UsageError::OptionAfterFirstOperation))
        );
    }

    #[tokio::test]
    async fn mutations_after_commit_are_rejected() {
        let cluster = Cluster::new();
        let mut t = tx(&cluster);
        t.set(b"k", b"v").unwrap();
        t.commit().await.unwrap();
        assert_eq!(t.set(b"k", b"w"), Err(TxError::Usage(UsageError::UsedDuringCommit)));
        assert!(matches!(
            t.commit().await,
            Err(TxError::Usage(UsageError::UsedDuringCommit))
        ));
    }

    #[tokio::test]
    async fn read_only_commit_is_local() {
        let cluster = Cluster::new();
        cluster.insert(b("k"), b("v"));
        let before = cluster.current_version();
        let mut t = tx(&cluster);
        assert_eq!(t.get(b"k", false).await.unwrap(), Some(b("v")));
        t.commit().await.unwrap();
        assert_eq!(cluster.current_version(), before);
        assert_eq!(t.committed_version(), None);
    }
}
