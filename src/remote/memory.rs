//! In-process implementation of the remote collaborator.
//!
//! A [`Cluster`] is a shared versioned key-value store; each
//! [`MemoryRemote`] created from it behaves like one remote transaction:
//! it snapshots the store at its read version, detects conflicts between
//! the read ranges it is handed and writes committed after that version,
//! and fires watches when committed values change. Tests drive several
//! transactions against one cluster to exercise real conflict and retry
//! flows without a network.

use crate::atomic;
use crate::error::{Result, TxError};
use crate::options::TransactionOption;
use crate::remote::{CommitPayload, ErrorClass, Mutation, RemoteTransaction};
use crate::types::{Key, KeyRange, KeyValue, RangeResult, Value, Version};
use crate::watch::Watch;
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Shared fetch counters, cloneable before the remote moves into a
/// transaction so tests can observe cache behaviour from outside.
#[derive(Clone, Default, Debug)]
pub struct RemoteStats {
    fetches: Arc<AtomicUsize>,
}

impl RemoteStats {
    /// Point and range fetches that reached the remote store.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }
}

struct WatchEntry {
    baseline: Option<Value>,
    fire: oneshot::Sender<()>,
}

#[derive(Default)]
struct StoreInner {
    data: BTreeMap<Key, Value>,
    version: Version,
    /// Write-conflict ranges of every commit, newest last.
    commit_log: Vec<(Version, Vec<KeyRange>)>,
    watches: FxHashMap<Key, Vec<WatchEntry>>,
}

impl StoreInner {
    fn fire_watches(&mut self, keys: &[Key]) {
        for key in keys {
            let Some(entries) = self.watches.remove(key) else {
                continue;
            };
            let current = self.data.get(key).cloned();
            let mut kept = Vec::new();
            for entry in entries {
                if current != entry.baseline {
                    let _ = entry.fire.send(());
                } else {
                    kept.push(entry);
                }
            }
            if !kept.is_empty() {
                self.watches.insert(key.clone(), kept);
            }
        }
    }

    fn apply(&mut self, mutations: &[Mutation]) -> Vec<Key> {
        let mut touched = Vec::new();
        for m in mutations {
            match m {
                Mutation::Set { key, value } => {
                    self.data.insert(key.clone(), value.clone());
                    touched.push(key.clone());
                }
                Mutation::ClearRange { range } => {
                    let doomed: Vec<Key> = self
                        .data
                        .range(range.begin.clone()..range.end.clone())
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in doomed {
                        self.data.remove(&k);
                        touched.push(k);
                    }
                }
                Mutation::Atomic { key, op, operand } => {
                    let existing = self.data.get(key).map(|v| v.to_vec());
                    match atomic::apply(*op, existing.as_deref(), operand) {
                        Some(bytes) => {
                            self.data.insert(key.clone(), Bytes::from(bytes));
                        }
                        None => {
                            self.data.remove(key);
                        }
                    }
                    touched.push(key.clone());
                }
            }
        }
        touched
    }
}

/// A shared in-memory versioned store.
#[derive(Clone, Default)]
pub struct Cluster {
    inner: Arc<Mutex<StoreInner>>,
}

impl Cluster {
    /// Creates an empty store at version zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a remote transaction against this store.
    pub fn create_transaction(&self) -> MemoryRemote {
        MemoryRemote {
            store: Arc::clone(&self.inner),
            read_version: None,
            snapshot: None,
            inject_fetch_failures: 0,
            cancelled: false,
            stats: RemoteStats::default(),
        }
    }

    /// Writes a value out-of-band, as if another client committed it.
    pub fn insert(&self, key: impl Into<Key>, value: impl Into<Value>) {
        let key = key.into();
        let mut inner = self.inner.lock();
        inner.version += 1;
        let version = inner.version;
        inner.data.insert(key.clone(), value.into());
        let range = KeyRange::single(key.clone());
        inner.commit_log.push((version, vec![range]));
        inner.fire_watches(&[key]);
    }

    /// Removes a key out-of-band.
    pub fn remove(&self, key: impl Into<Key>) {
        let key = key.into();
        let mut inner = self.inner.lock();
        inner.version += 1;
        let version = inner.version;
        inner.data.remove(&key);
        let range = KeyRange::single(key.clone());
        inner.commit_log.push((version, vec![range]));
        inner.fire_watches(&[key]);
    }

    /// Reads the current committed value of a key.
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.inner.lock().data.get(key).cloned()
    }

    /// The store's current version.
    pub fn current_version(&self) -> Version {
        self.inner.lock().version
    }

    /// Number of committed keys, for test assertions.
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    /// True when the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().data.is_empty()
    }
}

/// One remote transaction over a [`Cluster`].
pub struct MemoryRemote {
    store: Arc<Mutex<StoreInner>>,
    read_version: Option<Version>,
    snapshot: Option<BTreeMap<Key, Value>>,
    inject_fetch_failures: usize,
    cancelled: bool,
    stats: RemoteStats,
}

impl MemoryRemote {
    /// Makes the next `n` fetches fail with a retryable
    /// [`TxError::RemoteFetch`], for retry-path tests.
    pub fn fail_next_fetches(&mut self, n: usize) {
        self.inject_fetch_failures = n;
    }

    /// Handle onto this remote's fetch counters.
    pub fn stats(&self) -> RemoteStats {
        self.stats.clone()
    }

    fn ensure_snapshot(&mut self) -> Result<Version> {
        if self.cancelled {
            return Err(TxError::Cancelled);
        }
        if self.read_version.is_none() {
            let inner = self.store.lock();
            self.read_version = Some(inner.version);
            self.snapshot = Some(inner.data.clone());
            debug!(read_version = inner.version, "snapshot established");
        }
        Ok(self.read_version.expect("snapshot just established"))
    }

    fn take_injected_failure(&mut self) -> Result<()> {
        if self.inject_fetch_failures > 0 {
            self.inject_fetch_failures -= 1;
            return Err(TxError::RemoteFetch("injected transient failure".into()));
        }
        Ok(())
    }
}

impl RemoteTransaction for MemoryRemote {
    async fn read_version(&mut self) -> Result<Version> {
        self.ensure_snapshot()
    }

    async fn fetch(&mut self, key: &[u8]) -> Result<Option<Value>> {
        self.take_injected_failure()?;
        self.stats.bump();
        self.ensure_snapshot()?;
        Ok(self
            .snapshot
            .as_ref()
            .expect("snapshot established")
            .get(key)
            .cloned())
    }

    async fn fetch_range(
        &mut self,
        range: KeyRange,
        limit: usize,
        reverse: bool,
    ) -> Result<RangeResult> {
        self.take_injected_failure()?;
        self.stats.bump();
        self.ensure_snapshot()?;
        let snapshot = self.snapshot.as_ref().expect("snapshot established");
        let iter = snapshot.range(range.begin.clone()..range.end.clone());
        let mut entries: Vec<KeyValue> = Vec::new();
        let mut more = false;
        if reverse {
            for (k, v) in iter.rev() {
                if limit != 0 && entries.len() == limit {
                    more = true;
                    break;
                }
                entries.push(KeyValue {
                    key: k.clone(),
                    value: v.clone(),
                });
            }
        } else {
            for (k, v) in iter {
                if limit != 0 && entries.len() == limit {
                    more = true;
                    break;
                }
                entries.push(KeyValue {
                    key: k.clone(),
                    value: v.clone(),
                });
            }
        }
        Ok(RangeResult { entries, more })
    }

    async fn commit(&mut self, payload: CommitPayload) -> Result<Version> {
        if self.cancelled {
            return Err(TxError::Cancelled);
        }
        let mut inner = self.store.lock();
        let read_version = self.read_version.unwrap_or(inner.version);
        if !payload.read_conflicts.is_empty() {
            for (version, write_ranges) in inner.commit_log.iter().rev() {
                if *version <= read_version {
                    break;
                }
                let clash = write_ranges.iter().any(|w| {
                    payload.read_conflicts.iter().any(|r| r.intersects(w))
                });
                if clash {
                    debug!(version, "commit rejected by conflicting write");
                    return Err(TxError::Conflict);
                }
            }
        }
        let touched = inner.apply(&payload.mutations);
        inner.version += 1;
        let version = inner.version;
        inner
            .commit_log
            .push((version, payload.write_conflicts.clone()));
        inner.fire_watches(&touched);
        Ok(version)
    }

    fn classify(&self, error: &TxError) -> ErrorClass {
        match error {
            TxError::Conflict | TxError::RemoteFetch(_) => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    fn register_watch(&mut self, key: &[u8], baseline: Option<Value>) -> Result<Watch> {
        let mut inner = self.store.lock();
        let key = Bytes::copy_from_slice(key);
        let baseline = match baseline {
            Some(v) => Some(v),
            None => inner.data.get(&key).cloned(),
        };
        let (tx, watch) = Watch::channel();
        inner.watches.entry(key).or_default().push(WatchEntry {
            baseline,
            fire: tx,
        });
        Ok(watch)
    }

    fn set_option(&mut self, _option: &TransactionOption) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {
        self.read_version = None;
        self.snapshot = None;
        self.cancelled = false;
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn snapshot_is_stable_across_later_commits() {
        let cluster = Cluster::new();
        cluster.insert(b("k"), b("old"));
        let mut tr = cluster.create_transaction();
        assert_eq!(tr.fetch(b"k").await.unwrap(), Some(b("old")));
        cluster.insert(b("k"), b("new"));
        assert_eq!(tr.fetch(b"k").await.unwrap(), Some(b("old")));
        assert_eq!(cluster.get(b"k"), Some(b("new")));
    }

    #[tokio::test]
    async fn commit_detects_read_write_conflict() {
        let cluster = Cluster::new();
        cluster.insert(b("k"), b("0"));
        let mut tr = cluster.create_transaction();
        tr.fetch(b"k").await.unwrap();
        cluster.insert(b("k"), b("1"));
        let payload = CommitPayload {
            mutations: vec![Mutation::Set {
                key: b("other"),
                value: b("x"),
            }],
            read_conflicts: vec![KeyRange::single(b("k"))],
            write_conflicts: vec![KeyRange::single(b("other"))],
        };
        assert_eq!(tr.commit(payload).await, Err(TxError::Conflict));
    }

    #[tokio::test]
    async fn commit_without_overlap_succeeds() {
        let cluster = Cluster::new();
        let mut tr = cluster.create_transaction();
        tr.fetch(b"a").await.unwrap();
        cluster.insert(b("far"), b("1"));
        let payload = CommitPayload {
            mutations: vec![Mutation::Set {
                key: b("a"),
                value: b("v"),
            }],
            read_conflicts: vec![KeyRange::single(b("a"))],
            write_conflicts: vec![KeyRange::single(b("a"))],
        };
        tr.commit(payload).await.unwrap();
        assert_eq!(cluster.get(b"a"), Some(b("v")));
    }

    #[tokio::test]
    async fn watch_fires_on_change_only() {
        let cluster = Cluster::new();
        cluster.insert(b("w"), b("0"));
        let mut tr = cluster.create_transaction();
        let watch = tr.register_watch(b"w", None).unwrap();
        // Same value: no fire.
        cluster.insert(b("w"), b("0"));
        // Changed value: fire.
        cluster.insert(b("w"), b("1"));
        watch.wait().await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let cluster = Cluster::new();
        let mut tr = cluster.create_transaction();
        tr.fail_next_fetches(1);
        let err = tr.fetch(b"k").await.unwrap_err();
        assert!(matches!(err, TxError::RemoteFetch(_)));
        assert_eq!(tr.classify(&err), ErrorClass::Retryable);
        assert_eq!(tr.fetch(b"k").await.unwrap(), None);
    }
}
