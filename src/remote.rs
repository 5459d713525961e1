//! The remote-transaction collaborator interface.
//!
//! The overlay never talks to the network itself; everything it cannot
//! answer from local state goes through this trait. Implementations own
//! read-version assignment, the commit/conflict-resolution protocol, watch
//! delivery and error classification. The crate ships one implementation,
//! [`memory::MemoryRemote`], an in-process versioned store used by tests,
//! examples and benches.

pub mod memory;

use crate::atomic::AtomicOp;
use crate::error::{Result, TxError};
use crate::options::TransactionOption;
use crate::types::{Key, KeyRange, RangeResult, Value, Version};
use crate::watch::Watch;
use bytes::Bytes;

/// How the remote store classifies a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The transaction may be retried from a fresh attempt.
    Retryable,
    /// Retrying cannot help; surface the error.
    Fatal,
}

/// One buffered write in flush order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Store `value` at `key`.
    Set {
        /// Target key.
        key: Key,
        /// Value to store.
        value: Value,
    },
    /// Remove every key in `range`.
    ClearRange {
        /// Range to clear.
        range: KeyRange,
    },
    /// Apply an atomic operation whose base value the overlay never
    /// learned; the store evaluates it at commit.
    Atomic {
        /// Target key.
        key: Key,
        /// Operation to apply.
        op: AtomicOp,
        /// Caller-supplied operand.
        operand: Bytes,
    },
}

/// Everything a commit hands to the remote store.
#[derive(Debug, Clone, Default)]
pub struct CommitPayload {
    /// Buffered mutations in key order.
    pub mutations: Vec<Mutation>,
    /// Merged, disjoint read-conflict ranges.
    pub read_conflicts: Vec<KeyRange>,
    /// Merged, disjoint write-conflict ranges.
    pub write_conflicts: Vec<KeyRange>,
}

impl CommitPayload {
    /// Number of mutations in the payload.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// True when the payload carries neither mutations nor conflicts.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.read_conflicts.is_empty() && self.write_conflicts.is_empty()
    }
}

/// The narrow surface the overlay consumes from the distributed store.
///
/// Async methods are the overlay's suspension points; every call races the
/// transaction's cancellation signal and deadline, so implementations may
/// block for as long as the network takes.
#[allow(async_fn_in_trait)]
pub trait RemoteTransaction {
    /// Obtains (or confirms) the transaction's read version.
    async fn read_version(&mut self) -> Result<Version>;

    /// Point fetch at the read version.
    async fn fetch(&mut self, key: &[u8]) -> Result<Option<Value>>;

    /// Range fetch at the read version. `limit == 0` means unlimited;
    /// entries come back in iteration order (descending when `reverse`),
    /// with `more` set when the limit cut the scan short.
    async fn fetch_range(
        &mut self,
        range: KeyRange,
        limit: usize,
        reverse: bool,
    ) -> Result<RangeResult>;

    /// Submits writes and conflict ranges; resolves with the commit
    /// version or the store's verdict.
    async fn commit(&mut self, payload: CommitPayload) -> Result<Version>;

    /// Classifies an error for `on_error`.
    fn classify(&self, error: &TxError) -> ErrorClass;

    /// Registers interest in remote changes to `key`. When `baseline` is
    /// given the watch compares against it, otherwise against the store's
    /// current value; the returned handle resolves once, independent of
    /// this transaction's outcome.
    fn register_watch(&mut self, key: &[u8], baseline: Option<Value>) -> Result<Watch>;

    /// Forwards an option the remote layer may care about.
    fn set_option(&mut self, option: &TransactionOption) -> Result<()>;

    /// Discards the attempt's remote state (read version, in-flight work)
    /// so the next operation starts a fresh attempt.
    fn reset(&mut self);

    /// Aborts remote work; subsequent calls fail with a cancellation.
    fn cancel(&mut self);
}
