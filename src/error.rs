//! Error taxonomy for the transaction overlay.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TxError>;

/// Errors surfaced by transaction operations.
///
/// Remote errors are classified retryable or fatal by the remote
/// collaborator ([`crate::remote::RemoteTransaction::classify`]); the
/// overlay itself never retries silently. Errors are cheap to clone so a
/// single failure can be parked in the deferred-error slot and re-raised
/// at the next call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxError {
    /// A suspended read failed inside the remote collaborator.
    #[error("remote fetch failed: {0}")]
    RemoteFetch(String),
    /// Commit was rejected because a conflict range overlapped another
    /// transaction's writes.
    #[error("transaction not committed due to conflict with another transaction")]
    Conflict,
    /// The operation was aborted by an explicit `cancel`.
    #[error("operation aborted because the transaction was cancelled")]
    Cancelled,
    /// The configured timeout elapsed while the transaction was active.
    #[error("operation aborted because the transaction timed out")]
    TimedOut,
    /// The caller violated the usage contract.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),
}

/// Local structural misuse, reported synchronously at the offending call.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum UsageError {
    /// An operation was issued after `commit` had already started.
    #[error("transaction used while a commit is in progress")]
    UsedDuringCommit,
    /// An operation was issued on a committed or failed transaction.
    #[error("transaction is no longer active")]
    NotActive,
    /// A key outside the legal keyspace was read or written without the
    /// matching system-access option.
    #[error("key outside legal range")]
    KeyOutsideLegalRange,
    /// Key length exceeds [`crate::types::MAX_KEY_SIZE`].
    #[error("key exceeds maximum length")]
    KeyTooLarge,
    /// Value length exceeds [`crate::types::MAX_VALUE_SIZE`].
    #[error("value exceeds maximum length")]
    ValueTooLarge,
    /// A range with `begin > end` was supplied.
    #[error("range begin key is after the end key")]
    InvertedRange,
    /// An option was set at a point in the lifecycle where it cannot apply.
    #[error("option cannot be set after the first read or write")]
    OptionAfterFirstOperation,
}
