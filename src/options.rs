//! Transaction options and their replay across resets.
//!
//! Options arrive through [`crate::transaction::Transaction::set_option`]
//! and are recorded in issue order; after every reset the persistent ones
//! are replayed, in that order, onto the fresh remote transaction so a
//! retried transaction behaves like its first attempt.

use std::time::Duration;

/// A caller-settable knob of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOption {
    /// Reads no longer observe this transaction's own uncommitted writes.
    /// Must be set before the first read or write.
    ReadYourWritesDisable,
    /// Range reads fetch exactly what was asked for instead of warming the
    /// cache with a larger batch.
    ReadAheadDisable,
    /// Allows reads from the system keyspace.
    ReadSystemKeys,
    /// Allows reads from and writes to the system keyspace.
    AccessSystemKeys,
    /// The next write (and only the next) records no write-conflict range.
    NextWriteNoWriteConflictRange,
    /// Snapshot reads observe this transaction's own writes (the default).
    SnapshotRywEnable,
    /// Snapshot reads bypass this transaction's own writes.
    SnapshotRywDisable,
    /// Log each retry at warn level, tagging it with the given name.
    DebugRetryLogging(Option<String>),
    /// Cancel the transaction if it stays active longer than this.
    Timeout(Duration),
    /// Upper bound on `on_error` retries.
    RetryLimit(u32),
    /// Disables the guard rejecting operations issued while a commit is in
    /// flight.
    UsedDuringCommitProtectionDisable,
}

impl TransactionOption {
    /// Whether the option survives `reset` and is replayed onto the next
    /// attempt. Only the one-shot write exemption is not.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, TransactionOption::NextWriteNoWriteConflictRange)
    }
}

/// The decoded option flags a transaction consults while running.
#[derive(Debug, Clone)]
pub(crate) struct OptionState {
    pub ryw_disabled: bool,
    pub read_ahead_disabled: bool,
    pub read_system_keys: bool,
    pub access_system_keys: bool,
    pub next_write_no_conflict: bool,
    /// Positive means snapshot reads see local writes; enable/disable
    /// adjust the counter so nested scopes compose.
    pub snapshot_ryw: i32,
    pub debug_retry_logging: bool,
    pub transaction_name: Option<String>,
    pub timeout: Option<Duration>,
    pub retry_limit: Option<u32>,
    pub used_during_commit_protection_disabled: bool,
}

impl Default for OptionState {
    fn default() -> Self {
        Self {
            ryw_disabled: false,
            read_ahead_disabled: false,
            read_system_keys: false,
            access_system_keys: false,
            next_write_no_conflict: false,
            snapshot_ryw: 1,
            debug_retry_logging: false,
            transaction_name: None,
            timeout: None,
            retry_limit: None,
            used_during_commit_protection_disabled: false,
        }
    }
}

impl OptionState {
    /// Folds one option into the flags.
    pub fn apply(&mut self, option: &TransactionOption) {
        match option {
            TransactionOption::ReadYourWritesDisable => self.ryw_disabled = true,
            TransactionOption::ReadAheadDisable => self.read_ahead_disabled = true,
            TransactionOption::ReadSystemKeys => self.read_system_keys = true,
            TransactionOption::AccessSystemKeys => self.access_system_keys = true,
            TransactionOption::NextWriteNoWriteConflictRange => {
                self.next_write_no_conflict = true;
            }
            TransactionOption::SnapshotRywEnable => self.snapshot_ryw += 1,
            TransactionOption::SnapshotRywDisable => self.snapshot_ryw -= 1,
            TransactionOption::DebugRetryLogging(name) => {
                self.debug_retry_logging = true;
                if name.is_some() {
                    self.transaction_name = name.clone();
                }
            }
            TransactionOption::Timeout(d) => self.timeout = Some(*d),
            TransactionOption::RetryLimit(n) => self.retry_limit = Some(*n),
            TransactionOption::UsedDuringCommitProtectionDisable => {
                self.used_during_commit_protection_disabled = true;
            }
        }
    }

    /// True when snapshot reads should observe local writes.
    pub fn snapshot_ryw_enabled(&self) -> bool {
        self.snapshot_ryw > 0
    }

    /// Consumes the one-shot write-conflict exemption.
    pub fn take_next_write_exemption(&mut self) -> bool {
        std::mem::take(&mut self.next_write_no_conflict)
    }
}
