//! Read-your-writes transaction overlay for distributed versioned
//! key-value stores.
//!
//! Within one logical transaction, a read observes the transaction's own
//! uncommitted writes before they are durable, while the overlay keeps the
//! exact read- and write-conflict ranges the store needs for optimistic
//! conflict detection at commit. The distributed store itself stays behind
//! the narrow [`remote::RemoteTransaction`] trait; an in-memory
//! implementation ([`remote::memory::Cluster`]) backs the test suite.
//!
//! ```
//! use ryw::remote::memory::Cluster;
//! use ryw::Transaction;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ryw::Result<()> {
//! let cluster = Cluster::new();
//! let mut tx = Transaction::new(cluster.create_transaction());
//! tx.set(b"greeting", b"hello")?;
//! // The uncommitted write is already visible to this transaction.
//! assert_eq!(tx.get(b"greeting", false).await?.as_deref(), Some(&b"hello"[..]));
//! tx.commit().await?;
//! assert_eq!(cluster.get(b"greeting").as_deref(), Some(&b"hello"[..]));
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod atomic;
pub mod conflict;
pub mod error;
pub mod logging;
pub mod options;
pub mod remote;
pub mod snapshot_cache;
pub mod transaction;
pub mod types;
pub mod watch;
pub mod write_map;

pub use atomic::AtomicOp;
pub use error::{Result, TxError, UsageError};
pub use options::TransactionOption;
pub use transaction::{Transaction, TxState};
pub use types::{Key, KeyRange, KeySelector, KeyValue, RangeResult, Value, Version};
pub use watch::Watch;
