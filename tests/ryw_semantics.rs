//! Read-your-writes merge behaviour for point operations.
//!
//! These tests verify the priority order of the merged view: the write
//! buffer wins over the cache and the remote snapshot, clears suppress
//! earlier writes and remote values, and deferred atomic operations
//! resolve against the remote base exactly once.

use bytes::Bytes;
use ryw::remote::memory::{Cluster, MemoryRemote};
use ryw::{AtomicOp, Transaction, TransactionOption};

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn tx(cluster: &Cluster) -> Transaction<MemoryRemote> {
    Transaction::new(cluster.create_transaction())
}

#[tokio::test]
async fn get_sees_own_set_before_commit() {
    let cluster = Cluster::new();
    let mut t = tx(&cluster);
    t.set(b"a", b"1").unwrap();
    assert_eq!(t.get(b"a", false).await.unwrap(), Some(b("1")));
    // Nothing durable yet.
    assert_eq!(cluster.get(b"a"), None);
}

#[tokio::test]
async fn last_set_wins() {
    let cluster = Cluster::new();
    let mut t = tx(&cluster);
    t.set(b"x", b"1").unwrap();
    t.set(b"x", b"2").unwrap();
    assert_eq!(t.get(b"x", false).await.unwrap(), Some(b("2")));
}

#[tokio::test]
async fn clear_range_supersedes_earlier_set() {
    let cluster = Cluster::new();
    let mut t = tx(&cluster);
    t.set(b"a", b"1").unwrap();
    t.clear_range(b"a", b"c").unwrap();
    assert_eq!(t.get(b"a", false).await.unwrap(), None);
}

#[tokio::test]
async fn clear_hides_remote_value() {
    let cluster = Cluster::new();
    cluster.insert(b("k"), b("remote"));
    let mut t = tx(&cluster);
    assert_eq!(t.get(b"k", false).await.unwrap(), Some(b("remote")));
    t.clear(b"k").unwrap();
    assert_eq!(t.get(b"k", false).await.unwrap(), None);
}

#[tokio::test]
async fn set_over_remote_value_wins_without_fetch() {
    let cluster = Cluster::new();
    cluster.insert(b("k"), b("remote"));
    let mut remote = cluster.create_transaction();
    // Any remote fetch would fail; the read must come from the buffer.
    remote.fail_next_fetches(10);
    let mut t = Transaction::new(remote);
    t.set(b"k", b"local").unwrap();
    assert_eq!(t.get(b"k", false).await.unwrap(), Some(b("local")));
}

#[tokio::test]
async fn repeated_get_is_served_from_the_cache() {
    let cluster = Cluster::new();
    cluster.insert(b("k"), b("v"));
    let remote = cluster.create_transaction();
    let stats = remote.stats();
    let mut t = Transaction::new(remote);
    assert_eq!(t.get(b"k", false).await.unwrap(), Some(b("v")));
    assert_eq!(stats.fetches(), 1);
    assert_eq!(t.get(b"k", false).await.unwrap(), Some(b("v")));
    // The second read resolved from the snapshot cache.
    assert_eq!(stats.fetches(), 1);
}

#[tokio::test]
async fn deferred_atomic_resolves_against_remote_base() {
    let cluster = Cluster::new();
    cluster.insert(b("n"), Bytes::from_static(b"\x05"));
    let mut t = tx(&cluster);
    t.atomic_op(b"n", b"\x03", AtomicOp::Add).unwrap();
    assert_eq!(
        t.get(b"n", false).await.unwrap(),
        Some(Bytes::from_static(b"\x08"))
    );
    t.commit().await.unwrap();
    assert_eq!(cluster.get(b"n"), Some(Bytes::from_static(b"\x08")));
}

#[tokio::test]
async fn unread_atomic_ships_to_the_store_at_commit() {
    let cluster = Cluster::new();
    cluster.insert(b("n"), Bytes::from_static(b"\x05"));
    let mut t = tx(&cluster);
    t.atomic_op(b"n", b"\x03", AtomicOp::Add).unwrap();
    t.commit().await.unwrap();
    assert_eq!(cluster.get(b"n"), Some(Bytes::from_static(b"\x08")));
}

#[tokio::test]
async fn stacked_atomics_compose_in_issue_order() {
    let cluster = Cluster::new();
    let mut t = tx(&cluster);
    t.atomic_op(b"n", b"\x02", AtomicOp::Add).unwrap();
    t.atomic_op(b"n", b"\x03", AtomicOp::Add).unwrap();
    // Absent base behaves as zero.
    assert_eq!(
        t.get(b"n", false).await.unwrap(),
        Some(Bytes::from_static(b"\x05"))
    );
}

#[tokio::test]
async fn atomic_after_set_applies_eagerly() {
    let cluster = Cluster::new();
    let mut t = tx(&cluster);
    t.set(b"n", b"\x0a").unwrap();
    t.atomic_op(b"n", b"\x05", AtomicOp::Add).unwrap();
    assert_eq!(
        t.get(b"n", false).await.unwrap(),
        Some(Bytes::from_static(b"\x0f"))
    );
    t.commit().await.unwrap();
    assert_eq!(cluster.get(b"n"), Some(Bytes::from_static(b"\x0f")));
}

#[tokio::test]
async fn atomic_after_clear_uses_cleared_identity() {
    let cluster = Cluster::new();
    cluster.insert(b("n"), Bytes::from_static(b"\x63"));
    let mut t = tx(&cluster);
    t.clear(b"n").unwrap();
    t.atomic_op(b"n", b"\x01", AtomicOp::Add).unwrap();
    assert_eq!(
        t.get(b"n", false).await.unwrap(),
        Some(Bytes::from_static(b"\x01"))
    );
}

#[tokio::test]
async fn compare_and_clear_removes_matching_value() {
    let cluster = Cluster::new();
    cluster.insert(b("k"), b("v"));
    let mut t = tx(&cluster);
    t.atomic_op(b"k", b"v", AtomicOp::CompareAndClear).unwrap();
    assert_eq!(t.get(b"k", false).await.unwrap(), None);
    t.commit().await.unwrap();
    assert_eq!(cluster.get(b"k"), None);
}

#[tokio::test]
async fn ryw_disabled_reads_skip_local_writes() {
    let cluster = Cluster::new();
    cluster.insert(b("k"), b("remote"));
    let mut t = tx(&cluster);
    t.set_option(TransactionOption::ReadYourWritesDisable)
        .unwrap();
    t.set(b"k", b"local").unwrap();
    assert_eq!(t.get(b"k", false).await.unwrap(), Some(b("remote")));
    // The write still commits.
    t.commit().await.unwrap();
    assert_eq!(cluster.get(b"k"), Some(b("local")));
}

#[tokio::test]
async fn snapshot_reads_can_bypass_local_writes() {
    let cluster = Cluster::new();
    cluster.insert(b("k"), b("remote"));
    let mut t = tx(&cluster);
    t.set_option(TransactionOption::SnapshotRywDisable).unwrap();
    t.set(b"k", b"local").unwrap();
    // Snapshot read bypasses the buffer, plain read does not.
    assert_eq!(t.get(b"k", true).await.unwrap(), Some(b("remote")));
    assert_eq!(t.get(b"k", false).await.unwrap(), Some(b("local")));
}

#[tokio::test]
async fn reset_restores_a_fresh_view() {
    let cluster = Cluster::new();
    cluster.insert(b("k"), b("remote"));
    let mut t = tx(&cluster);
    t.set(b"k", b"local").unwrap();
    t.set(b"only-local", b"x").unwrap();
    t.reset();
    assert_eq!(t.get(b"k", false).await.unwrap(), Some(b("remote")));
    assert_eq!(t.get(b"only-local", false).await.unwrap(), None);
    assert_eq!(t.retries(), 0);
}

#[tokio::test]
async fn failed_read_leaves_state_retryable() {
    let cluster = Cluster::new();
    cluster.insert(b("k"), b("v"));
    let mut remote = cluster.create_transaction();
    remote.fail_next_fetches(1);
    let mut t = Transaction::new(remote);
    t.set(b"other", b"1").unwrap();
    assert!(t.get(b"k", false).await.is_err());
    // The same call succeeds afterwards and earlier writes are intact.
    assert_eq!(t.get(b"k", false).await.unwrap(), Some(b("v")));
    assert_eq!(t.get(b"other", false).await.unwrap(), Some(b("1")));
}
