//! In-Memory Key-Value Store
//!
//! Ordered map behind a single lock, so every transaction is trivially
//! atomic. Used in standalone mode and by tests, which can also make the
//! store unavailable or reject the next transaction.

use crate::domain::ports::{AccessControl, KvPair, KvStore, TxnOp};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Default transaction size, matching Consul
const DEFAULT_MAX_TXN_OPS: usize = 64;

// =============================================================================
// Memory KV Store
// =============================================================================

/// In-memory transactional key-value store
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Committed transactions
    transactions: AtomicU64,
    unavailable: AtomicBool,
    reject_next: AtomicBool,
    max_txn_ops: usize,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_max_txn_ops(DEFAULT_MAX_TXN_OPS)
    }

    pub fn with_max_txn_ops(max_txn_ops: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            transactions: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            reject_next: AtomicBool::new(false),
            max_txn_ops,
        }
    }

    /// Number of committed transactions
    pub fn transaction_count(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    /// All stored pairs in key order
    pub fn snapshot(&self) -> Vec<KvPair> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| KvPair::new(k.clone(), v.clone()))
            .collect()
    }

    /// Keys starting with `prefix`
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Simulate an unreachable store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Make the next transaction fail as rolled back
    pub fn reject_next_transaction(&self) {
        self.reject_next.store(true, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::StoreUnavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        self.check_available()?;
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KvPair::new(k.clone(), v.clone()))
            .collect())
    }

    async fn keys(&self, prefix: &str, separator: char) -> Result<Vec<String>> {
        self.check_available()?;
        let entries = self.entries.read();
        let mut keys = BTreeSet::new();

        for (key, _) in entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            let rest = &key[prefix.len()..];
            match rest.find(separator) {
                Some(pos) => keys.insert(format!("{}{}", prefix, &rest[..=pos])),
                None => keys.insert(key.clone()),
            };
        }

        Ok(keys.into_iter().collect())
    }

    async fn transact(&self, ops: Vec<TxnOp>) -> Result<()> {
        self.check_available()?;
        if ops.len() > self.max_txn_ops {
            return Err(Error::TransactionFailed(format!(
                "{} operations exceed limit of {}",
                ops.len(),
                self.max_txn_ops
            )));
        }
        if self.reject_next.swap(false, Ordering::Relaxed) {
            return Err(Error::TransactionFailed("transaction rolled back".into()));
        }

        let mut entries = self.entries.write();
        for op in ops {
            match op {
                TxnOp::Set { key, value } => {
                    entries.insert(key, value);
                }
                TxnOp::Delete { key } => {
                    entries.remove(&key);
                }
                TxnOp::DeleteTree { prefix } => {
                    let doomed: Vec<String> = entries
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        entries.remove(&key);
                    }
                }
            }
        }

        self.transactions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn max_txn_ops(&self) -> usize {
        self.max_txn_ops
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.unavailable.load(Ordering::Relaxed))
    }
}

// =============================================================================
// Memory Access Control
// =============================================================================

/// In-memory per-instance access-control entries
#[derive(Default)]
pub struct MemoryAccessControl {
    entries: DashMap<String, String>,
    fail_revoke: AtomicBool,
}

impl MemoryAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_entry(&self, instance_id: &str) -> bool {
        self.entries.contains_key(instance_id)
    }

    /// Make every revoke fail until reset
    pub fn set_fail_revoke(&self, fail: bool) {
        self.fail_revoke.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl AccessControl for MemoryAccessControl {
    async fn issue(&self, instance_id: &str) -> Result<String> {
        let secret = uuid::Uuid::new_v4().to_string();
        self.entries.insert(instance_id.to_string(), secret.clone());
        debug!("Issued access-control entry for instance {}", instance_id);
        Ok(secret)
    }

    async fn revoke(&self, instance_id: &str) -> Result<()> {
        if self.fail_revoke.load(Ordering::Relaxed) {
            return Err(Error::AccessControl(format!(
                "revoke refused for instance {}",
                instance_id
            )));
        }
        self.entries.remove(instance_id);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_list_and_delete_tree() {
        let store = MemoryKvStore::new();
        store
            .transact(vec![
                TxnOp::set("instances/a/owner", "o"),
                TxnOp::set("instances/a/services/web/port", "80"),
                TxnOp::set("instances/b/owner", "o"),
            ])
            .await
            .unwrap();

        assert_eq!(store.list("instances/a/").await.unwrap().len(), 2);

        store
            .transact(vec![TxnOp::delete_tree("instances/a/")])
            .await
            .unwrap();

        assert!(store.list("instances/a/").await.unwrap().is_empty());
        assert_eq!(store.list("instances/").await.unwrap().len(), 1);
        assert_eq!(store.transaction_count(), 2);
    }

    #[tokio::test]
    async fn test_keys_roll_up_at_separator() {
        let store = MemoryKvStore::new();
        store
            .transact(vec![
                TxnOp::set("instances/a/owner", "o"),
                TxnOp::set("instances/a/device", ""),
                TxnOp::set("instances/b/owner", "o"),
                TxnOp::set("instances/loose", "x"),
            ])
            .await
            .unwrap();

        let keys = store.keys("instances/", '/').await.unwrap();
        assert_eq!(keys, vec!["instances/a/", "instances/b/", "instances/loose"]);
    }

    #[tokio::test]
    async fn test_rejected_transaction_writes_nothing() {
        let store = MemoryKvStore::new();
        store.reject_next_transaction();

        let result = store
            .transact(vec![TxnOp::set("k/1", "v"), TxnOp::set("k/2", "v")])
            .await;

        assert_matches!(result, Err(Error::TransactionFailed(_)));
        assert!(store.snapshot().is_empty());
        assert_eq!(store.transaction_count(), 0);

        // Only the next one is rejected
        store.transact(vec![TxnOp::set("k/1", "v")]).await.unwrap();
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryKvStore::new();
        store.set_unavailable(true);
        assert_matches!(store.list("x/").await, Err(Error::StoreUnavailable(_)));
        assert!(!store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_access_control_issue_revoke() {
        let acl = MemoryAccessControl::new();
        let secret = acl.issue("i-1").await.unwrap();
        assert!(!secret.is_empty());
        assert!(acl.has_entry("i-1"));

        acl.set_fail_revoke(true);
        assert!(acl.revoke("i-1").await.is_err());
        assert!(acl.has_entry("i-1"));

        acl.set_fail_revoke(false);
        acl.revoke("i-1").await.unwrap();
        assert!(!acl.has_entry("i-1"));
        // Revoking again is fine
        acl.revoke("i-1").await.unwrap();
    }
}
