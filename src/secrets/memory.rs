//! In-memory secret store

use crate::domain::ports::{IssuedToken, SecretStore, TokenRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Secret store kept in process memory
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: DashMap<String, BTreeMap<String, String>>,
    minted: Mutex<Vec<TokenRequest>>,
    fail_delete: AtomicBool,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, path: &str) -> Option<BTreeMap<String, String>> {
        self.secrets.get(path).map(|entry| entry.value().clone())
    }

    /// Every token request served so far
    pub fn minted(&self) -> Vec<TokenRequest> {
        self.minted.lock().clone()
    }

    /// Make every delete fail until reset
    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn write(&self, path: &str, data: &BTreeMap<String, String>) -> Result<()> {
        self.secrets.insert(path.to_string(), data.clone());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.fail_delete.load(Ordering::Relaxed) {
            return Err(Error::SecretStore {
                operation: "delete".into(),
                path: path.to_string(),
                reason: "delete refused".into(),
            });
        }
        self.secrets.remove(path);
        Ok(())
    }

    async fn mint_token(&self, request: &TokenRequest) -> Result<IssuedToken> {
        let ttl = chrono::Duration::from_std(request.ttl)
            .map_err(|e| Error::Internal(format!("token ttl out of range: {}", e)))?;
        self.minted.lock().push(request.clone());
        Ok(IssuedToken {
            token: format!("s.{}", uuid::Uuid::new_v4().simple()),
            expires_at: Utc::now() + ttl,
            num_uses: request.num_uses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_read_delete() {
        let store = MemorySecretStore::new();
        let data = BTreeMap::from([("consul_token".to_string(), "abc".to_string())]);
        store.write("secret/bootstrap/i-1", &data).await.unwrap();
        assert_eq!(store.read("secret/bootstrap/i-1"), Some(data));

        store.set_fail_delete(true);
        assert!(store.delete("secret/bootstrap/i-1").await.is_err());
        store.set_fail_delete(false);
        store.delete("secret/bootstrap/i-1").await.unwrap();
        assert!(store.read("secret/bootstrap/i-1").is_none());
    }

    #[tokio::test]
    async fn test_mint_records_request() {
        let store = MemorySecretStore::new();
        let request = TokenRequest {
            policies: vec!["bootstrap".into()],
            ttl: Duration::from_secs(300),
            num_uses: 1,
            metadata: BTreeMap::new(),
        };
        let token = store.mint_token(&request).await.unwrap();
        assert!(token.token.starts_with("s."));
        assert_eq!(token.num_uses, 1);
        assert!(token.expires_at > Utc::now());
        assert_eq!(store.minted(), vec![request]);
    }
}
