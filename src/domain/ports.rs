//! Domain Ports - Core trait definitions for the control plane
//!
//! These traits define the boundaries between the domain logic and external systems.
//! Adapters implement these traits to provide concrete functionality.

use crate::domain::model::Provider;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Key-Value Store Port
// =============================================================================

/// A single stored key and its raw value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One operation inside an atomic transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Write a single key
    Set { key: String, value: Vec<u8> },
    /// Delete a single key
    Delete { key: String },
    /// Delete every key starting with `prefix`
    DeleteTree { prefix: String },
}

impl TxnOp {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        TxnOp::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    pub fn delete_tree(prefix: impl Into<String>) -> Self {
        TxnOp::DeleteTree {
            prefix: prefix.into(),
        }
    }
}

/// Port for the hierarchical transactional key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// All pairs whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// Keys under `prefix`, rolled up at the first `separator` after the prefix
    async fn keys(&self, prefix: &str, separator: char) -> Result<Vec<String>>;

    /// Apply `ops` in order, all or nothing
    async fn transact(&self, ops: Vec<TxnOp>) -> Result<()>;

    /// Largest number of operations a single transaction may carry
    fn max_txn_ops(&self) -> usize {
        64
    }

    /// Check if the store is reachable
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Secret Store Port
// =============================================================================

/// Request for a scoped secret-store token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub policies: Vec<String>,
    pub ttl: Duration,
    /// Number of uses before the token is revoked (0 = unlimited)
    pub num_uses: u32,
    pub metadata: BTreeMap<String, String>,
}

/// A token issued by the secret store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub num_uses: u32,
}

/// Port for the secret store holding bootstrap material
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn write(&self, path: &str, data: &BTreeMap<String, String>) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn mint_token(&self, request: &TokenRequest) -> Result<IssuedToken>;
}

// =============================================================================
// Access Control Port
// =============================================================================

/// Port for per-instance access-control entries on the key-value store
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Create the entry for an instance and return its secret
    async fn issue(&self, instance_id: &str) -> Result<String>;

    /// Remove the entry for an instance; a missing entry is not an error
    async fn revoke(&self, instance_id: &str) -> Result<()>;
}

// =============================================================================
// Provider Port
// =============================================================================

/// A network interface reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub address: String,
    pub management: bool,
    pub public: bool,
}

/// Device state as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub id: String,
    pub status: String,
    pub interfaces: Vec<NetworkInterface>,
}

impl DeviceStatus {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Parameters for provisioning a device
#[derive(Clone, PartialEq)]
pub struct ProvisionSpec {
    pub instance_id: String,
    /// Provider account the device is created under
    pub owner: String,
    pub hostname: String,
    pub region: String,
    pub plan: String,
    pub operating_system: String,
    pub credential: String,
    /// Handed to the device at first boot
    pub custom_data: Value,
}

impl std::fmt::Debug for ProvisionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionSpec")
            .field("instance_id", &self.instance_id)
            .field("owner", &self.owner)
            .field("hostname", &self.hostname)
            .field("region", &self.region)
            .field("plan", &self.plan)
            .field("operating_system", &self.operating_system)
            .finish_non_exhaustive()
    }
}

/// Port for compute provider capabilities
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider variant this adapter serves
    fn provider(&self) -> Provider;

    /// Resolve the account a credential belongs to
    async fn identity_of(&self, credential: &str) -> Result<String>;

    /// Read a device through the caller's credential
    async fn device_status(&self, device: &str, credential: &str) -> Result<DeviceStatus>;

    /// Create a device and return its handle
    async fn provision(&self, spec: &ProvisionSpec) -> Result<String>;

    /// Delete a device
    async fn deprovision(&self, device: &str, credential: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type KvStoreRef = Arc<dyn KvStore>;
pub type SecretStoreRef = Arc<dyn SecretStore>;
pub type AccessControlRef = Arc<dyn AccessControl>;
pub type ProviderAdapterRef = Arc<dyn ProviderAdapter>;

impl std::fmt::Debug for dyn ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("provider", &self.provider())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_active() {
        let mut status = DeviceStatus {
            id: "d-1".into(),
            status: "provisioning".into(),
            interfaces: vec![],
        };
        assert!(!status.is_active());
        status.status = "active".into();
        assert!(status.is_active());
    }

    #[test]
    fn test_provision_spec_debug_hides_credential() {
        let spec = ProvisionSpec {
            instance_id: "i-1".into(),
            owner: "proj".into(),
            hostname: "fleet-i".into(),
            region: "ewr1".into(),
            plan: "baremetal_0".into(),
            operating_system: "ubuntu_16_04".into(),
            credential: "api-key-123".into(),
            custom_data: Value::Null,
        };
        assert!(!format!("{:?}", spec).contains("api-key-123"));
    }
}
