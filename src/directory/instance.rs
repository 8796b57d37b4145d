//! Instance Manager
//!
//! Instance records live under `instances/<id>/`:
//! - `provider`, `owner`, `device` scalars
//! - `services/<type>/…` config documents
//!
//! The access-control entry and the bootstrap secret belong to the instance
//! but live outside the store; destroy removes them best-effort.

use super::locks::ResourceLocks;
use super::{services, CleanupFailure, DestroyReport};
use crate::domain::model::{Instance, InstanceField, Provider, Service};
use crate::domain::ports::{AccessControlRef, SecretStoreRef, TxnOp};
use crate::error::{Error, Result};
use crate::secrets::bootstrap_secret_path;
use crate::store::{validate_id, Collection, EntityRecord, EntityStore};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const COLLECTION: Collection = Collection::Instances;

/// Key under which the access-control secret is stored for the device
pub const BOOTSTRAP_TOKEN_KEY: &str = "consul_token";

impl TryFrom<EntityRecord> for Instance {
    type Error = Error;

    fn try_from(record: EntityRecord) -> Result<Self> {
        Ok(Instance {
            provider: record.provider()?,
            owner: record.required(InstanceField::Owner.as_str())?,
            device: record.required(InstanceField::Device.as_str())?,
            id: record.id,
            services: record.services,
        })
    }
}

/// Domain rules for instance records
pub struct InstanceManager {
    store: EntityStore,
    locks: Arc<ResourceLocks>,
    acl: AccessControlRef,
    secrets: SecretStoreRef,
}

impl InstanceManager {
    pub fn new(
        store: EntityStore,
        locks: Arc<ResourceLocks>,
        acl: AccessControlRef,
        secrets: SecretStoreRef,
    ) -> Self {
        Self {
            store,
            locks,
            acl,
            secrets,
        }
    }

    fn lock_key(id: &str) -> String {
        COLLECTION.entity_prefix(id)
    }

    /// Create a record with an empty device and return it as stored
    pub async fn create_instance(&self, owner: &str, provider: Provider) -> Result<Instance> {
        if owner.is_empty() {
            return Err(Error::InvalidArgument("instance owner is required".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let _guard = self.locks.acquire(&Self::lock_key(&id)).await;

        self.store
            .commit(vec![
                TxnOp::set(COLLECTION.field_key(&id, "provider"), provider.as_str()),
                TxnOp::set(COLLECTION.field_key(&id, InstanceField::Owner.as_str()), owner),
                TxnOp::set(COLLECTION.field_key(&id, InstanceField::Device.as_str()), ""),
            ])
            .await?;

        info!("Created instance {} for owner {} on {}", id, owner, provider);
        self.get_instance(&id).await
    }

    pub async fn find_instance(&self, id: &str) -> Result<Option<Instance>> {
        validate_id(COLLECTION.kind(), id)?;
        self.store
            .load(COLLECTION, id)
            .await?
            .map(Instance::try_from)
            .transpose()
    }

    pub async fn get_instance(&self, id: &str) -> Result<Instance> {
        self.find_instance(id)
            .await?
            .ok_or_else(|| Error::not_found(COLLECTION.kind(), id))
    }

    /// IDs of every stored instance
    pub async fn instance_ids(&self) -> Result<Vec<String>> {
        self.store.ids(COLLECTION).await
    }

    /// Patch scalar fields in one transaction
    pub async fn set_fields(&self, id: &str, fields: &BTreeMap<String, String>) -> Result<Instance> {
        let parsed = fields
            .iter()
            .map(|(name, value)| -> Result<(InstanceField, &String)> {
                Ok((name.parse()?, value))
            })
            .collect::<Result<Vec<_>>>()?;

        let _guard = self.locks.acquire(&Self::lock_key(id)).await;
        self.get_instance(id).await?;

        let ops = parsed
            .into_iter()
            .map(|(field, value)| TxnOp::set(COLLECTION.field_key(id, field.as_str()), value.as_str()))
            .collect();
        self.store.commit(ops).await?;

        self.get_instance(id).await
    }

    /// Issue the instance's access-control entry and park its secret where
    /// the bootstrapping device can fetch it
    pub async fn issue_bootstrap_secret(&self, id: &str) -> Result<()> {
        let token = self.acl.issue(id).await?;
        let data = BTreeMap::from([(BOOTSTRAP_TOKEN_KEY.to_string(), token)]);
        self.secrets.write(&bootstrap_secret_path(id), &data).await
    }

    pub async fn add_service(&self, id: &str, service_type: &str, config: &Value) -> Result<Instance> {
        let _guard = self.locks.acquire(&Self::lock_key(id)).await;
        services::add(&self.store, COLLECTION, id, service_type, config).await?;
        self.get_instance(id).await
    }

    pub async fn get_service(&self, id: &str, service_type: &str) -> Result<Service> {
        validate_id(COLLECTION.kind(), id)?;
        services::get(&self.store, COLLECTION, id, service_type).await
    }

    pub async fn configure_service(
        &self,
        id: &str,
        service_type: &str,
        config: &Value,
    ) -> Result<Service> {
        let _guard = self.locks.acquire(&Self::lock_key(id)).await;
        services::configure(&self.store, COLLECTION, id, service_type, config).await
    }

    pub async fn remove_service(&self, id: &str, service_type: &str) -> Result<Instance> {
        let _guard = self.locks.acquire(&Self::lock_key(id)).await;
        services::remove(&self.store, COLLECTION, id, service_type).await?;
        self.get_instance(id).await
    }

    /// Delete the record, then revoke its access-control entry and delete
    /// its bootstrap secret. The record stays deleted whatever the cleanup
    /// outcome; failures are reported back.
    pub async fn destroy_instance(&self, id: &str) -> Result<DestroyReport> {
        let _guard = self.locks.acquire(&Self::lock_key(id)).await;
        self.get_instance(id).await?;

        self.store
            .commit(vec![TxnOp::delete_tree(COLLECTION.entity_prefix(id))])
            .await?;
        info!("Destroyed instance {}", id);

        let mut report = DestroyReport::new(id);

        if let Err(e) = self.acl.revoke(id).await {
            warn!("Instance {}: access-control revoke failed: {}", id, e);
            report.cleanup_failures.push(CleanupFailure::new("revoke_access", &e));
        }

        if let Err(e) = self.secrets.delete(&bootstrap_secret_path(id)).await {
            warn!("Instance {}: bootstrap secret delete failed: {}", id, e);
            report
                .cleanup_failures
                .push(CleanupFailure::new("delete_bootstrap_secret", &e));
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::KvStore;
    use crate::secrets::MemorySecretStore;
    use crate::store::{MemoryAccessControl, MemoryKvStore};
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Fixture {
        kv: Arc<MemoryKvStore>,
        acl: Arc<MemoryAccessControl>,
        secrets: Arc<MemorySecretStore>,
        manager: InstanceManager,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(MemoryKvStore::new());
        let acl = Arc::new(MemoryAccessControl::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let manager = InstanceManager::new(
            EntityStore::new(kv.clone()),
            Arc::new(ResourceLocks::new()),
            acl.clone(),
            secrets.clone(),
        );
        Fixture {
            kv,
            acl,
            secrets,
            manager,
        }
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let f = fixture();
        let created = f.manager.create_instance("proj-1", Provider::Packet).await.unwrap();

        assert_eq!(created.owner, "proj-1");
        assert_eq!(created.device, "");
        assert!(created.services.is_empty());
        assert_eq!(f.manager.get_instance(&created.id).await.unwrap(), created);
        assert_eq!(f.kv.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let f = fixture();
        let a = f.manager.create_instance("o", Provider::Packet).await.unwrap();
        let b = f.manager.create_instance("o", Provider::Packet).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(f.manager.instance_ids().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let f = fixture();
        assert_matches!(
            f.manager.get_instance("nope").await,
            Err(Error::NotFound { .. })
        );
        assert!(f.manager.instance_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stored_provider_must_decode() {
        let f = fixture();
        f.kv.transact(vec![
            TxnOp::set("instances/x/provider", "AWS"),
            TxnOp::set("instances/x/owner", "o"),
            TxnOp::set("instances/x/device", ""),
        ])
        .await
        .unwrap();

        assert_matches!(
            f.manager.get_instance("x").await,
            Err(Error::InternalDecode { .. })
        );
    }

    #[tokio::test]
    async fn test_add_service_twice_keeps_first() {
        let f = fixture();
        let id = f.manager.create_instance("o", Provider::Packet).await.unwrap().id;

        f.manager.add_service(&id, "web", &json!({"port": 80})).await.unwrap();
        assert_matches!(
            f.manager.add_service(&id, "web", &json!({"port": 8080})).await,
            Err(Error::AlreadyExists { .. })
        );

        let web = f.manager.get_service(&id, "web").await.unwrap();
        assert_eq!(web.config, json!({"port": 80}));
    }

    #[tokio::test]
    async fn test_concurrent_add_service_one_wins() {
        let f = fixture();
        let manager = Arc::new(f.manager);
        let id = manager.create_instance("o", Provider::Packet).await.unwrap().id;

        let mut handles = Vec::new();
        for n in 0..4 {
            let manager = manager.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                manager.add_service(&id, "web", &json!({"n": n})).await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_matches!(e, Error::AlreadyExists { .. }),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn test_configure_leaves_no_residue() {
        let f = fixture();
        let id = f.manager.create_instance("o", Provider::Packet).await.unwrap().id;
        f.manager.add_service(&id, "web", &json!({"a": 1})).await.unwrap();

        f.manager
            .configure_service(&id, "web", &json!({"a": 1, "b": 2}))
            .await
            .unwrap();
        let web = f.manager.configure_service(&id, "web", &json!({"a": 1})).await.unwrap();

        assert_eq!(web.config, json!({"a": 1}));
        assert!(f
            .kv
            .keys_with_prefix(&format!("instances/{}/services/web/b", id))
            .is_empty());
    }

    #[tokio::test]
    async fn test_configure_and_remove_missing_service() {
        let f = fixture();
        let id = f.manager.create_instance("o", Provider::Packet).await.unwrap().id;

        assert_matches!(
            f.manager.configure_service(&id, "web", &json!({})).await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(
            f.manager.remove_service(&id, "web").await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(
            f.manager.get_service(&id, "web").await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_remove_service_returns_parent() {
        let f = fixture();
        let id = f.manager.create_instance("o", Provider::Packet).await.unwrap().id;
        f.manager.add_service(&id, "web", &json!({"a": [1, 2]})).await.unwrap();
        f.manager.add_service(&id, "db", &json!({})).await.unwrap();

        let instance = f.manager.remove_service(&id, "web").await.unwrap();
        assert!(instance.service("web").is_none());
        assert!(instance.service("db").is_some());
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_old_config() {
        let f = fixture();
        let id = f.manager.create_instance("o", Provider::Packet).await.unwrap().id;
        f.manager.add_service(&id, "web", &json!({"a": 1})).await.unwrap();

        f.kv.reject_next_transaction();
        assert_matches!(
            f.manager.configure_service(&id, "web", &json!({"z": 9})).await,
            Err(Error::TransactionFailed(_))
        );
        assert_eq!(
            f.manager.get_service(&id, "web").await.unwrap().config,
            json!({"a": 1})
        );
    }

    #[tokio::test]
    async fn test_set_fields_allow_list() {
        let f = fixture();
        let id = f.manager.create_instance("o", Provider::Packet).await.unwrap().id;

        let fields = BTreeMap::from([("device".to_string(), "dev-1".to_string())]);
        let instance = f.manager.set_fields(&id, &fields).await.unwrap();
        assert_eq!(instance.device, "dev-1");
        assert!(instance.is_provisioned());

        let fields = BTreeMap::from([("provider".to_string(), "AWS".to_string())]);
        assert_matches!(
            f.manager.set_fields(&id, &fields).await,
            Err(Error::InvalidArgument(_))
        );

        let fields = BTreeMap::from([("owner".to_string(), "x".to_string())]);
        assert_matches!(
            f.manager.set_fields("missing", &fields).await,
            Err(Error::NotFound { .. })
        );
        assert!(f.kv.keys_with_prefix("instances/missing/").is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_subtree_and_side_effects() {
        let f = fixture();
        let id = f.manager.create_instance("o", Provider::Packet).await.unwrap().id;
        f.manager.add_service(&id, "web", &json!({"a": 1})).await.unwrap();
        f.manager.issue_bootstrap_secret(&id).await.unwrap();
        assert!(f.acl.has_entry(&id));
        assert!(f.secrets.read(&bootstrap_secret_path(&id)).is_some());

        let report = f.manager.destroy_instance(&id).await.unwrap();
        assert!(report.is_clean());
        assert!(f.kv.keys_with_prefix(&format!("instances/{}", id)).is_empty());
        assert!(!f.acl.has_entry(&id));
        assert!(f.secrets.read(&bootstrap_secret_path(&id)).is_none());

        assert_matches!(
            f.manager.destroy_instance(&id).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_destroy_reports_cleanup_failures() {
        let f = fixture();
        let id = f.manager.create_instance("o", Provider::Packet).await.unwrap().id;
        f.manager.issue_bootstrap_secret(&id).await.unwrap();
        f.acl.set_fail_revoke(true);
        f.secrets.set_fail_delete(true);

        let report = f.manager.destroy_instance(&id).await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.cleanup_failures.len(), 2);
        assert_eq!(report.cleanup_failures[0].step, "revoke_access");
        assert!(f.kv.keys_with_prefix(&format!("instances/{}", id)).is_empty());
    }
}
