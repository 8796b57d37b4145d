//! Application Manager
//!
//! Applications group instances by pointer only:
//! `applications/<id>/instances/<instance id>` holds an empty value and the
//! instance record itself stays under `instances/`.

use super::locks::ResourceLocks;
use super::services;
use crate::domain::model::{Application, Provider, Service};
use crate::domain::ports::TxnOp;
use crate::error::{Error, Result};
use crate::store::{member_key, validate_id, Collection, EntityRecord, EntityStore};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

const COLLECTION: Collection = Collection::Applications;

impl TryFrom<EntityRecord> for Application {
    type Error = Error;

    fn try_from(record: EntityRecord) -> Result<Self> {
        Ok(Application {
            provider: record.provider()?,
            owner: record.required("owner")?,
            app_type: record.required("type")?,
            id: record.id,
            services: record.services,
            instances: record.members,
        })
    }
}

/// Domain rules for application records
pub struct ApplicationManager {
    store: EntityStore,
    locks: Arc<ResourceLocks>,
}

impl ApplicationManager {
    pub fn new(store: EntityStore, locks: Arc<ResourceLocks>) -> Self {
        Self { store, locks }
    }

    fn lock_key(id: &str) -> String {
        COLLECTION.entity_prefix(id)
    }

    pub async fn create_application(
        &self,
        owner: &str,
        provider: Provider,
        app_type: &str,
    ) -> Result<Application> {
        if owner.is_empty() {
            return Err(Error::InvalidArgument("application owner is required".into()));
        }
        if app_type.is_empty() {
            return Err(Error::InvalidArgument("application type is required".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let _guard = self.locks.acquire(&Self::lock_key(&id)).await;

        self.store
            .commit(vec![
                TxnOp::set(COLLECTION.field_key(&id, "provider"), provider.as_str()),
                TxnOp::set(COLLECTION.field_key(&id, "owner"), owner),
                TxnOp::set(COLLECTION.field_key(&id, "type"), app_type),
            ])
            .await?;

        info!("Created application {} ({}) for owner {}", id, app_type, owner);
        self.get_application(&id).await
    }

    pub async fn get_application(&self, id: &str) -> Result<Application> {
        validate_id(COLLECTION.kind(), id)?;
        self.store
            .load(COLLECTION, id)
            .await?
            .ok_or_else(|| Error::not_found(COLLECTION.kind(), id))
            .and_then(Application::try_from)
    }

    /// Delete the application subtree; member instances are untouched
    pub async fn destroy_application(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(&Self::lock_key(id)).await;
        self.get_application(id).await?;
        self.store
            .commit(vec![TxnOp::delete_tree(COLLECTION.entity_prefix(id))])
            .await?;
        info!("Destroyed application {}", id);
        Ok(())
    }

    pub async fn add_service(
        &self,
        id: &str,
        service_type: &str,
        config: &Value,
    ) -> Result<Application> {
        let _guard = self.locks.acquire(&Self::lock_key(id)).await;
        services::add(&self.store, COLLECTION, id, service_type, config).await?;
        self.get_application(id).await
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

    pub async fn remove_service(&self, id: &str, service_type: &str) -> Result<Application> {
        let _guard = self.locks.acquire(&Self::lock_key(id)).await;
        services::remove(&self.store, COLLECTION, id, service_type).await?;
        self.get_application(id).await
    }

    /// Point the application at an existing instance
    pub async fn add_instance(&self, id: &str, instance_id: &str) -> Result<Application> {
        validate_id(Collection::Instances.kind(), instance_id)?;
        let _guard = self.locks.acquire(&Self::lock_key(id)).await;
        self.get_application(id).await?;

        if self.store.load(Collection::Instances, instance_id).await?.is_none() {
            return Err(Error::not_found(Collection::Instances.kind(), instance_id));
        }

        self.store
            .commit(vec![TxnOp::set(member_key(id, instance_id), "")])
            .await?;
        info!("Added instance {} to application {}", instance_id, id);
        self.get_application(id).await
    }

    /// Drop the pointer; the instance itself is untouched
    pub async fn remove_instance(&self, id: &str, instance_id: &str) -> Result<Application> {
        validate_id(Collection::Instances.kind(), instance_id)?;
        let _guard = self.locks.acquire(&Self::lock_key(id)).await;
        let application = self.get_application(id).await?;
        if !application.instances.contains(instance_id) {
            return Err(Error::not_found("application member", instance_id));
        }

        self.store
            .commit(vec![TxnOp::delete(member_key(id, instance_id))])
            .await?;
        info!("Removed instance {} from application {}", instance_id, id);
        self.get_application(id).await
    }
}
