//! Service subtree operations shared by instances and applications

use crate::domain::model::{validate_service_type, Service};
use crate::error::{Error, Result};
use crate::store::{Collection, EntityRecord, EntityStore};
use serde_json::Value;
use tracing::info;

async fn require(store: &EntityStore, collection: Collection, id: &str) -> Result<EntityRecord> {
    store
        .load(collection, id)
        .await?
        .ok_or_else(|| Error::not_found(collection.kind(), id))
}

/// Write a new service; fails if the type is already present
pub(crate) async fn add(
    store: &EntityStore,
    collection: Collection,
    id: &str,
    service_type: &str,
    config: &Value,
) -> Result<()> {
    validate_service_type(service_type)?;
    let record = require(store, collection, id).await?;
    if record.has_service(service_type) {
        return Err(Error::already_exists("service", service_type));
    }

    let ops = EntityStore::replace_service_ops(collection, id, service_type, config)?;
    store.commit(ops).await?;
    info!("Added service {} to {} {}", service_type, collection.kind(), id);
    Ok(())
}

pub(crate) async fn get(
    store: &EntityStore,
    collection: Collection,
    id: &str,
    service_type: &str,
) -> Result<Service> {
    validate_service_type(service_type)?;
    require(store, collection, id).await?;
    store
        .load_service(collection, id, service_type)
        .await?
        .ok_or_else(|| Error::not_found("service", service_type))
}

/// Replace an existing service's config and return what was stored
pub(crate) async fn configure(
    store: &EntityStore,
    collection: Collection,
    id: &str,
    service_type: &str,
    config: &Value,
) -> Result<Service> {
    validate_service_type(service_type)?;
    let record = require(store, collection, id).await?;
    if !record.has_service(service_type) {
        return Err(Error::not_found("service", service_type));
    }

    let ops = EntityStore::replace_service_ops(collection, id, service_type, config)?;
    store.commit(ops).await?;
    info!("Configured service {} on {} {}", service_type, collection.kind(), id);

    store
        .load_service(collection, id, service_type)
        .await?
        .ok_or_else(|| Error::Internal(format!("service {} vanished after write", service_type)))
}

pub(crate) async fn remove(
    store: &EntityStore,
    collection: Collection,
    id: &str,
    service_type: &str,
) -> Result<()> {
    validate_service_type(service_type)?;
    let record = require(store, collection, id).await?;
    if !record.has_service(service_type) {
        return Err(Error::not_found("service", service_type));
    }

    store
        .commit(EntityStore::remove_service_ops(collection, id, service_type))
        .await?;
    info!("Removed service {} from {} {}", service_type, collection.kind(), id);
    Ok(())
}
