//! Entity hydration and transactional writes on top of a [`KvStore`]

use crate::domain::model::{Provider, Service};
use crate::domain::ports::{KvPair, KvStoreRef, TxnOp};
use crate::error::{Error, Result};
use crate::store::codec::{decode_document, encode_document};
use crate::store::Collection;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// =============================================================================
// Entity Record
// =============================================================================

/// Untyped view of one entity subtree
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub collection: Collection,
    pub id: String,
    /// Top-level scalar fields
    pub fields: BTreeMap<String, String>,
    /// Services sorted by type
    pub services: Vec<Service>,
    /// Membership pointers (`instances/<id>` under an application)
    pub members: BTreeSet<String>,
}

impl EntityRecord {
    /// A scalar that must be present; absence is a decode error
    pub fn required(&self, field: &str) -> Result<String> {
        self.fields.get(field).cloned().ok_or_else(|| {
            Error::decode(
                self.collection.field_key(&self.id, field),
                "required field missing",
            )
        })
    }

    pub fn provider(&self) -> Result<Provider> {
        let raw = self.required("provider")?;
        Provider::from_stored(&raw).ok_or_else(|| {
            Error::decode(
                self.collection.field_key(&self.id, "provider"),
                format!("unrecognized provider {:?}", raw),
            )
        })
    }

    pub fn has_service(&self, service_type: &str) -> bool {
        self.services.iter().any(|s| s.service_type == service_type)
    }

    /// Fold the pairs listed under an entity prefix back into a record.
    ///
    /// Returns `None` when there are no keys at all.
    pub fn hydrate(collection: Collection, id: &str, pairs: Vec<KvPair>) -> Result<Option<Self>> {
        if pairs.is_empty() {
            return Ok(None);
        }

        let prefix = collection.entity_prefix(id);
        let mut fields = BTreeMap::new();
        let mut members = BTreeSet::new();
        let mut service_entries: BTreeMap<String, Vec<KvPair>> = BTreeMap::new();

        for pair in pairs {
            if !pair.key.starts_with(&prefix) {
                continue;
            }
            let suffix = pair.key[prefix.len()..].to_string();

            if let Some(rest) = suffix.strip_prefix("services/") {
                let service_type = rest.split('/').next().unwrap_or_default();
                if !service_type.is_empty() {
                    service_entries
                        .entry(service_type.to_string())
                        .or_default()
                        .push(pair);
                }
            } else if let Some(member) = suffix.strip_prefix("instances/") {
                if !member.is_empty() && !member.contains('/') {
                    members.insert(member.to_string());
                }
            } else if !suffix.contains('/') {
                let value = String::from_utf8(pair.value)
                    .map_err(|_| Error::decode(&pair.key, "field is not UTF-8"))?;
                fields.insert(suffix.to_string(), value);
            } else {
                debug!("Ignoring unknown key {}", pair.key);
            }
        }

        let mut services = Vec::with_capacity(service_entries.len());
        for (service_type, entries) in service_entries {
            let base = collection.service_base(id, &service_type);
            let config = decode_document(&base, &entries)?;
            services.push(Service::new(service_type, config));
        }

        Ok(Some(Self {
            collection,
            id: id.to_string(),
            fields,
            services,
            members,
        }))
    }
}

// =============================================================================
// Entity Store
// =============================================================================

/// Typed access to entity subtrees
#[derive(Clone)]
pub struct EntityStore {
    kv: KvStoreRef,
}

impl EntityStore {
    pub fn new(kv: KvStoreRef) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &KvStoreRef {
        &self.kv
    }

    /// Load an entity subtree, `None` if no key exists under it
    pub async fn load(&self, collection: Collection, id: &str) -> Result<Option<EntityRecord>> {
        let pairs = self.kv.list(&collection.entity_prefix(id)).await?;
        EntityRecord::hydrate(collection, id, pairs)
    }

    /// IDs of every entity in a collection
    pub async fn ids(&self, collection: Collection) -> Result<Vec<String>> {
        let prefix = collection.prefix();
        let keys = self.kv.keys(&prefix, '/').await?;

        let ids: BTreeSet<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.strip_suffix('/'))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();

        Ok(ids.into_iter().collect())
    }

    /// Load one service of an entity, `None` if absent
    pub async fn load_service(
        &self,
        collection: Collection,
        id: &str,
        service_type: &str,
    ) -> Result<Option<Service>> {
        let base = collection.service_base(id, service_type);
        let pairs = self.kv.list(&collection.services_prefix(id)).await?;

        let entries: Vec<KvPair> = pairs
            .into_iter()
            .filter(|p| p.key == base || p.key.starts_with(&format!("{}/", base)))
            .collect();

        if entries.is_empty() {
            return Ok(None);
        }
        let config = decode_document(&base, &entries)?;
        Ok(Some(Service::new(service_type, config)))
    }

    /// Operations that clear a service and write `config` in its place
    pub fn replace_service_ops(
        collection: Collection,
        id: &str,
        service_type: &str,
        config: &Value,
    ) -> Result<Vec<TxnOp>> {
        let base = collection.service_base(id, service_type);
        let mut ops = Self::remove_service_ops(collection, id, service_type);
        ops.extend(
            encode_document(&base, config)?
                .into_iter()
                .map(|pair| TxnOp::set(pair.key, pair.value)),
        );
        Ok(ops)
    }

    /// Operations that delete a service subtree.
    ///
    /// The base key holds scalar or empty documents, so it is deleted on its
    /// own; a bare prefix delete would also hit `<type>` siblings sharing the
    /// same leading characters.
    pub fn remove_service_ops(collection: Collection, id: &str, service_type: &str) -> Vec<TxnOp> {
        let base = collection.service_base(id, service_type);
        vec![
            TxnOp::delete(base.clone()),
            TxnOp::delete_tree(format!("{}/", base)),
        ]
    }

    /// Apply one atomic transaction
    pub async fn commit(&self, ops: Vec<TxnOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let limit = self.kv.max_txn_ops();
        if ops.len() > limit {
            return Err(Error::InvalidArgument(format!(
                "write needs {} operations, store accepts at most {} per transaction",
                ops.len(),
                limit
            )));
        }
        debug!("Committing transaction with {} operations", ops.len());
        self.kv.transact(ops).await
    }
}
