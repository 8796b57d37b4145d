//! Entity Store
//!
//! Typed resources live in a flat key-value namespace:
//!
//! ```text
//! <collection>/<id>/<field>                       scalar field
//! <collection>/<id>/services/<type>[/<path…>]     service config leaves
//! applications/<id>/instances/<instance id>       membership pointer
//! ```
//!
//! Backends:
//! - Consul: HTTP KV + transactions, ACL tokens
//! - Memory: ordered map for standalone mode and tests

pub mod codec;
pub mod consul;
pub mod entity;
pub mod memory;

pub use codec::{decode_document, encode_document, Segment};
pub use consul::{ConsulAcl, ConsulClient, ConsulConfig, ConsulKvStore};
pub use entity::{EntityRecord, EntityStore};
pub use memory::{MemoryAccessControl, MemoryKvStore};

use crate::error::{Error, Result};
use std::fmt;

// =============================================================================
// Keyspace
// =============================================================================

/// Top-level key collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Instances,
    Applications,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Instances => "instances",
            Collection::Applications => "applications",
        }
    }

    /// Singular name used in errors
    pub fn kind(&self) -> &'static str {
        match self {
            Collection::Instances => "instance",
            Collection::Applications => "application",
        }
    }

    /// `<collection>/`
    pub fn prefix(&self) -> String {
        format!("{}/", self.as_str())
    }

    /// `<collection>/<id>/`, the entity subtree
    pub fn entity_prefix(&self, id: &str) -> String {
        format!("{}/{}/", self.as_str(), id)
    }

    pub fn field_key(&self, id: &str, field: &str) -> String {
        format!("{}/{}/{}", self.as_str(), id, field)
    }

    pub fn services_prefix(&self, id: &str) -> String {
        format!("{}/{}/services/", self.as_str(), id)
    }

    /// Base key of one service's config document
    pub fn service_base(&self, id: &str, service_type: &str) -> String {
        format!("{}/{}/services/{}", self.as_str(), id, service_type)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of an application's pointer to one of its instances
pub fn member_key(application_id: &str, instance_id: &str) -> String {
    format!("applications/{}/instances/{}", application_id, instance_id)
}

/// IDs are single key segments
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidArgument(format!("{} id is required", kind)));
    }
    if id.contains('/') || id == "." || id == ".." {
        return Err(Error::InvalidArgument(format!("invalid {} id: {:?}", kind, id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_layout() {
        let c = Collection::Instances;
        assert_eq!(c.entity_prefix("abc"), "instances/abc/");
        assert_eq!(c.field_key("abc", "owner"), "instances/abc/owner");
        assert_eq!(c.service_base("abc", "web"), "instances/abc/services/web");
        assert_eq!(member_key("app", "abc"), "applications/app/instances/abc");
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("instance", "5b0e7c1a-0000-4000-8000-000000000000").is_ok());
        assert!(validate_id("instance", "").is_err());
        assert!(validate_id("instance", "a/b").is_err());
        assert!(validate_id("instance", "..").is_err());
    }
}
