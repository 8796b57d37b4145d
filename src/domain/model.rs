//! Resource records managed by the control plane

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Provider
// =============================================================================

/// Compute backends an instance or application can live on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Provider {
    Packet,
}

impl Provider {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Packet => "PACKET",
        }
    }

    /// Exact match on the stored representation; no case folding
    pub fn from_stored(s: &str) -> Option<Self> {
        [Provider::Packet]
            .into_iter()
            .find(|provider| provider.as_str() == s)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Case-insensitive; for request input such as the `X-Provider` header
impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "PACKET" => Ok(Provider::Packet),
            other => Err(Error::InvalidArgument(format!(
                "unrecognized provider: {:?}",
                other
            ))),
        }
    }
}

// =============================================================================
// Credential
// =============================================================================

/// Provider-level credential presented by a caller
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub provider: Provider,
    pub payload: String,
}

impl Credential {
    pub fn new(provider: Provider, payload: impl Into<String>) -> Self {
        Self {
            provider,
            payload: payload.into(),
        }
    }
}

// The payload is a provider API key; keep it out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("payload", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Service
// =============================================================================

/// A named, independently configured capability on an instance or application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "type")]
    pub service_type: String,
    pub config: Value,
}

impl Service {
    pub fn new(service_type: impl Into<String>, config: Value) -> Self {
        Self {
            service_type: service_type.into(),
            config,
        }
    }
}

/// Service types become key segments, so they are kept to a safe alphabet.
pub fn validate_service_type(service_type: &str) -> Result<()> {
    if service_type.is_empty() {
        return Err(Error::InvalidArgument("service type is required".into()));
    }
    let valid = service_type
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid || service_type == "." || service_type == ".." {
        return Err(Error::InvalidArgument(format!(
            "invalid service type: {:?}",
            service_type
        )));
    }
    Ok(())
}

// =============================================================================
// Instance
// =============================================================================

/// A managed compute device leased from a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub provider: Provider,
    pub owner: String,
    /// Provider device handle; empty until provisioning completes
    pub device: String,
    pub services: Vec<Service>,
}

impl Instance {
    pub fn service(&self, service_type: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.service_type == service_type)
    }

    pub fn is_provisioned(&self) -> bool {
        !self.device.is_empty()
    }
}

/// Scalar instance fields that may be patched after creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceField {
    Device,
    Owner,
}

impl InstanceField {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceField::Device => "device",
            InstanceField::Owner => "owner",
        }
    }
}

impl FromStr for InstanceField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "device" => Ok(InstanceField::Device),
            "owner" => Ok(InstanceField::Owner),
            other => Err(Error::InvalidArgument(format!(
                "field {:?} cannot be set",
                other
            ))),
        }
    }
}

// =============================================================================
// Application
// =============================================================================

/// A logical grouping of instances and declared services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    #[serde(rename = "type")]
    pub app_type: String,
    pub owner: String,
    pub provider: Provider,
    pub services: Vec<Service>,
    /// Membership pointers; the instance records belong to the instance collection
    pub instances: BTreeSet<String>,
}

impl Application {
    pub fn service(&self, service_type: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.service_type == service_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_provider_parse() {
        assert_eq!("PACKET".parse::<Provider>().unwrap(), Provider::Packet);
        assert_eq!("packet".parse::<Provider>().unwrap(), Provider::Packet);
        assert_matches!("AWS".parse::<Provider>(), Err(Error::InvalidArgument(_)));
        assert_eq!(Provider::Packet.to_string(), "PACKET");
        assert_eq!(Provider::from_stored("PACKET"), Some(Provider::Packet));
        assert_eq!(Provider::from_stored("packet"), None);
    }

    #[test]
    fn test_credential_debug_redacts_payload() {
        let cred = Credential::new(Provider::Packet, "super-secret-key");
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("super-secret-key"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_service_type_validation() {
        assert!(validate_service_type("web").is_ok());
        assert!(validate_service_type("node-exporter_v2.1").is_ok());
        assert!(validate_service_type("").is_err());
        assert!(validate_service_type("a/b").is_err());
        assert!(validate_service_type("..").is_err());
        assert!(validate_service_type("[0]").is_err());
    }

    #[test]
    fn test_instance_field_allow_list() {
        assert_eq!("device".parse::<InstanceField>().unwrap(), InstanceField::Device);
        assert_eq!("owner".parse::<InstanceField>().unwrap(), InstanceField::Owner);
        assert_matches!("provider".parse::<InstanceField>(), Err(Error::InvalidArgument(_)));
        assert_matches!("services/web".parse::<InstanceField>(), Err(Error::InvalidArgument(_)));
    }
}
