//! Authorization Guard
//!
//! Decides whether a caller's provider credential may act on a resource.
//!
//! 1. The credential must resolve to a non-empty provider identity.
//! 2. For an instance, the provider must let that credential read the
//!    instance's device. A successful read stands in for ownership.
//!
//! By default the resolved identity is *not* compared to the stored owner:
//! any credential able to read the device passes, even one from another
//! account the provider lets see it. [`GuardConfig::enforce_owner_match`]
//! closes that gap.

use crate::domain::model::{Application, Credential, Instance};
use crate::domain::ports::{DeviceStatus, ProviderAdapterRef};
use crate::error::{Error, Result};
use crate::provider::ProviderRegistry;
use tracing::{debug, warn};

/// Guard settings
#[derive(Debug, Clone, Default)]
pub struct GuardConfig {
    /// Also require the resolved identity to equal the stored owner
    pub enforce_owner_match: bool,
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub provider: crate::domain::model::Provider,
    /// Provider account the credential belongs to
    pub identity: String,
}

/// Result of a successful instance check
#[derive(Debug, Clone)]
pub struct InstanceGrant {
    pub principal: Principal,
    /// Device state read while authorizing
    pub device: DeviceStatus,
}

/// Checks credentials against the provider before any mutation
#[derive(Clone)]
pub struct AuthorizationGuard {
    config: GuardConfig,
    providers: ProviderRegistry,
}

impl AuthorizationGuard {
    pub fn new(config: GuardConfig, providers: ProviderRegistry) -> Self {
        Self { config, providers }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn adapter(&self, credential: &Credential) -> Result<ProviderAdapterRef> {
        self.providers.get(credential.provider)
    }

    /// Resolve the credential to an identity
    pub async fn authenticate(&self, credential: &Credential) -> Result<Principal> {
        let adapter = self.adapter(credential)?;

        let identity = match adapter.identity_of(&credential.payload).await {
            Ok(identity) => identity,
            Err(e) => {
                debug!("Credential rejected by {}: {}", credential.provider, e);
                return Err(Error::PermissionDenied("credential rejected".into()));
            }
        };
        if identity.is_empty() {
            return Err(Error::PermissionDenied("credential has no identity".into()));
        }

        Ok(Principal {
            provider: credential.provider,
            identity,
        })
    }

    /// Authenticate, then prove the credential can reach the instance's device
    pub async fn authorize_instance(
        &self,
        credential: &Credential,
        instance: &Instance,
    ) -> Result<InstanceGrant> {
        let principal = self.authenticate(credential).await?;
        self.check_instance(principal, credential, instance).await
    }

    /// Instance checks for an already authenticated caller
    pub async fn check_instance(
        &self,
        principal: Principal,
        credential: &Credential,
        instance: &Instance,
    ) -> Result<InstanceGrant> {
        if credential.provider != instance.provider {
            return Err(Error::PermissionDenied(format!(
                "credential is for {}, instance is on {}",
                credential.provider, instance.provider
            )));
        }
        self.check_owner(&principal, &instance.owner, &instance.id)?;

        let adapter = self.adapter(credential)?;
        let device = match adapter
            .device_status(&instance.device, &credential.payload)
            .await
        {
            Ok(device) => device,
            Err(e) => {
                warn!(
                    "Instance {}: device {:?} not readable by {}: {}",
                    instance.id, instance.device, principal.identity, e
                );
                return Err(Error::PermissionDenied("device not accessible".into()));
            }
        };

        Ok(InstanceGrant { principal, device })
    }

    /// Applications have no device to read; provider and, if enabled, owner
    /// are all there is to check
    pub async fn authorize_application(
        &self,
        credential: &Credential,
        application: &Application,
    ) -> Result<Principal> {
        let principal = self.authenticate(credential).await?;
        self.check_application(principal, application)
    }

    /// Application checks for an already authenticated caller
    pub fn check_application(
        &self,
        principal: Principal,
        application: &Application,
    ) -> Result<Principal> {
        if principal.provider != application.provider {
            return Err(Error::PermissionDenied(format!(
                "credential is for {}, application is on {}",
                principal.provider, application.provider
            )));
        }
        self.check_owner(&principal, &application.owner, &application.id)?;
        Ok(principal)
    }

    fn check_owner(&self, principal: &Principal, owner: &str, resource: &str) -> Result<()> {
        if self.config.enforce_owner_match && principal.identity != owner {
            warn!(
                "Owner mismatch on {}: {} is not {}",
                resource, principal.identity, owner
            );
            return Err(Error::PermissionDenied("not the owner".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::Provider;
    use crate::domain::ports::{ProviderAdapter, ProvisionSpec};
    use crate::provider::SimulatedProvider;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    async fn setup(enforce_owner_match: bool) -> (AuthorizationGuard, Instance) {
        let sim = Arc::new(
            SimulatedProvider::new()
                .with_account("key-a", "proj-a")
                .with_account("key-b", "proj-b"),
        );
        let device = sim
            .provision(&ProvisionSpec {
                instance_id: "i-1".into(),
                owner: "proj-a".into(),
                hostname: "fleet-i".into(),
                region: "ewr1".into(),
                plan: "baremetal_0".into(),
                operating_system: "ubuntu_16_04".into(),
                credential: "key-a".into(),
                custom_data: serde_json::json!({}),
            })
            .await
            .unwrap();

        let guard = AuthorizationGuard::new(
            GuardConfig {
                enforce_owner_match,
            },
            ProviderRegistry::new().with(sim),
        );
        let instance = Instance {
            id: "i-1".into(),
            provider: Provider::Packet,
            owner: "proj-a".into(),
            device,
            services: vec![],
        };
        (guard, instance)
    }

    #[tokio::test]
    async fn test_authenticate() {
        let (guard, _) = setup(false).await;
        let principal = guard
            .authenticate(&Credential::new(Provider::Packet, "key-a"))
            .await
            .unwrap();
        assert_eq!(principal.identity, "proj-a");

        assert_matches!(
            guard
                .authenticate(&Credential::new(Provider::Packet, "garbage"))
                .await,
            Err(Error::PermissionDenied(_))
        );
    }

    #[tokio::test]
    async fn test_unregistered_provider() {
        let guard = AuthorizationGuard::new(GuardConfig::default(), ProviderRegistry::new());
        assert_matches!(
            guard
                .authenticate(&Credential::new(Provider::Packet, "key-a"))
                .await,
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_device_read_grants_access() {
        let (guard, instance) = setup(false).await;
        let grant = guard
            .authorize_instance(&Credential::new(Provider::Packet, "key-a"), &instance)
            .await
            .unwrap();
        assert!(grant.device.is_active());

        assert_matches!(
            guard
                .authorize_instance(&Credential::new(Provider::Packet, "key-b"), &instance)
                .await,
            Err(Error::PermissionDenied(_))
        );
    }

    #[tokio::test]
    async fn test_unprovisioned_instance_denied() {
        let (guard, mut instance) = setup(false).await;
        instance.device.clear();
        assert_matches!(
            guard
                .authorize_instance(&Credential::new(Provider::Packet, "key-a"), &instance)
                .await,
            Err(Error::PermissionDenied(_))
        );
    }

    #[tokio::test]
    async fn test_owner_not_compared_by_default() {
        let (guard, mut instance) = setup(false).await;
        instance.owner = "someone-else".into();
        assert!(guard
            .authorize_instance(&Credential::new(Provider::Packet, "key-a"), &instance)
            .await
            .is_ok());

        let (guard, mut instance) = setup(true).await;
        instance.owner = "someone-else".into();
        assert_matches!(
            guard
                .authorize_instance(&Credential::new(Provider::Packet, "key-a"), &instance)
                .await,
            Err(Error::PermissionDenied(_))
        );
    }

    #[tokio::test]
    async fn test_application_owner_opt_in() {
        let (guard, _) = setup(true).await;
        let app = Application {
            id: "a-1".into(),
            app_type: "kubernetes".into(),
            owner: "proj-a".into(),
            provider: Provider::Packet,
            services: vec![],
            instances: Default::default(),
        };
        assert!(guard
            .authorize_application(&Credential::new(Provider::Packet, "key-a"), &app)
            .await
            .is_ok());
        assert_matches!(
            guard
                .authorize_application(&Credential::new(Provider::Packet, "key-b"), &app)
                .await,
            Err(Error::PermissionDenied(_))
        );
    }
}
