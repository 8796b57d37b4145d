//! Control Plane Orchestrator
//!
//! Implements every upward operation in the same order:
//! 1. Authorization guard (provider identity, device access)
//! 2. Resource directory (entity store)
//! 3. Provider and secret-store side effects
//!
//! Nothing is written to the store before the guard passes.

use crate::auth::{AuthorizationGuard, GuardConfig};
use crate::directory::{
    ApplicationManager, CleanupFailure, DestroyReport, InstanceManager, ResourceLocks,
};
use crate::domain::model::{Application, Credential, Instance, Service};
use crate::domain::ports::{AccessControlRef, KvStoreRef, ProvisionSpec, SecretStoreRef};
use crate::error::{Error, Result};
use crate::metrics::ControlPlaneMetrics;
use crate::provider::ProviderRegistry;
use crate::store::EntityStore;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address devices use to reach the control plane (`CORE_ADDR`)
    pub public_address: String,
    /// Operating system slug for new devices
    pub operating_system: String,
    /// Device hostnames are `<prefix>-<first id segment>`
    pub hostname_prefix: String,
    pub guard: GuardConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            public_address: "127.0.0.1:8090".to_string(),
            operating_system: "ubuntu_16_04".to_string(),
            hostname_prefix: "fleet".to_string(),
            guard: GuardConfig::default(),
        }
    }
}

/// Placement of a new device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    /// Provider facility / region slug
    pub region: String,
    /// Provider plan slug
    pub plan: String,
}

/// Collaborators wired into the orchestrator
#[derive(Clone)]
pub struct Collaborators {
    pub kv: KvStoreRef,
    pub secrets: SecretStoreRef,
    pub acl: AccessControlRef,
    pub providers: ProviderRegistry,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Coordinates guard, directory, and provider for every upward call
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: EntityStore,
    guard: AuthorizationGuard,
    instances: Arc<InstanceManager>,
    applications: ApplicationManager,
    metrics: ControlPlaneMetrics,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        metrics: ControlPlaneMetrics,
    ) -> Arc<Self> {
        let store = EntityStore::new(collaborators.kv);
        let locks = Arc::new(ResourceLocks::new());
        let instances = Arc::new(InstanceManager::new(
            store.clone(),
            locks.clone(),
            collaborators.acl,
            collaborators.secrets,
        ));
        let applications = ApplicationManager::new(store.clone(), locks);
        let guard = AuthorizationGuard::new(config.guard.clone(), collaborators.providers);

        Arc::new(Self {
            config,
            store,
            guard,
            instances,
            applications,
            metrics,
        })
    }

    pub fn instances(&self) -> Arc<InstanceManager> {
        self.instances.clone()
    }

    pub fn providers(&self) -> &ProviderRegistry {
        self.guard.providers()
    }

    pub async fn health_check(&self) -> Result<bool> {
        self.store.kv().health_check().await
    }

    fn hostname(&self, instance_id: &str) -> String {
        let short = instance_id.split('-').next().unwrap_or(instance_id);
        format!("{}-{}", self.config.hostname_prefix, short)
    }

    fn record_cleanup(&self, report: &DestroyReport) {
        for failure in &report.cleanup_failures {
            self.metrics
                .cleanup_failures
                .with_label_values(&[failure.step.as_str()])
                .inc();
        }
    }

    /// Authenticate, then load the instance and run the remaining checks.
    ///
    /// A rejected credential never learns whether the id exists.
    async fn authorized_instance(
        &self,
        credential: &Credential,
        id: &str,
    ) -> Result<(Instance, crate::auth::InstanceGrant)> {
        let principal = self.guard.authenticate(credential).await?;
        let instance = self.instances.get_instance(id).await?;
        let grant = self
            .guard
            .check_instance(principal, credential, &instance)
            .await?;
        Ok((instance, grant))
    }

    async fn authorized_application(&self, credential: &Credential, id: &str) -> Result<Application> {
        let principal = self.guard.authenticate(credential).await?;
        let application = self.applications.get_application(id).await?;
        self.guard.check_application(principal, &application)?;
        Ok(application)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Record, secure, and provision a new instance.
    ///
    /// Provisioning is not idempotent. A provider failure destroys the
    /// record best-effort; a failure after the device exists leaves an
    /// orphaned device, which is logged.
    pub async fn create_instance(
        &self,
        credential: &Credential,
        request: &CreateInstanceRequest,
    ) -> Result<Instance> {
        if request.region.is_empty() || request.plan.is_empty() {
            return Err(Error::InvalidArgument("region and plan are required".into()));
        }

        let principal = self.guard.authenticate(credential).await?;
        let adapter = self.guard.adapter(credential)?;

        let instance = self
            .instances
            .create_instance(&principal.identity, credential.provider)
            .await?;

        if let Err(e) = self.instances.issue_bootstrap_secret(&instance.id).await {
            error!("Instance {}: bootstrap secret setup failed: {}", instance.id, e);
            self.roll_back(&instance.id).await;
            return Err(e);
        }

        let spec = ProvisionSpec {
            instance_id: instance.id.clone(),
            owner: principal.identity.clone(),
            hostname: self.hostname(&instance.id),
            region: request.region.clone(),
            plan: request.plan.clone(),
            operating_system: self.config.operating_system.clone(),
            credential: credential.payload.clone(),
            custom_data: json!({
                "INSTANCE_ID": instance.id,
                "CORE_ADDR": self.config.public_address,
                "PROVIDER_AUTH": credential.payload,
            }),
        };

        let device = match adapter.provision(&spec).await {
            Ok(device) => device,
            Err(e) => {
                error!("Instance {}: provisioning failed: {}", instance.id, e);
                self.roll_back(&instance.id).await;
                return Err(e);
            }
        };

        let fields = BTreeMap::from([("device".to_string(), device.clone())]);
        let instance = match self.instances.set_fields(&instance.id, &fields).await {
            Ok(instance) => instance,
            Err(e) => {
                error!(
                    "Instance {}: device {} provisioned but not recorded, device is orphaned: {}",
                    instance.id, device, e
                );
                self.metrics
                    .cleanup_failures
                    .with_label_values(&["orphaned_device"])
                    .inc();
                return Err(e);
            }
        };

        self.metrics.instances_created.inc();
        info!(
            "Instance {} provisioned as device {} for {}",
            instance.id, device, principal.identity
        );
        Ok(instance)
    }

    async fn roll_back(&self, instance_id: &str) {
        match self.instances.destroy_instance(instance_id).await {
            Ok(report) => self.record_cleanup(&report),
            Err(e) => {
                warn!("Instance {}: rollback failed, record is orphaned: {}", instance_id, e);
                self.metrics
                    .cleanup_failures
                    .with_label_values(&["orphaned_record"])
                    .inc();
            }
        }
    }

    pub async fn get_instance(&self, credential: &Credential, id: &str) -> Result<Instance> {
        let (instance, _) = self.authorized_instance(credential, id).await?;
        Ok(instance)
    }

    /// Destroy an instance whose device has finished provisioning.
    ///
    /// The record goes first; the device delete and the other side effects
    /// are best-effort and reported in the returned [`DestroyReport`].
    pub async fn destroy_instance(&self, credential: &Credential, id: &str) -> Result<DestroyReport> {
        let (instance, grant) = self.authorized_instance(credential, id).await?;
        if !grant.device.is_active() {
            return Err(Error::FailedPrecondition(format!(
                "device {} is {}, not active",
                instance.device, grant.device.status
            )));
        }

        let mut report = self.instances.destroy_instance(id).await?;

        let adapter = self.guard.adapter(credential)?;
        if let Err(e) = adapter.deprovision(&instance.device, &credential.payload).await {
            warn!("Instance {}: device {} not deleted: {}", id, instance.device, e);
            report.cleanup_failures.push(CleanupFailure::new("deprovision", &e));
        }

        self.record_cleanup(&report);
        self.metrics.instances_destroyed.inc();
        Ok(report)
    }

    /// Stream the caller's instances.
    ///
    /// IDs are listed once up front; instances destroyed while streaming are
    /// skipped.
    pub async fn list_instances(
        &self,
        credential: &Credential,
    ) -> Result<BoxStream<'static, Result<Instance>>> {
        let principal = self.guard.authenticate(credential).await?;
        let ids = self.instances.instance_ids().await?;
        let instances = self.instances.clone();

        Ok(stream::iter(ids)
            .then(move |id| {
                let instances = instances.clone();
                async move { instances.find_instance(&id).await }
            })
            .filter_map(move |loaded| {
                let visible = match loaded {
                    Ok(Some(instance))
                        if instance.provider == principal.provider
                            && instance.owner == principal.identity =>
                    {
                        Some(Ok(instance))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(visible)
            })
            .boxed())
    }

    pub async fn add_service(
        &self,
        credential: &Credential,
        id: &str,
        service_type: &str,
        config: &Value,
    ) -> Result<Instance> {
        self.authorized_instance(credential, id).await?;
        self.instances.add_service(id, service_type, config).await
    }

    pub async fn get_service(
        &self,
        credential: &Credential,
        id: &str,
        service_type: &str,
    ) -> Result<Service> {
        self.authorized_instance(credential, id).await?;
        self.instances.get_service(id, service_type).await
    }

    pub async fn configure_service(
        &self,
        credential: &Credential,
        id: &str,
        service_type: &str,
        config: &Value,
    ) -> Result<Service> {
        self.authorized_instance(credential, id).await?;
        self.instances.configure_service(id, service_type, config).await
    }

    pub async fn remove_service(
        &self,
        credential: &Credential,
        id: &str,
        service_type: &str,
    ) -> Result<Instance> {
        self.authorized_instance(credential, id).await?;
        self.instances.remove_service(id, service_type).await
    }

    // =========================================================================
    // Applications
    // =========================================================================

    pub async fn create_application(
        &self,
        credential: &Credential,
        app_type: &str,
    ) -> Result<Application> {
        let principal = self.guard.authenticate(credential).await?;
        self.guard.adapter(credential)?;
        self.applications
            .create_application(&principal.identity, credential.provider, app_type)
            .await
    }

    pub async fn get_application(&self, credential: &Credential, id: &str) -> Result<Application> {
        self.authorized_application(credential, id).await
    }

    pub async fn destroy_application(&self, credential: &Credential, id: &str) -> Result<()> {
        self.authorized_application(credential, id).await?;
        self.applications.destroy_application(id).await
    }

    /// Both the application and the instance must be accessible
    pub async fn add_instance(
        &self,
        credential: &Credential,
        id: &str,
        instance_id: &str,
    ) -> Result<Application> {
        self.authorized_application(credential, id).await?;
        self.authorized_instance(credential, instance_id).await?;
        self.applications.add_instance(id, instance_id).await
    }

    /// Only the application is checked; the instance may already be gone
    pub async fn remove_instance(
        &self,
        credential: &Credential,
        id: &str,
        instance_id: &str,
    ) -> Result<Application> {
        self.authorized_application(credential, id).await?;
        self.applications.remove_instance(id, instance_id).await
    }

    pub async fn add_application_service(
        &self,
        credential: &Credential,
        id: &str,
        service_type: &str,
        config: &Value,
    ) -> Result<Application> {
        self.authorized_application(credential, id).await?;
        self.applications.add_service(id, service_type, config).await
    }

    pub async fn get_application_service(
        &self,
        credential: &Credential,
        id: &str,
        service_type: &str,
    ) -> Result<Service> {
        self.authorized_application(credential, id).await?;
        self.applications.get_service(id, service_type).await
    }

    pub async fn configure_application_service(
        &self,
        credential: &Credential,
        id: &str,
        service_type: &str,
        config: &Value,
    ) -> Result<Service> {
        self.authorized_application(credential, id).await?;
        self.applications
            .configure_service(id, service_type, config)
            .await
    }

    pub async fn remove_application_service(
        &self,
        credential: &Credential,
        id: &str,
        service_type: &str,
    ) -> Result<Application> {
        self.authorized_application(credential, id).await?;
        self.applications.remove_service(id, service_type).await
    }
}
