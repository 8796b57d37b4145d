//! Bootstrap Trust Protocol
//!
//! A freshly provisioned device calls `GET /bootstrap/<instance id>` with the
//! provider credential it was provisioned with. The handshake succeeds only if
//! the provider reports a management interface on that device whose address is
//! exactly the TCP peer address of the request. The device then receives a
//! short-lived, single-use secret-store token plus the shared payload.
//!
//! The handshake itself keeps no state and may be repeated; every success
//! mints a fresh token.

pub mod http;

pub use http::BootstrapRouter;

use crate::directory::InstanceManager;
use crate::domain::model::Credential;
use crate::domain::ports::{DeviceStatus, IssuedToken, SecretStoreRef, TokenRequest};
use crate::error::{Error, Result};
use crate::metrics::ControlPlaneMetrics;
use crate::provider::ProviderRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the bootstrap endpoint
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub bind_addr: SocketAddr,
    /// Secret-store policy attached to minted tokens
    pub token_policy: String,
    pub token_ttl: Duration,
    /// Uses allowed per minted token
    pub token_uses: u32,
    /// Static values handed to every bootstrapped device
    pub shared_payload: BTreeMap<String, String>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            token_policy: "bootstrap".to_string(),
            token_ttl: Duration::from_secs(300),
            token_uses: 1,
            shared_payload: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Response
// =============================================================================

/// Material handed to a verified device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPayload {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(flatten)]
    pub shared: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub instance: String,
    pub payload: BootstrapPayload,
}

/// True if `peer` is the address of one of the device's management interfaces
pub fn peer_matches_device(device: &DeviceStatus, peer: IpAddr) -> bool {
    let peer = peer.to_canonical();
    device
        .interfaces
        .iter()
        .filter(|interface| interface.management)
        .filter_map(|interface| interface.address.parse::<IpAddr>().ok())
        .any(|address| address.to_canonical() == peer)
}

// =============================================================================
// Bootstrap Service
// =============================================================================

/// Verifies devices and issues their operational credential
pub struct BootstrapService {
    config: BootstrapConfig,
    instances: Arc<InstanceManager>,
    providers: ProviderRegistry,
    secrets: SecretStoreRef,
    metrics: ControlPlaneMetrics,
}

impl BootstrapService {
    pub fn new(
        config: BootstrapConfig,
        instances: Arc<InstanceManager>,
        providers: ProviderRegistry,
        secrets: SecretStoreRef,
        metrics: ControlPlaneMetrics,
    ) -> Self {
        Self {
            config,
            instances,
            providers,
            secrets,
            metrics,
        }
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// Run the handshake and count the outcome
    pub async fn handshake(
        &self,
        instance_id: &str,
        peer: IpAddr,
        credential: &str,
    ) -> Result<BootstrapResponse> {
        let outcome = self.verify_and_issue(instance_id, peer, credential).await;
        let label = if outcome.is_ok() { "granted" } else { "denied" };
        self.metrics
            .bootstrap_attempts
            .with_label_values(&[label])
            .inc();
        outcome
    }

    async fn verify_and_issue(
        &self,
        instance_id: &str,
        peer: IpAddr,
        credential: &str,
    ) -> Result<BootstrapResponse> {
        if credential.is_empty() {
            return Err(Error::PermissionDenied("no credential presented".into()));
        }

        let instance = self.instances.get_instance(instance_id).await?;
        let credential = Credential::new(instance.provider, credential);
        let adapter = self.providers.get(credential.provider)?;

        let device = adapter
            .device_status(&instance.device, &credential.payload)
            .await?;

        if !peer_matches_device(&device, peer) {
            warn!(
                "Bootstrap for {} from {}: not a management address of device {}",
                instance_id, peer, device.id
            );
            return Err(Error::PermissionDenied("peer address mismatch".into()));
        }

        let token = self.mint(instance_id).await?;
        info!(
            "Bootstrap granted to instance {} from {} (token expires {})",
            instance_id, peer, token.expires_at
        );

        Ok(BootstrapResponse {
            instance: instance.id,
            payload: BootstrapPayload {
                token: token.token,
                expires_at: token.expires_at,
                shared: self.config.shared_payload.clone(),
            },
        })
    }

    async fn mint(&self, instance_id: &str) -> Result<IssuedToken> {
        self.secrets
            .mint_token(&TokenRequest {
                policies: vec![self.config.token_policy.clone()],
                ttl: self.config.token_ttl,
                num_uses: self.config.token_uses,
                metadata: BTreeMap::from([("instance".to_string(), instance_id.to_string())]),
            })
            .await
    }
}
