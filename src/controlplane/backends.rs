//! Backend wiring
//!
//! Builds the orchestrator's collaborators either from in-process stand-ins
//! (standalone mode) or from Consul, Vault and the Packet API.

use super::orchestrator::Collaborators;
use crate::domain::ports::{AccessControlRef, KvStoreRef, SecretStoreRef};
use crate::error::{Error, Result};
use crate::provider::{PacketConfig, PacketProvider, ProviderRegistry, SimulatedProvider};
use crate::secrets::{MemorySecretStore, VaultConfig, VaultSecretStore};
use crate::store::{
    ConsulAcl, ConsulClient, ConsulConfig, ConsulKvStore, MemoryAccessControl, MemoryKvStore,
};
use std::sync::Arc;
use tracing::info;

/// Which collaborators back the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMode {
    /// Everything in memory; provider accounts are `(credential, project)` pairs
    Standalone { accounts: Vec<(String, String)> },
    /// Consul, Vault and Packet
    External,
}

/// Combined backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub mode: BackendMode,
    pub consul: ConsulConfig,
    pub vault: VaultConfig,
    pub packet: PacketConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::External,
            consul: ConsulConfig::default(),
            vault: VaultConfig::default(),
            packet: PacketConfig::default(),
        }
    }
}

/// Factory for the orchestrator's collaborators
pub struct BackendFactory;

impl BackendFactory {
    pub fn create(config: &BackendConfig) -> Result<Collaborators> {
        match &config.mode {
            BackendMode::Standalone { accounts } => Ok(Self::standalone(accounts)),
            BackendMode::External => Self::external(config),
        }
    }

    fn standalone(accounts: &[(String, String)]) -> Collaborators {
        info!(
            "Using in-memory store, secrets and simulated provider ({} accounts)",
            accounts.len()
        );

        let sim = SimulatedProvider::new();
        for (credential, project) in accounts {
            sim.add_account(credential.clone(), project.clone());
        }

        let kv: KvStoreRef = Arc::new(MemoryKvStore::new());
        let acl: AccessControlRef = Arc::new(MemoryAccessControl::new());
        let secrets: SecretStoreRef = Arc::new(MemorySecretStore::new());

        Collaborators {
            kv,
            secrets,
            acl,
            providers: ProviderRegistry::new().with(Arc::new(sim)),
        }
    }

    fn external(config: &BackendConfig) -> Result<Collaborators> {
        if config.consul.address.is_empty() {
            return Err(Error::Configuration("Consul address is required".into()));
        }
        info!("Using Consul at {}", config.consul.address);
        info!("Using Vault at {}", config.vault.address);
        info!("Using Packet API at {}", config.packet.api_url);

        let consul = ConsulClient::new(config.consul.clone())?;
        let kv: KvStoreRef = Arc::new(ConsulKvStore::new(consul.clone()));
        let acl: AccessControlRef = Arc::new(ConsulAcl::new(consul));
        let secrets: SecretStoreRef = Arc::new(VaultSecretStore::new(config.vault.clone())?);
        let packet = PacketProvider::new(config.packet.clone())?;

        Ok(Collaborators {
            kv,
            secrets,
            acl,
            providers: ProviderRegistry::new().with(Arc::new(packet)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::Provider;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_standalone_accounts_registered() {
        let config = BackendConfig {
            mode: BackendMode::Standalone {
                accounts: vec![("key-a".into(), "proj-a".into())],
            },
            ..Default::default()
        };

        let collaborators = BackendFactory::create(&config).unwrap();
        let adapter = collaborators.providers.get(Provider::Packet).unwrap();
        assert_eq!(adapter.identity_of("key-a").await.unwrap(), "proj-a");
        assert!(collaborators.kv.health_check().await.unwrap());
    }

    #[test]
    fn test_external_requires_vault_token() {
        let config = BackendConfig::default();
        assert_matches!(
            BackendFactory::create(&config).err(),
            Some(Error::Configuration(_))
        );
    }
}
