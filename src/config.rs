//! Process configuration
//!
//! [`ControlPlaneConfig`] is built once at startup and turned into the running
//! components by [`ControlPlaneConfig::assemble`].

use crate::bootstrap::{BootstrapConfig, BootstrapService};
use crate::controlplane::{ApiServerConfig, BackendConfig, BackendFactory, Orchestrator, OrchestratorConfig};
use crate::error::{Error, Result};
use crate::metrics::ControlPlaneMetrics;
use std::sync::Arc;

/// Everything the control plane process needs to start
#[derive(Debug, Clone, Default)]
pub struct ControlPlaneConfig {
    pub api: ApiServerConfig,
    pub bootstrap: BootstrapConfig,
    pub orchestrator: OrchestratorConfig,
    pub backend: BackendConfig,
}

/// Wired components, ready to serve
pub struct ControlPlane {
    pub orchestrator: Arc<Orchestrator>,
    pub bootstrap: Arc<BootstrapService>,
    pub metrics: ControlPlaneMetrics,
}

impl ControlPlaneConfig {
    pub fn assemble(&self) -> Result<ControlPlane> {
        if self.orchestrator.public_address.is_empty() {
            return Err(Error::Configuration("public address is required".into()));
        }
        if self.bootstrap.token_ttl.is_zero() {
            return Err(Error::Configuration("bootstrap token TTL must be positive".into()));
        }

        let metrics = ControlPlaneMetrics::new()?;
        let collaborators = BackendFactory::create(&self.backend)?;
        let secrets = collaborators.secrets.clone();

        let orchestrator =
            Orchestrator::new(self.orchestrator.clone(), collaborators, metrics.clone());
        let bootstrap = Arc::new(BootstrapService::new(
            self.bootstrap.clone(),
            orchestrator.instances(),
            orchestrator.providers().clone(),
            secrets,
            metrics.clone(),
        ));

        Ok(ControlPlane {
            orchestrator,
            bootstrap,
            metrics,
        })
    }
}

/// Parses `KEY=PROJECT` into a simulated provider account
pub fn parse_account(value: &str) -> Result<(String, String)> {
    match value.split_once('=') {
        Some((credential, project)) if !credential.is_empty() && !project.is_empty() => {
            Ok((credential.to_string(), project.to_string()))
        }
        _ => Err(Error::Configuration(format!(
            "invalid account {:?}, expected KEY=PROJECT",
            value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::BackendMode;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn standalone() -> ControlPlaneConfig {
        let mut config = ControlPlaneConfig::default();
        config.backend.mode = BackendMode::Standalone {
            accounts: vec![("key-a".into(), "proj-a".into())],
        };
        config
    }

    #[test]
    fn test_parse_account() {
        assert_eq!(
            parse_account("key-a=proj-a").unwrap(),
            ("key-a".to_string(), "proj-a".to_string())
        );
        assert!(parse_account("key-a").is_err());
        assert!(parse_account("=proj-a").is_err());
        assert!(parse_account("key-a=").is_err());
    }

    #[tokio::test]
    async fn test_assemble_standalone() {
        let plane = standalone().assemble().unwrap();
        assert!(plane.orchestrator.health_check().await.unwrap());
        assert_eq!(plane.bootstrap.config().token_uses, 1);
    }

    #[test]
    fn test_assemble_rejects_zero_ttl() {
        let mut config = standalone();
        config.bootstrap.token_ttl = Duration::ZERO;
        assert_matches!(config.assemble().err(), Some(Error::Configuration(_)));
    }
}
