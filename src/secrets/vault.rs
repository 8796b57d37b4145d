//! Vault Secret Store Adapter
//!
//! - `POST /v1/<path>` / `DELETE /v1/<path>` for KV secrets
//! - `POST /v1/auth/token/create` for scoped, use-limited tokens

use crate::domain::ports::{IssuedToken, SecretStore, TokenRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for the Vault adapter
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub address: String,
    /// Token the control plane authenticates with
    pub token: String,
    pub request_timeout_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8200".to_string(),
            token: String::new(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Serialize)]
struct TokenCreate<'a> {
    policies: &'a [String],
    ttl: String,
    num_uses: u32,
    renewable: bool,
    no_parent: bool,
    meta: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TokenCreateResponse {
    auth: TokenAuth,
}

#[derive(Debug, Deserialize)]
struct TokenAuth {
    client_token: String,
    lease_duration: i64,
}

/// Secret store backed by HashiCorp Vault
#[derive(Debug)]
pub struct VaultSecretStore {
    config: VaultConfig,
    http: reqwest::Client,
}

impl VaultSecretStore {
    pub fn new(config: VaultConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(Error::Configuration("Vault token is required".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Configuration(format!("Vault HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/v1/{}",
            self.config.address.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        self.http
            .request(method, url)
            .header("X-Vault-Token", &self.config.token)
    }

    fn failure(operation: &str, path: &str, reason: impl ToString) -> Error {
        Error::SecretStore {
            operation: operation.to_string(),
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    async fn write(&self, path: &str, data: &BTreeMap<String, String>) -> Result<()> {
        let response = self
            .request(Method::POST, path)
            .json(data)
            .send()
            .await
            .map_err(|e| Self::failure("write", path, e))?;

        if !response.status().is_success() {
            return Err(Self::failure("write", path, response.status()));
        }
        debug!("Wrote secret {}", path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, path)
            .send()
            .await
            .map_err(|e| Self::failure("delete", path, e))?;

        // Already gone is fine
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            debug!("Deleted secret {}", path);
            return Ok(());
        }
        Err(Self::failure("delete", path, response.status()))
    }

    async fn mint_token(&self, request: &TokenRequest) -> Result<IssuedToken> {
        const PATH: &str = "auth/token/create";
        let body = TokenCreate {
            policies: &request.policies,
            ttl: format!("{}s", request.ttl.as_secs()),
            num_uses: request.num_uses,
            renewable: false,
            no_parent: true,
            meta: &request.metadata,
        };

        let response = self
            .request(Method::POST, PATH)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::failure("mint", PATH, e))?;

        if !response.status().is_success() {
            return Err(Self::failure("mint", PATH, response.status()));
        }

        let created: TokenCreateResponse = response
            .json()
            .await
            .map_err(|e| Self::failure("mint", PATH, e))?;

        info!(
            "Minted token with policies {:?}, ttl {}s, {} use(s)",
            request.policies, created.auth.lease_duration, request.num_uses
        );

        Ok(IssuedToken {
            token: created.auth.client_token,
            expires_at: Utc::now() + chrono::Duration::seconds(created.auth.lease_duration),
            num_uses: request.num_uses,
        })
    }
}
