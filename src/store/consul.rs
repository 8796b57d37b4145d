//! Consul Key-Value Adapter
//!
//! Provides the entity store backend and per-instance ACL tokens via the
//! Consul HTTP API:
//! - `GET /v1/kv/<prefix>?recurse` and `?keys&separator=` for reads
//! - `PUT /v1/txn` for atomic writes
//! - `/v1/acl/token(s)` for access-control entries

use crate::domain::ports::{AccessControl, KvPair, KvStore, TxnOp};
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Description prefix marking ACL tokens owned by an instance
const ACL_DESCRIPTION_PREFIX: &str = "fleet-instance:";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Consul adapter
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// HTTP address of the Consul agent
    pub address: String,
    /// ACL token used by the control plane itself
    pub token: Option<String>,
    /// Datacenter to address (agent default if unset)
    pub datacenter: Option<String>,
    /// Operations accepted per transaction by the server
    pub max_txn_ops: usize,
    /// Policies attached to instance tokens
    pub instance_policies: Vec<String>,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            datacenter: None,
            max_txn_ops: 64,
            instance_policies: vec!["fleet-instance".to_string()],
            request_timeout_secs: 10,
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Thin HTTP client shared by the KV and ACL adapters
pub struct ConsulClient {
    config: ConsulConfig,
    http: reqwest::Client,
}

impl ConsulClient {
    pub fn new(config: ConsulConfig) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Configuration(format!("Consul HTTP client: {}", e)))?;
        Ok(Arc::new(Self { config, http }))
    }

    pub fn config(&self) -> &ConsulConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/v1/{}", self.config.address.trim_end_matches('/'), path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.config.token {
            builder = builder.header("X-Consul-Token", token);
        }
        if let Some(dc) = &self.config.datacenter {
            builder = builder.query(&[("dc", dc)]);
        }
        builder
    }
}

/// Percent-encode each segment of a key for use in a URL path
fn key_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn unavailable(e: reqwest::Error) -> Error {
    Error::StoreUnavailable(e.to_string())
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    value: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TxnKvOp {
    verb: &'static str,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Debug, Serialize)]
struct TxnEnvelope {
    #[serde(rename = "KV")]
    kv: TxnKvOp,
}

impl From<TxnOp> for TxnEnvelope {
    fn from(op: TxnOp) -> Self {
        let kv = match op {
            TxnOp::Set { key, value } => TxnKvOp {
                verb: "set",
                key,
                value: Some(BASE64.encode(value)),
            },
            TxnOp::Delete { key } => TxnKvOp {
                verb: "delete",
                key,
                value: None,
            },
            TxnOp::DeleteTree { prefix } => TxnKvOp {
                verb: "delete-tree",
                key: prefix,
                value: None,
            },
        };
        TxnEnvelope { kv }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TxnErrors {
    #[serde(default)]
    errors: Option<Vec<TxnError>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TxnError {
    op_index: usize,
    what: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AclTokenCreate {
    description: String,
    policies: Vec<AclPolicyLink>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AclPolicyLink {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AclToken {
    #[serde(rename = "AccessorID")]
    accessor_id: String,
    #[serde(rename = "SecretID", default)]
    secret_id: String,
    #[serde(rename = "Description", default)]
    description: String,
}

// =============================================================================
// KV Store
// =============================================================================

/// Entity store backend on Consul KV
pub struct ConsulKvStore {
    client: Arc<ConsulClient>,
}

impl ConsulKvStore {
    pub fn new(client: Arc<ConsulClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KvStore for ConsulKvStore {
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let response = self
            .client
            .request(Method::GET, &format!("kv/{}", key_path(prefix)))
            .query(&[("recurse", "true")])
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::StoreUnavailable(format!(
                "list {} returned {}",
                prefix,
                response.status()
            )));
        }

        let entries: Vec<KvEntry> = response.json().await.map_err(unavailable)?;
        entries
            .into_iter()
            .map(|entry| {
                let value = match entry.value {
                    Some(encoded) => BASE64
                        .decode(encoded)
                        .map_err(|e| Error::decode(&entry.key, format!("bad base64: {}", e)))?,
                    None => Vec::new(),
                };
                Ok(KvPair::new(entry.key, value))
            })
            .collect()
    }

    async fn keys(&self, prefix: &str, separator: char) -> Result<Vec<String>> {
        let separator = separator.to_string();
        let response = self
            .client
            .request(Method::GET, &format!("kv/{}", key_path(prefix)))
            .query(&[("keys", "true"), ("separator", separator.as_str())])
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::StoreUnavailable(format!(
                "keys {} returned {}",
                prefix,
                response.status()
            )));
        }

        response.json().await.map_err(unavailable)
    }

    async fn transact(&self, ops: Vec<TxnOp>) -> Result<()> {
        let count = ops.len();
        let body: Vec<TxnEnvelope> = ops.into_iter().map(TxnEnvelope::from).collect();

        let response = self
            .client
            .request(Method::PUT, "txn")
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if status.is_success() {
            debug!("Consul transaction of {} operations committed", count);
            return Ok(());
        }
        if status.is_server_error() {
            return Err(Error::StoreUnavailable(format!("txn returned {}", status)));
        }

        // 409 carries per-operation errors; anything else is a rejection too
        let errors = response.json::<TxnErrors>().await.unwrap_or_default();
        let reason = errors
            .errors
            .unwrap_or_default()
            .into_iter()
            .map(|e| format!("op {}: {}", e.op_index, e.what))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::TransactionFailed(if reason.is_empty() {
            format!("txn returned {}", status)
        } else {
            reason
        }))
    }

    fn max_txn_ops(&self) -> usize {
        self.client.config.max_txn_ops
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .request(Method::GET, "status/leader")
            .send()
            .await
            .map_err(unavailable)?;
        Ok(response.status().is_success())
    }
}

// =============================================================================
// ACL Tokens
// =============================================================================

/// Per-instance Consul ACL tokens
pub struct ConsulAcl {
    client: Arc<ConsulClient>,
}

impl ConsulAcl {
    pub fn new(client: Arc<ConsulClient>) -> Self {
        Self { client }
    }

    fn description(instance_id: &str) -> String {
        format!("{}{}", ACL_DESCRIPTION_PREFIX, instance_id)
    }

    fn acl_error(e: reqwest::Error) -> Error {
        Error::AccessControl(e.to_string())
    }
}

#[async_trait]
impl AccessControl for ConsulAcl {
    async fn issue(&self, instance_id: &str) -> Result<String> {
        let body = AclTokenCreate {
            description: Self::description(instance_id),
            policies: self
                .client
                .config
                .instance_policies
                .iter()
                .map(|name| AclPolicyLink { name: name.clone() })
                .collect(),
        };

        let response = self
            .client
            .request(Method::PUT, "acl/token")
            .json(&body)
            .send()
            .await
            .map_err(Self::acl_error)?;

        if !response.status().is_success() {
            return Err(Error::AccessControl(format!(
                "token create returned {}",
                response.status()
            )));
        }

        let token: AclToken = response.json().await.map_err(Self::acl_error)?;
        info!(
            "Issued ACL token {} for instance {}",
            token.accessor_id, instance_id
        );
        Ok(token.secret_id)
    }

    async fn revoke(&self, instance_id: &str) -> Result<()> {
        let response = self
            .client
            .request(Method::GET, "acl/tokens")
            .send()
            .await
            .map_err(Self::acl_error)?;

        if !response.status().is_success() {
            return Err(Error::AccessControl(format!(
                "token list returned {}",
                response.status()
            )));
        }

        let description = Self::description(instance_id);
        let tokens: Vec<AclToken> = response.json().await.map_err(Self::acl_error)?;
        let owned: Vec<AclToken> = tokens
            .into_iter()
            .filter(|t| t.description == description)
            .collect();

        if owned.is_empty() {
            warn!("No ACL token found for instance {}", instance_id);
        }

        for token in owned {
            let response = self
                .client
                .request(Method::DELETE, &format!("acl/token/{}", token.accessor_id))
                .send()
                .await
                .map_err(Self::acl_error)?;
            if !response.status().is_success() {
                return Err(Error::AccessControl(format!(
                    "token delete {} returned {}",
                    token.accessor_id,
                    response.status()
                )));
            }
            info!(
                "Revoked ACL token {} for instance {}",
                token.accessor_id, instance_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> Arc<ConsulClient> {
        ConsulClient::new(ConsulConfig {
            address: server.uri(),
            token: Some("root-token".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_key_path_escapes_segments() {
        assert_eq!(key_path("instances/a/"), "instances/a/");
        assert_eq!(
            key_path("instances/a/services/web/a%2Fb"),
            "instances/a/services/web/a%252Fb"
        );
    }

    #[test]
    fn test_txn_envelope_encoding() {
        let ops = vec![
            TxnOp::delete_tree("instances/a/services/web/"),
            TxnOp::set("instances/a/services/web/port", "80"),
        ];
        let body: Vec<TxnEnvelope> = ops.into_iter().map(TxnEnvelope::from).collect();
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!([
                {"KV": {"Verb": "delete-tree", "Key": "instances/a/services/web/"}},
                {"KV": {"Verb": "set", "Key": "instances/a/services/web/port", "Value": "ODA="}},
            ])
        );
    }

    #[tokio::test]
    async fn test_list_decodes_values() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/instances/a/"))
            .and(query_param("recurse", "true"))
            .and(header("X-Consul-Token", "root-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Key": "instances/a/owner", "Value": "cHJvai0x"},
                {"Key": "instances/a/device", "Value": null},
            ])))
            .mount(&server)
            .await;

        let store = ConsulKvStore::new(client_for(&server));
        let pairs = store.list("instances/a/").await.unwrap();

        assert_eq!(pairs[0], KvPair::new("instances/a/owner", b"proj-1".to_vec()));
        assert_eq!(pairs[1], KvPair::new("instances/a/device", Vec::new()));
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = ConsulKvStore::new(client_for(&server));
        assert!(store.list("instances/none/").await.unwrap().is_empty());
        assert!(store.keys("instances/", '/').await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transact_conflict_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/txn"))
            .and(body_json(json!([
                {"KV": {"Verb": "delete", "Key": "applications/x/instances/i"}}
            ])))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "Results": null,
                "Errors": [{"OpIndex": 0, "What": "permission denied"}]
            })))
            .mount(&server)
            .await;

        let store = ConsulKvStore::new(client_for(&server));
        let result = store
            .transact(vec![TxnOp::delete("applications/x/instances/i")])
            .await;
        assert_matches!(result, Err(Error::TransactionFailed(reason)) if reason.contains("permission denied"));
    }

    #[tokio::test]
    async fn test_transact_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/txn"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = ConsulKvStore::new(client_for(&server));
        let result = store.transact(vec![TxnOp::set("a/b/c", "1")]).await;
        assert_matches!(result, Err(Error::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_acl_revoke_deletes_matching_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/acl/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"AccessorID": "acc-1", "Description": "fleet-instance:i-1"},
                {"AccessorID": "acc-2", "Description": "fleet-instance:i-2"},
            ])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/acl/token/acc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .expect(1)
            .mount(&server)
            .await;

        let acl = ConsulAcl::new(client_for(&server));
        acl.revoke("i-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_acl_issue_returns_secret() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/acl/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "AccessorID": "acc-9",
                "SecretID": "secret-9",
                "Description": "fleet-instance:i-9"
            })))
            .mount(&server)
            .await;

        let acl = ConsulAcl::new(client_for(&server));
        assert_eq!(acl.issue("i-9").await.unwrap(), "secret-9");
    }
}
