//! Packet Provider Adapter
//!
//! Talks to the Packet (Equinix Metal) REST API with the caller's
//! project-level API key:
//! - `GET /project` resolves the key to its project
//! - `GET /devices/{id}` reports state and addresses
//! - `POST /projects/{id}/devices` / `DELETE /devices/{id}`

use crate::domain::model::Provider;
use crate::domain::ports::{DeviceStatus, NetworkInterface, ProviderAdapter, ProvisionSpec};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Packet adapter
#[derive(Debug, Clone)]
pub struct PacketConfig {
    pub api_url: String,
    /// First-boot script sent as device user data
    pub user_data_path: Option<PathBuf>,
    pub billing_cycle: String,
    pub request_timeout_secs: u64,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.packet.net".to_string(),
            user_data_path: None,
            billing_cycle: "hourly".to_string(),
            request_timeout_secs: 30,
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct Project {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct Device {
    id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    ip_addresses: Vec<IpAddress>,
}

#[derive(Debug, Deserialize)]
struct IpAddress {
    address: String,
    #[serde(default)]
    management: bool,
    #[serde(default)]
    public: bool,
}

#[derive(Debug, Serialize)]
struct DeviceCreate<'a> {
    hostname: &'a str,
    facility: &'a str,
    plan: &'a str,
    operating_system: &'a str,
    billing_cycle: &'a str,
    userdata: &'a str,
    customdata: &'a serde_json::Value,
}

// =============================================================================
// Packet Provider
// =============================================================================

/// Adapter for the Packet API
pub struct PacketProvider {
    config: PacketConfig,
    http: reqwest::Client,
}

impl PacketProvider {
    pub fn new(config: PacketConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Configuration(format!("Packet HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    fn request(&self, method: Method, path: &str, credential: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), path);
        self.http
            .request(method, url)
            .header("X-Auth-Token", credential)
            .header("Accept", "application/json")
    }

    fn upstream(operation: &str, reason: impl ToString) -> Error {
        Error::UpstreamProvider {
            provider: Provider::Packet.to_string(),
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn check(operation: &str, response: Response) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(Self::upstream(operation, format!("{}: {}", status, body.trim())))
    }

    async fn user_data(&self) -> Result<String> {
        match &self.config.user_data_path {
            Some(path) => Ok(tokio::fs::read_to_string(path).await?),
            None => Ok(String::new()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for PacketProvider {
    fn provider(&self) -> Provider {
        Provider::Packet
    }

    async fn identity_of(&self, credential: &str) -> Result<String> {
        let response = self
            .request(Method::GET, "project", credential)
            .send()
            .await
            .map_err(|e| Self::upstream("identity", e))?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(Error::InvalidCredential);
        }

        let project: Project = Self::check("identity", response)
            .await?
            .json()
            .await
            .map_err(|e| Self::upstream("identity", e))?;

        if project.id.is_empty() {
            return Err(Error::InvalidCredential);
        }
        Ok(project.id)
    }

    async fn device_status(&self, device: &str, credential: &str) -> Result<DeviceStatus> {
        if device.is_empty() {
            return Err(Self::upstream("device_status", "instance has no device"));
        }

        let response = self
            .request(
                Method::GET,
                &format!("devices/{}", urlencoding::encode(device)),
                credential,
            )
            .send()
            .await
            .map_err(|e| Self::upstream("device_status", e))?;

        let device: Device = Self::check("device_status", response)
            .await?
            .json()
            .await
            .map_err(|e| Self::upstream("device_status", e))?;

        debug!("Device {} is {}", device.id, device.state);

        Ok(DeviceStatus {
            id: device.id,
            status: device.state,
            interfaces: device
                .ip_addresses
                .into_iter()
                .map(|ip| NetworkInterface {
                    address: ip.address,
                    management: ip.management,
                    public: ip.public,
                })
                .collect(),
        })
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<String> {
        let userdata = self.user_data().await?;
        let body = DeviceCreate {
            hostname: &spec.hostname,
            facility: &spec.region,
            plan: &spec.plan,
            operating_system: &spec.operating_system,
            billing_cycle: &self.config.billing_cycle,
            userdata: &userdata,
            customdata: &spec.custom_data,
        };

        let response = self
            .request(
                Method::POST,
                &format!("projects/{}/devices", urlencoding::encode(&spec.owner)),
                &spec.credential,
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::upstream("provision", e))?;

        let device: Device = Self::check("provision", response)
            .await?
            .json()
            .await
            .map_err(|e| Self::upstream("provision", e))?;

        info!(
            "Provisioned Packet device {} for instance {}",
            device.id, spec.instance_id
        );
        Ok(device.id)
    }

    async fn deprovision(&self, device: &str, credential: &str) -> Result<()> {
        let response = self
            .request(
                Method::DELETE,
                &format!("devices/{}", urlencoding::encode(device)),
                credential,
            )
            .send()
            .await
            .map_err(|e| Self::upstream("deprovision", e))?;

        Self::check("deprovision", response).await?;
        info!("Deprovisioned Packet device {}", device);
        Ok(())
    }
}
