//! Simulated Provider
//!
//! Accounts and devices kept in memory. Serves the `PACKET` variant in
//! standalone mode so the whole control plane runs without a cloud account.

use crate::domain::model::Provider;
use crate::domain::ports::{DeviceStatus, NetworkInterface, ProviderAdapter, ProvisionSpec};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::info;

#[derive(Debug, Clone)]
struct SimDevice {
    owner: String,
    status: DeviceStatus,
    custom_data: serde_json::Value,
}

/// In-memory stand-in for a compute provider
pub struct SimulatedProvider {
    provider: Provider,
    /// credential -> account identity
    accounts: DashMap<String, String>,
    devices: DashMap<String, SimDevice>,
    next_host: AtomicU32,
    initial_status: parking_lot::RwLock<String>,
    fail_provision: AtomicBool,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self {
            provider: Provider::Packet,
            accounts: DashMap::new(),
            devices: DashMap::new(),
            next_host: AtomicU32::new(1),
            initial_status: parking_lot::RwLock::new("active".to_string()),
            fail_provision: AtomicBool::new(false),
        }
    }

    pub fn with_account(self, credential: impl Into<String>, identity: impl Into<String>) -> Self {
        self.add_account(credential, identity);
        self
    }

    pub fn add_account(&self, credential: impl Into<String>, identity: impl Into<String>) {
        self.accounts.insert(credential.into(), identity.into());
    }

    /// Status new devices start in
    pub fn set_initial_status(&self, status: impl Into<String>) {
        *self.initial_status.write() = status.into();
    }

    pub fn set_fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::Relaxed);
    }

    pub fn set_device_status(&self, device: &str, status: impl Into<String>) -> Result<()> {
        let mut entry = self
            .devices
            .get_mut(device)
            .ok_or_else(|| Error::not_found("device", device))?;
        entry.status.status = status.into();
        Ok(())
    }

    /// Replace a device's addresses with a single management interface
    pub fn set_management_address(&self, device: &str, address: impl Into<String>) -> Result<()> {
        let mut entry = self
            .devices
            .get_mut(device)
            .ok_or_else(|| Error::not_found("device", device))?;
        entry.status.interfaces = vec![NetworkInterface {
            address: address.into(),
            management: true,
            public: false,
        }];
        Ok(())
    }

    pub fn has_device(&self, device: &str) -> bool {
        self.devices.contains_key(device)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Custom data the device was provisioned with
    pub fn custom_data(&self, device: &str) -> Option<serde_json::Value> {
        self.devices.get(device).map(|d| d.custom_data.clone())
    }

    fn identity(&self, credential: &str) -> Result<String> {
        self.accounts
            .get(credential)
            .map(|identity| identity.value().clone())
            .ok_or(Error::InvalidCredential)
    }

    fn upstream(&self, operation: &str, reason: impl Into<String>) -> Error {
        Error::UpstreamProvider {
            provider: self.provider.to_string(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for SimulatedProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn identity_of(&self, credential: &str) -> Result<String> {
        self.identity(credential)
    }

    async fn device_status(&self, device: &str, credential: &str) -> Result<DeviceStatus> {
        let identity = self
            .identity(credential)
            .map_err(|_| self.upstream("device_status", "credential rejected"))?;
        match self.devices.get(device) {
            Some(entry) if entry.owner == identity => Ok(entry.status.clone()),
            _ => Err(self.upstream("device_status", format!("device {:?} not found", device))),
        }
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<String> {
        if self.fail_provision.load(Ordering::Relaxed) {
            return Err(self.upstream("provision", "capacity unavailable"));
        }
        let identity = self.identity(&spec.credential)?;
        if identity != spec.owner {
            return Err(self.upstream("provision", "project does not belong to credential"));
        }

        let host = self.next_host.fetch_add(1, Ordering::Relaxed);
        let device = uuid::Uuid::new_v4().to_string();
        self.devices.insert(
            device.clone(),
            SimDevice {
                owner: identity,
                status: DeviceStatus {
                    id: device.clone(),
                    status: self.initial_status.read().clone(),
                    interfaces: vec![NetworkInterface {
                        address: format!("10.0.{}.{}", host / 250, host % 250 + 1),
                        management: true,
                        public: false,
                    }],
                },
                custom_data: spec.custom_data.clone(),
            },
        );

        info!(
            "Simulated device {} ({}) for instance {}",
            device, spec.hostname, spec.instance_id
        );
        Ok(device)
    }

    async fn deprovision(&self, device: &str, credential: &str) -> Result<()> {
        let identity = self
            .identity(credential)
            .map_err(|_| self.upstream("deprovision", "credential rejected"))?;
        let owned = self
            .devices
            .get(device)
            .map(|entry| entry.owner == identity)
            .unwrap_or(false);
        if !owned {
            return Err(self.upstream("deprovision", format!("device {:?} not found", device)));
        }
        self.devices.remove(device);
        Ok(())
    }
}
