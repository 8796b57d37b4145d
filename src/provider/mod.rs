//! Provider Capability Adapters
//!
//! One [`ProviderAdapter`] per compute backend, looked up by the entity's
//! [`Provider`] variant.
//!
//! - [`PacketProvider`]: Packet / Equinix Metal REST API
//! - [`SimulatedProvider`]: in-memory accounts and devices

pub mod packet;
pub mod simulated;

pub use packet::{PacketConfig, PacketProvider};
pub use simulated::SimulatedProvider;

use crate::domain::model::Provider;
use crate::domain::ports::ProviderAdapterRef;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::info;

/// Adapters keyed by provider variant
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<Provider, ProviderAdapterRef>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under the variant it reports
    pub fn register(&mut self, adapter: ProviderAdapterRef) {
        let provider = adapter.provider();
        info!("Registered provider adapter: {}", provider);
        self.adapters.insert(provider, adapter);
    }

    pub fn with(mut self, adapter: ProviderAdapterRef) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<ProviderAdapterRef> {
        self.adapters.get(&provider).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!("provider {} is not configured", provider))
        })
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.adapters.keys().copied().collect()
    }
}
