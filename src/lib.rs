//! Fleet Core - Control Plane for Bare-Metal Instances
//!
//! Tracks instances, applications and the services installed on them in a
//! transactional key-value store, and lets freshly provisioned devices prove
//! where they are before receiving credentials.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                REST API               Bootstrap endpoint              │
//! │             (controlplane)               (bootstrap)                  │
//! ├───────────────────┬──────────────────────────┬───────────────────────┤
//! │   Orchestrator    │   Authorization Guard    │  Provider Adapters    │
//! │                   │          (auth)          │  (Packet, simulated)  │
//! ├───────────────────┴──────────────────────────┴───────────────────────┤
//! │         Resource Directory (instances, applications, services)       │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Entity Store + keyspace codec  │  Secret Store  │  Access Control    │
//! │       (Consul KV / memory)      │ (Vault/memory) │ (Consul ACL/memory)│
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: orchestrator, REST API and server
//! - [`bootstrap`]: device trust handshake
//! - [`auth`]: authorization guard
//! - [`directory`]: per-kind resource managers
//! - [`store`]: entity store, keyspace codec and KV backends
//! - [`secrets`]: secret store backends
//! - [`provider`]: compute provider adapters
//! - [`domain`]: resource model and ports
//! - [`error`]: error types and handling

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod controlplane;
pub mod directory;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod secrets;
pub mod store;

// Re-export commonly used types
pub use auth::{AuthorizationGuard, GuardConfig, Principal};

pub use bootstrap::{BootstrapConfig, BootstrapPayload, BootstrapResponse, BootstrapService};

pub use config::{ControlPlane, ControlPlaneConfig};

pub use controlplane::{
    ApiServer, ApiServerConfig, BackendConfig, BackendFactory, BackendMode, Collaborators,
    CreateInstanceRequest, Orchestrator, OrchestratorConfig,
};

pub use directory::{ApplicationManager, CleanupFailure, DestroyReport, InstanceManager};

pub use domain::model::{Application, Credential, Instance, Provider, Service};

pub use domain::ports::{
    AccessControl, DeviceStatus, KvStore, ProviderAdapter, ProvisionSpec, SecretStore, TxnOp,
};

pub use error::{ClientStatus, Error, Result};

pub use metrics::ControlPlaneMetrics;

pub use provider::{PacketProvider, ProviderRegistry, SimulatedProvider};

pub use store::{ConsulKvStore, EntityStore, MemoryKvStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
