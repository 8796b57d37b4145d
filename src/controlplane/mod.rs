//! Control Plane
//!
//! The orchestrator behind the upward surface: every call passes the
//! authorization guard, then the resource directory, then any provider side
//! effects. The API layer exposes it over REST next to the bootstrap endpoint.

pub mod api;
pub mod backends;
pub mod orchestrator;

pub use api::*;
pub use backends::{BackendConfig, BackendFactory, BackendMode};
pub use orchestrator::{Collaborators, CreateInstanceRequest, Orchestrator, OrchestratorConfig};
