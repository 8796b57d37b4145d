//! Resource Directory
//!
//! Per-kind managers enforcing domain rules on top of the entity store.
//! Every mutation of a resource runs under that resource's lock in
//! [`ResourceLocks`], so check-then-write sequences are serialized within
//! this process.

pub mod application;
pub mod instance;
pub mod locks;
mod services;

pub use application::ApplicationManager;
pub use instance::{InstanceManager, BOOTSTRAP_TOKEN_KEY};
pub use locks::ResourceLocks;

use crate::error::Error;
use serde::Serialize;

/// A side-effect cleanup step that failed after a destroy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub step: String,
    pub reason: String,
}

impl CleanupFailure {
    pub fn new(step: &str, error: &Error) -> Self {
        Self {
            step: step.to_string(),
            reason: error.to_string(),
        }
    }
}

/// Outcome of destroying an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestroyReport {
    pub instance_id: String,
    pub cleanup_failures: Vec<CleanupFailure>,
}

impl DestroyReport {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            cleanup_failures: Vec::new(),
        }
    }

    /// Every side effect was undone
    pub fn is_clean(&self) -> bool {
        self.cleanup_failures.is_empty()
    }
}
