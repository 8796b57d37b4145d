//! Secret Store
//!
//! Bootstrap material lives out of band, one path per instance:
//! `secret/bootstrap/<instance id>`. Two backends:
//! - Vault: KV writes and scoped token minting over HTTP
//! - Memory: for standalone mode and tests

pub mod memory;
pub mod vault;

pub use memory::MemorySecretStore;
pub use vault::{VaultConfig, VaultSecretStore};

/// Mount and prefix holding per-instance bootstrap secrets
pub const BOOTSTRAP_SECRET_PREFIX: &str = "secret/bootstrap";

/// Path of an instance's bootstrap secret
pub fn bootstrap_secret_path(instance_id: &str) -> String {
    format!("{}/{}", BOOTSTRAP_SECRET_PREFIX, instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_secret_path() {
        assert_eq!(bootstrap_secret_path("i-1"), "secret/bootstrap/i-1");
    }
}
