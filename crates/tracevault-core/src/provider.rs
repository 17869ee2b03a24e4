use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::ProviderError;
use crate::model::Tier;

/// Uniform capability surface over a concrete storage backend.
///
/// Implementations must be safe to call concurrently. Names must not contain
/// `:` since they form the first half of an [`ObjectUri`](crate::model::ObjectUri).
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn name(&self) -> &str;

    fn supported_tiers(&self) -> &[Tier];

    fn supports_tier(&self, tier: Tier) -> bool {
        self.supported_tiers().contains(&tier)
    }

    /// Whether this backend keeps an independently verifiable copy.
    fn supports_replica(&self) -> bool;

    /// Cost per GB per day for the given tier.
    fn get_cost(&self, tier: Tier) -> f64;

    /// Store an object and return its backend-local id.
    async fn store(&self, data: &[u8], tier: Tier) -> Result<String, ProviderError>;

    async fn retrieve(&self, object_id: &str) -> Result<Vec<u8>, ProviderError>;

    /// Hex SHA-256 of the object as the backend currently holds it.
    async fn get_object_hash(&self, object_id: &str) -> Result<String, ProviderError>;

    async fn delete(&self, object_id: &str) -> Result<(), ProviderError>;
}

/// Collision-resistant content hash used across providers and the verifier.
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_digest_is_sha256_hex() {
        assert_eq!(
            content_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
