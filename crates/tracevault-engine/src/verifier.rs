//! Cross-replica hash comparison for a single key.

use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tracevault_core::model::ObjectUri;
use tracevault_core::provider::content_digest;
use tracing::{debug, warn};

use crate::context::StorageContext;
use crate::error::{RegistryError, VerifyError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum IntegrityVerdict {
    /// Every checked replica matches the primary.
    Consistent { replicas: usize },
    Inconsistent { mismatched: Vec<ObjectUri> },
    /// No active replica-capable provider holds a copy; nothing to compare.
    Skipped,
}

impl IntegrityVerdict {
    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent { .. })
    }
}

pub struct ConsistencyVerifier {
    ctx: Arc<StorageContext>,
}

impl ConsistencyVerifier {
    pub fn new(ctx: Arc<StorageContext>) -> Self {
        Self { ctx }
    }

    pub async fn verify_integrity(&self, key: &str) -> Result<IntegrityVerdict, VerifyError> {
        let _guard = self.ctx.registry.lock_key(key).await;
        self.verify_locked(key).await
    }

    /// Like [`Self::verify_integrity`], but an inconsistency is an error. The
    /// caller must hold the key's lock.
    pub(crate) async fn ensure_consistent_locked(
        &self,
        key: &str,
    ) -> Result<IntegrityVerdict, VerifyError> {
        match self.verify_locked(key).await? {
            IntegrityVerdict::Inconsistent { mismatched } => Err(VerifyError::InconsistentReplica {
                key: key.to_string(),
                mismatched,
            }),
            verdict => Ok(verdict),
        }
    }

    async fn verify_locked(&self, key: &str) -> Result<IntegrityVerdict, VerifyError> {
        let entry = self
            .ctx
            .registry
            .get(key)
            .ok_or_else(|| RegistryError::UnknownKey(key.to_string()))?;

        let primary = self.ctx.providers.retrieve(&entry.uri).await?;
        let expected = content_digest(&primary);

        let candidates: Vec<&ObjectUri> = entry
            .replicas
            .iter()
            .filter(|uri| self.ctx.providers.is_replica_capable(&uri.provider))
            .collect();
        if candidates.is_empty() {
            debug!(key, "no replica-capable copy to compare");
            return Ok(IntegrityVerdict::Skipped);
        }

        let mut mismatched = Vec::new();
        for uri in &candidates {
            match self.ctx.providers.object_hash(uri).await {
                Ok(hash) if hash == expected => {}
                Ok(_) => mismatched.push((*uri).clone()),
                // A lost replica is as bad as a corrupt one.
                Err(e) if e.is_not_found() => mismatched.push((*uri).clone()),
                Err(e) => return Err(e.into()),
            }
        }

        if !mismatched.is_empty() {
            warn!(key, mismatched = mismatched.len(), "replica mismatch");
            return Ok(IntegrityVerdict::Inconsistent { mismatched });
        }

        let now = SystemTime::now();
        self.ctx.registry.update(key, |e| e.last_verified = Some(now))?;
        Ok(IntegrityVerdict::Consistent {
            replicas: candidates.len(),
        })
    }
}
