use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use cvrelay_storage::{IdempotencyRecord, Storage, StorageError};

use crate::error::RelayError;

/// Outcome of consulting the idempotency store for a submission.
#[derive(Debug)]
pub enum Resolution {
    /// A prior response exists; return it verbatim.
    Replay(IdempotencyRecord),
    /// First time this key is seen.
    FirstSeen,
}

/// Lookup and store are separate calls: the lookup/dispatch/store sequence
/// is not transactional, and a lookup that races a concurrent creation
/// tolerates the duplicate dispatch. The unique index on the key keeps the
/// store single-rowed.
pub struct IdempotencyResolver {
    storage: Arc<dyn Storage>,
    ttl: Duration,
}

impl IdempotencyResolver {
    pub fn new(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    /// Fingerprint of the submission body, tying a key to one request.
    pub fn request_hash(body: &[u8]) -> String {
        let digest = Sha256::digest(body);
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    pub async fn resolve(
        &self,
        key: &str,
        request_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Resolution, RelayError> {
        match self.storage.idempotency_find(key).await {
            Ok(record) => {
                if record.expires_at <= now {
                    return Err(RelayError::validation(
                        "idempotency key has expired; use a new key",
                    ));
                }
                if record.request_hash != request_hash {
                    return Err(RelayError::validation(
                        "idempotency key was already used for a different request",
                    ));
                }
                Ok(Resolution::Replay(record))
            }
            Err(StorageError::NotFound) => Ok(Resolution::FirstSeen),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn store(
        &self,
        key: &str,
        request_hash: &str,
        response_status: u16,
        response_body: &[u8],
        now: OffsetDateTime,
    ) -> Result<(), RelayError> {
        let expires_at = now + self.ttl;
        match self
            .storage
            .idempotency_insert(
                key,
                request_hash,
                i32::from(response_status),
                response_body,
                now,
                expires_at,
            )
            .await
        {
            Ok(_) => Ok(()),
            // A concurrent first-seen won the insert; its row stands.
            Err(StorageError::Conflict) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn sweep(&self, now: OffsetDateTime) -> Result<u64, RelayError> {
        Ok(self.storage.idempotency_sweep_expired(now).await?)
    }
}
