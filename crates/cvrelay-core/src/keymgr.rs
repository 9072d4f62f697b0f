use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use time::OffsetDateTime;

use cvrelay_storage::{ApiKeyRecord, NewApiKey, Storage};

use crate::admission::KeyLockTable;
use crate::error::RelayError;
use crate::secrets::SecretBox;

const BCRYPT_COST: u32 = 12;
const ACCESS_KEY_BYTES: usize = 10;
const SECRET_KEY_BYTES: usize = 32;

/// A freshly created key. The plaintext secret is released here exactly
/// once and never persisted.
#[derive(Debug, Clone)]
pub struct CreatedKey {
    pub record: ApiKeyRecord,
    pub secret: String,
}

/// Create / rotate / revoke lifecycle for tenant credentials.
pub struct KeyManager {
    storage: Arc<dyn Storage>,
    secrets: SecretBox,
    /// Serializes concurrent manager operations on the same key id.
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    key_locks: Option<KeyLockTable>,
}

impl KeyManager {
    pub fn new(storage: Arc<dyn Storage>, secrets: SecretBox) -> Self {
        Self {
            storage,
            secrets,
            locks: Mutex::new(HashMap::new()),
            key_locks: None,
        }
    }

    /// Wire the admission table so in-process revocations take effect
    /// immediately, without waiting for the next auth round-trip.
    pub fn with_key_locks(mut self, table: KeyLockTable) -> Self {
        self.key_locks = Some(table);
        self
    }

    pub async fn create(
        &self,
        description: Option<String>,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<CreatedKey, RelayError> {
        self.create_inner(description, expires_at, None).await
    }

    pub async fn list(&self) -> Result<Vec<ApiKeyRecord>, RelayError> {
        Ok(self.storage.list_api_keys().await?)
    }

    pub async fn revoke(&self, id: i64) -> Result<ApiKeyRecord, RelayError> {
        let _guard = self.op_lock(id).await;
        self.revoke_inner(id).await
    }

    /// Rotate `id`: create a replacement key, then retire the old one.
    ///
    /// With a zero grace period the old key is revoked immediately after
    /// the new one exists; the two steps are not transactional, so a
    /// failed revocation leaves the old key active and surfaces the error.
    /// A non-zero grace period instead moves the old key's expiry to
    /// `now + grace`, keeping both keys valid inside the window.
    pub async fn rotate(
        &self,
        id: i64,
        description: Option<String>,
        new_expires_at: Option<OffsetDateTime>,
        grace_period: Duration,
    ) -> Result<CreatedKey, RelayError> {
        let _guard = self.op_lock(id).await;

        let old = self.storage.api_key_by_id(id).await?;
        let description = description.or(old.description.clone());
        let created = self
            .create_inner(description, new_expires_at, Some(old.id))
            .await?;

        if grace_period.is_zero() {
            self.revoke_inner(old.id).await?;
        } else {
            let window_end = OffsetDateTime::now_utc() + grace_period;
            self.storage
                .set_api_key_expiry(old.id, Some(window_end))
                .await?;
        }

        Ok(created)
    }

    async fn create_inner(
        &self,
        description: Option<String>,
        expires_at: Option<OffsetDateTime>,
        rotation_of: Option<i64>,
    ) -> Result<CreatedKey, RelayError> {
        let access_key = generate_access_key();
        let secret = generate_secret();

        let secret_hash = bcrypt::hash(&secret, BCRYPT_COST)
            .map_err(|err| RelayError::internal("bcrypt hashing failed").with_source(err))?;
        let secret_ciphertext = self
            .secrets
            .encrypt(secret.as_bytes())
            .map_err(|err| RelayError::internal("secret encryption failed").with_source(err))?;

        let record = self
            .storage
            .insert_api_key(NewApiKey {
                access_key,
                secret_hash,
                secret_ciphertext,
                description,
                expires_at,
                rotation_of,
            })
            .await?;

        Ok(CreatedKey { record, secret })
    }

    async fn revoke_inner(&self, id: i64) -> Result<ApiKeyRecord, RelayError> {
        self.storage
            .revoke_api_key(id, OffsetDateTime::now_utc())
            .await?;
        if let Some(table) = &self.key_locks {
            table.mark_revoked(id);
        }
        Ok(self.storage.api_key_by_id(id).await?)
    }

    async fn op_lock(&self, id: i64) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("key manager lock table poisoned");
            locks
                .entry(id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

fn generate_access_key() -> String {
    let mut bytes = [0u8; ACCESS_KEY_BYTES];
    rand::rng().fill(&mut bytes[..]);
    let mut out = String::with_capacity(2 + ACCESS_KEY_BYTES * 2);
    out.push_str("ak");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_KEY_BYTES];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}
