use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use time::OffsetDateTime;

use cvrelay_sign::{SignInput, parse_authorization, verify};
use cvrelay_storage::{ApiKeyStatus, Storage, StorageError};

use crate::error::RelayError;
use crate::secrets::SecretBox;

/// The authenticated tenant behind a request.
#[derive(Debug, Clone)]
pub struct ApiKeyIdentity {
    pub id: i64,
    pub access_key: String,
}

/// SigV4 verification middleware.
///
/// Recovers the signing secret by decrypting the stored ciphertext for the
/// claimed access key; a hash/ciphertext mismatch is treated as internal
/// corruption rather than an auth failure.
pub struct Authenticator {
    storage: Arc<dyn Storage>,
    secrets: SecretBox,
    region: String,
    skew: Duration,
}

impl Authenticator {
    pub fn new(storage: Arc<dyn Storage>, secrets: SecretBox, region: String) -> Self {
        Self {
            storage,
            secrets,
            region,
            skew: cvrelay_sign::DEFAULT_SKEW,
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub async fn authenticate(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<ApiKeyIdentity, RelayError> {
        let authorization = header_value(headers, "authorization")
            .ok_or_else(|| RelayError::auth_failed("missing authorization header"))?;
        let x_date = header_value(headers, "x-date")
            .ok_or_else(|| RelayError::auth_failed("missing x-date header"))?;
        let host = header_value(headers, "host")
            .ok_or_else(|| RelayError::auth_failed("missing host header"))?;
        let content_type = header_value(headers, "content-type").unwrap_or_default();

        let parsed = parse_authorization(&authorization)?;

        let record = match self.storage.api_key_by_access_key(&parsed.access_key).await {
            Ok(record) => record,
            Err(StorageError::NotFound) => {
                return Err(RelayError::auth_failed("unknown access key"));
            }
            Err(err) => return Err(err.into()),
        };

        let now = OffsetDateTime::now_utc();
        match record.status(now) {
            ApiKeyStatus::Active => {}
            ApiKeyStatus::Revoked => return Err(RelayError::key_revoked()),
            ApiKeyStatus::Expired => return Err(RelayError::key_expired()),
        }

        let secret = self
            .secrets
            .decrypt(&record.secret_ciphertext)
            .map_err(|err| {
                RelayError::internal("api key secret material is corrupt").with_source(err)
            })?;
        let secret = String::from_utf8(secret)
            .map_err(|err| RelayError::internal("api key secret material is corrupt").with_source(err))?;

        // The hash and the ciphertext must agree on the same plaintext; a
        // divergence means the row was tampered with or mis-written.
        let hash_matches = bcrypt::verify(&secret, &record.secret_hash)
            .map_err(|err| RelayError::internal("api key hash verification failed").with_source(err))?;
        if !hash_matches {
            return Err(RelayError::internal(
                "api key secret hash does not match ciphertext",
            ));
        }

        verify(
            &SignInput {
                method,
                path,
                query,
                host: &host,
                content_type: &content_type,
                payload: body,
            },
            &parsed,
            &x_date,
            &secret,
            &self.region,
            now,
            self.skew,
        )?;

        Ok(ApiKeyIdentity {
            id: record.id,
            access_key: record.access_key,
        })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
