use async_trait::async_trait;
use time::OffsetDateTime;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Distinguished sentinel for single-row lookups that found nothing.
    #[error("record not found")]
    NotFound,
    #[error("unique constraint violated")]
    Conflict,
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict)
    }
}

/// Derived lifecycle state of an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeyStatus {
    Active,
    Expired,
    Revoked,
}

impl ApiKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyStatus::Active => "active",
            ApiKeyStatus::Expired => "expired",
            ApiKeyStatus::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for ApiKeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub access_key: String,
    pub secret_hash: String,
    pub secret_ciphertext: String,
    pub description: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
    pub rotation_of: Option<i64>,
}

impl ApiKeyRecord {
    /// Revocation wins over expiry; everything else is active.
    pub fn status(&self, now: OffsetDateTime) -> ApiKeyStatus {
        if self.revoked_at.is_some() {
            return ApiKeyStatus::Revoked;
        }
        match self.expires_at {
            Some(expires_at) if expires_at <= now => ApiKeyStatus::Expired,
            _ => ApiKeyStatus::Active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub access_key: String,
    pub secret_hash: String,
    pub secret_ciphertext: String,
    pub description: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub rotation_of: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct DownstreamRequestRecord {
    pub request_id: String,
    pub api_key_id: Option<i64>,
    pub action: String,
    pub request_method: String,
    pub request_path: String,
    pub request_query: Option<String>,
    pub request_headers_json: serde_json::Value,
    pub request_body: Option<Vec<u8>>,
    pub client_ip: Option<String>,
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct UpstreamAttemptRecord {
    pub request_id: String,
    pub attempt_number: i32,
    pub upstream_action: String,
    pub request_headers_json: serde_json::Value,
    pub request_body: Option<Vec<u8>>,
    pub response_status: Option<i32>,
    pub response_headers_json: serde_json::Value,
    pub response_body: Option<Vec<u8>>,
    pub latency_ms: i64,
    pub error: Option<String>,
    pub sent_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct AuditEventRecord {
    pub request_id: String,
    pub event_type: String,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub metadata_json: serde_json::Value,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub id: i64,
    pub idempotency_key: String,
    pub request_hash: String,
    pub response_status: i32,
    pub response_body: Vec<u8>,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// Repository contract shared by the SQLite and Postgres back-ends.
///
/// Both back-ends behave identically; [`StorageError::NotFound`] is the
/// distinguished sentinel for single-row lookups.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync plus secondary indexes. Run at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    // API keys
    async fn insert_api_key(&self, input: NewApiKey) -> StorageResult<ApiKeyRecord>;
    async fn api_key_by_id(&self, id: i64) -> StorageResult<ApiKeyRecord>;
    async fn api_key_by_access_key(&self, access_key: &str) -> StorageResult<ApiKeyRecord>;
    async fn list_api_keys(&self) -> StorageResult<Vec<ApiKeyRecord>>;
    async fn revoke_api_key(&self, id: i64, at: OffsetDateTime) -> StorageResult<()>;
    async fn set_api_key_expiry(
        &self,
        id: i64,
        expires_at: Option<OffsetDateTime>,
    ) -> StorageResult<()>;

    // Audit trail
    async fn insert_downstream_request(
        &self,
        record: DownstreamRequestRecord,
    ) -> StorageResult<i64>;
    async fn insert_upstream_attempt(&self, record: UpstreamAttemptRecord) -> StorageResult<i64>;
    async fn list_upstream_attempts(
        &self,
        request_id: &str,
    ) -> StorageResult<Vec<UpstreamAttemptRecord>>;
    async fn insert_audit_event(&self, record: AuditEventRecord) -> StorageResult<i64>;
    async fn list_audit_events(&self, request_id: &str) -> StorageResult<Vec<AuditEventRecord>>;

    // Idempotency
    async fn idempotency_find(&self, key: &str) -> StorageResult<IdempotencyRecord>;
    async fn idempotency_insert(
        &self,
        key: &str,
        request_hash: &str,
        response_status: i32,
        response_body: &[u8],
        created_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> StorageResult<i64>;
    async fn idempotency_sweep_expired(&self, now: OffsetDateTime) -> StorageResult<u64>;
}
