use sea_orm::sea_query::Index;
use sea_orm::{
    ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Schema, SqlErr,
};
use time::OffsetDateTime;

use crate::entities;
use crate::storage::{
    ApiKeyRecord, AuditEventRecord, DownstreamRequestRecord, IdempotencyRecord, NewApiKey, Storage,
    StorageError, StorageResult, UpstreamAttemptRecord,
};

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Required for cascade + integrity on the sqlite backend.
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn ensure_indexes(&self) -> StorageResult<()> {
        use entities::audit_events::Column as AuditColumn;
        use entities::downstream_requests::Column as DownstreamColumn;
        use entities::idempotency_records::Column as IdempotencyColumn;
        use entities::upstream_attempts::Column as AttemptColumn;

        let statements = vec![
            Index::create()
                .name("idx_upstream_attempts_request_attempt")
                .table(entities::upstream_attempts::Entity)
                .col(AttemptColumn::RequestId)
                .col(AttemptColumn::AttemptNumber)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_attempts_sent_at")
                .table(entities::upstream_attempts::Entity)
                .col(AttemptColumn::SentAt)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_downstream_requests_received_at")
                .table(entities::downstream_requests::Entity)
                .col(DownstreamColumn::ReceivedAt)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_audit_events_request_created")
                .table(entities::audit_events::Entity)
                .col(AuditColumn::RequestId)
                .col(AuditColumn::CreatedAt)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_idempotency_records_expires_at")
                .table(entities::idempotency_records::Entity)
                .col(IdempotencyColumn::ExpiresAt)
                .if_not_exists()
                .to_owned(),
        ];

        for statement in statements {
            self.db.execute(&statement).await?;
        }

        Ok(())
    }
}

fn map_insert_err(err: sea_orm::DbErr) -> StorageError {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        StorageError::Conflict
    } else {
        StorageError::Db(err)
    }
}

fn api_key_record(model: entities::api_keys::Model) -> ApiKeyRecord {
    ApiKeyRecord {
        id: model.id,
        access_key: model.access_key,
        secret_hash: model.secret_hash,
        secret_ciphertext: model.secret_ciphertext,
        description: model.description,
        created_at: model.created_at,
        updated_at: model.updated_at,
        expires_at: model.expires_at,
        revoked_at: model.revoked_at,
        rotation_of: model.rotation_of,
    }
}

fn attempt_record(model: entities::upstream_attempts::Model) -> UpstreamAttemptRecord {
    UpstreamAttemptRecord {
        request_id: model.request_id,
        attempt_number: model.attempt_number,
        upstream_action: model.upstream_action,
        request_headers_json: model.request_headers_json,
        request_body: model.request_body,
        response_status: model.response_status,
        response_headers_json: model.response_headers_json,
        response_body: model.response_body,
        latency_ms: model.latency_ms,
        error: model.error,
        sent_at: model.sent_at,
    }
}

fn audit_record(model: entities::audit_events::Model) -> AuditEventRecord {
    AuditEventRecord {
        request_id: model.request_id,
        event_type: model.event_type,
        actor: model.actor,
        action: model.action,
        resource: model.resource,
        metadata_json: model.metadata_json,
        created_at: model.created_at,
    }
}

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ApiKeys)
            .register(entities::DownstreamRequests)
            .register(entities::UpstreamAttempts)
            .register(entities::AuditEvents)
            .register(entities::IdempotencyRecords)
            .sync(&self.db)
            .await?;
        self.ensure_indexes().await?;
        Ok(())
    }

    async fn insert_api_key(&self, input: NewApiKey) -> StorageResult<ApiKeyRecord> {
        let now = OffsetDateTime::now_utc();
        let active = entities::api_keys::ActiveModel {
            id: ActiveValue::NotSet,
            access_key: ActiveValue::Set(input.access_key),
            secret_hash: ActiveValue::Set(input.secret_hash),
            secret_ciphertext: ActiveValue::Set(input.secret_ciphertext),
            description: ActiveValue::Set(input.description),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            expires_at: ActiveValue::Set(input.expires_at),
            revoked_at: ActiveValue::Set(None),
            rotation_of: ActiveValue::Set(input.rotation_of),
        };
        let result = entities::ApiKeys::insert(active)
            .exec(&self.db)
            .await
            .map_err(map_insert_err)?;
        self.api_key_by_id(result.last_insert_id).await
    }

    async fn api_key_by_id(&self, id: i64) -> StorageResult<ApiKeyRecord> {
        let model = entities::ApiKeys::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StorageError::NotFound)?;
        Ok(api_key_record(model))
    }

    async fn api_key_by_access_key(&self, access_key: &str) -> StorageResult<ApiKeyRecord> {
        use entities::api_keys::Column;
        let model = entities::ApiKeys::find()
            .filter(Column::AccessKey.eq(access_key))
            .one(&self.db)
            .await?
            .ok_or(StorageError::NotFound)?;
        Ok(api_key_record(model))
    }

    async fn list_api_keys(&self) -> StorageResult<Vec<ApiKeyRecord>> {
        use entities::api_keys::Column;
        let rows = entities::ApiKeys::find()
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(api_key_record).collect())
    }

    async fn revoke_api_key(&self, id: i64, at: OffsetDateTime) -> StorageResult<()> {
        let model = entities::ApiKeys::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StorageError::NotFound)?;
        let mut active: entities::api_keys::ActiveModel = model.into();
        active.revoked_at = ActiveValue::Set(Some(at));
        active.updated_at = ActiveValue::Set(at);
        sea_orm::ActiveModelTrait::update(active, &self.db).await?;
        Ok(())
    }

    async fn set_api_key_expiry(
        &self,
        id: i64,
        expires_at: Option<OffsetDateTime>,
    ) -> StorageResult<()> {
        let model = entities::ApiKeys::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StorageError::NotFound)?;
        let mut active: entities::api_keys::ActiveModel = model.into();
        active.expires_at = ActiveValue::Set(expires_at);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        sea_orm::ActiveModelTrait::update(active, &self.db).await?;
        Ok(())
    }

    async fn insert_downstream_request(
        &self,
        record: DownstreamRequestRecord,
    ) -> StorageResult<i64> {
        let active = entities::downstream_requests::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(record.request_id),
            api_key_id: ActiveValue::Set(record.api_key_id),
            action: ActiveValue::Set(record.action),
            request_method: ActiveValue::Set(record.request_method),
            request_path: ActiveValue::Set(record.request_path),
            request_query: ActiveValue::Set(record.request_query),
            request_headers_json: ActiveValue::Set(record.request_headers_json),
            request_body: ActiveValue::Set(record.request_body),
            client_ip: ActiveValue::Set(record.client_ip),
            received_at: ActiveValue::Set(record.received_at),
        };
        let result = entities::DownstreamRequests::insert(active)
            .exec(&self.db)
            .await
            .map_err(map_insert_err)?;
        Ok(result.last_insert_id)
    }

    async fn insert_upstream_attempt(&self, record: UpstreamAttemptRecord) -> StorageResult<i64> {
        let active = entities::upstream_attempts::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(record.request_id),
            attempt_number: ActiveValue::Set(record.attempt_number),
            upstream_action: ActiveValue::Set(record.upstream_action),
            request_headers_json: ActiveValue::Set(record.request_headers_json),
            request_body: ActiveValue::Set(record.request_body),
            response_status: ActiveValue::Set(record.response_status),
            response_headers_json: ActiveValue::Set(record.response_headers_json),
            response_body: ActiveValue::Set(record.response_body),
            latency_ms: ActiveValue::Set(record.latency_ms),
            error: ActiveValue::Set(record.error),
            sent_at: ActiveValue::Set(record.sent_at),
        };
        let result = entities::UpstreamAttempts::insert(active)
            .exec(&self.db)
            .await
            .map_err(map_insert_err)?;
        Ok(result.last_insert_id)
    }

    async fn list_upstream_attempts(
        &self,
        request_id: &str,
    ) -> StorageResult<Vec<UpstreamAttemptRecord>> {
        use entities::upstream_attempts::Column;
        let rows = entities::UpstreamAttempts::find()
            .filter(Column::RequestId.eq(request_id))
            .order_by_asc(Column::AttemptNumber)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(attempt_record).collect())
    }

    async fn insert_audit_event(&self, record: AuditEventRecord) -> StorageResult<i64> {
        let active = entities::audit_events::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(record.request_id),
            event_type: ActiveValue::Set(record.event_type),
            actor: ActiveValue::Set(record.actor),
            action: ActiveValue::Set(record.action),
            resource: ActiveValue::Set(record.resource),
            metadata_json: ActiveValue::Set(record.metadata_json),
            created_at: ActiveValue::Set(record.created_at),
        };
        let result = entities::AuditEvents::insert(active)
            .exec(&self.db)
            .await?;
        Ok(result.last_insert_id)
    }

    async fn list_audit_events(&self, request_id: &str) -> StorageResult<Vec<AuditEventRecord>> {
        use entities::audit_events::Column;
        let rows = entities::AuditEvents::find()
            .filter(Column::RequestId.eq(request_id))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(audit_record).collect())
    }

    async fn idempotency_find(&self, key: &str) -> StorageResult<IdempotencyRecord> {
        use entities::idempotency_records::Column;
        let model = entities::IdempotencyRecords::find()
            .filter(Column::IdempotencyKey.eq(key))
            .one(&self.db)
            .await?
            .ok_or(StorageError::NotFound)?;
        Ok(IdempotencyRecord {
            id: model.id,
            idempotency_key: model.idempotency_key,
            request_hash: model.request_hash,
            response_status: model.response_status,
            response_body: model.response_body,
            created_at: model.created_at,
            expires_at: model.expires_at,
        })
    }

    async fn idempotency_insert(
        &self,
        key: &str,
        request_hash: &str,
        response_status: i32,
        response_body: &[u8],
        created_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> StorageResult<i64> {
        let active = entities::idempotency_records::ActiveModel {
            id: ActiveValue::NotSet,
            idempotency_key: ActiveValue::Set(key.to_string()),
            request_hash: ActiveValue::Set(request_hash.to_string()),
            response_status: ActiveValue::Set(response_status),
            response_body: ActiveValue::Set(response_body.to_vec()),
            created_at: ActiveValue::Set(created_at),
            expires_at: ActiveValue::Set(expires_at),
        };
        let result = entities::IdempotencyRecords::insert(active)
            .exec(&self.db)
            .await
            .map_err(map_insert_err)?;
        Ok(result.last_insert_id)
    }

    async fn idempotency_sweep_expired(&self, now: OffsetDateTime) -> StorageResult<u64> {
        use entities::idempotency_records::Column;
        let result = entities::IdempotencyRecords::delete_many()
            .filter(Column::ExpiresAt.lte(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
