pub mod entities;
pub mod seaorm;
pub mod storage;

pub use seaorm::SeaOrmStorage;
pub use storage::{
    ApiKeyRecord, ApiKeyStatus, AuditEventRecord, DownstreamRequestRecord, IdempotencyRecord,
    NewApiKey, Storage, StorageError, StorageResult, UpstreamAttemptRecord,
};
