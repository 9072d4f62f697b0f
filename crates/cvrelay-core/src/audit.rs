use std::sync::Arc;

use time::OffsetDateTime;
use tracing::warn;

use cvrelay_storage::{
    AuditEventRecord, DownstreamRequestRecord, Storage, UpstreamAttemptRecord,
};

/// Lifecycle steps recorded per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    Received,
    AuthSuccess,
    AuthFailed,
    UpstreamCall,
    UpstreamResponse,
    ResponseSent,
    Error,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Received => "received",
            AuditEventType::AuthSuccess => "auth_success",
            AuditEventType::AuthFailed => "auth_failed",
            AuditEventType::UpstreamCall => "upstream_call",
            AuditEventType::UpstreamResponse => "upstream_response",
            AuditEventType::ResponseSent => "response_sent",
            AuditEventType::Error => "error",
        }
    }
}

/// Best-effort audit writer.
///
/// The response path is fail-open: a write failure is logged and the
/// request proceeds.
#[derive(Clone)]
pub struct AuditRecorder {
    storage: Arc<dyn Storage>,
}

impl AuditRecorder {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn record_downstream(&self, record: DownstreamRequestRecord) {
        let request_id = record.request_id.clone();
        if let Err(err) = self.storage.insert_downstream_request(record).await {
            warn!(
                event = "audit_write_failed",
                table = "downstream_requests",
                request_id = %request_id,
                error = %err
            );
        }
    }

    pub async fn record_attempt(&self, record: UpstreamAttemptRecord) {
        let request_id = record.request_id.clone();
        if let Err(err) = self.storage.insert_upstream_attempt(record).await {
            warn!(
                event = "audit_write_failed",
                table = "upstream_attempts",
                request_id = %request_id,
                error = %err
            );
        }
    }

    pub async fn record_event(
        &self,
        request_id: &str,
        event_type: AuditEventType,
        actor: &str,
        action: &str,
        resource: &str,
        metadata: serde_json::Value,
    ) {
        let record = AuditEventRecord {
            request_id: request_id.to_string(),
            event_type: event_type.as_str().to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            metadata_json: metadata,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(err) = self.storage.insert_audit_event(record).await {
            warn!(
                event = "audit_write_failed",
                table = "audit_events",
                request_id = %request_id,
                event_type = event_type.as_str(),
                error = %err
            );
        }
    }
}
