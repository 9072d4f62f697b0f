pub mod api_keys;
pub mod audit_events;
pub mod downstream_requests;
pub mod idempotency_records;
pub mod upstream_attempts;

pub use api_keys::Entity as ApiKeys;
pub use audit_events::Entity as AuditEvents;
pub use downstream_requests::Entity as DownstreamRequests;
pub use idempotency_records::Entity as IdempotencyRecords;
pub use upstream_attempts::Entity as UpstreamAttempts;
