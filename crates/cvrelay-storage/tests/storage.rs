use std::time::Duration;

use cvrelay_storage::{
    ApiKeyStatus, AuditEventRecord, DownstreamRequestRecord, NewApiKey, SeaOrmStorage, Storage,
    UpstreamAttemptRecord,
};
use time::OffsetDateTime;

async fn storage() -> SeaOrmStorage {
    let storage = SeaOrmStorage::connect("sqlite::memory:").await.unwrap();
    storage.sync().await.unwrap();
    storage
}

fn new_key(access_key: &str) -> NewApiKey {
    NewApiKey {
        access_key: access_key.to_string(),
        secret_hash: "$2b$12$hash".to_string(),
        secret_ciphertext: "v1:abc".to_string(),
        description: Some("test key".to_string()),
        expires_at: None,
        rotation_of: None,
    }
}

#[tokio::test]
async fn api_key_lifecycle() {
    let storage = storage().await;
    let now = OffsetDateTime::now_utc();

    let created = storage.insert_api_key(new_key("ak-one")).await.unwrap();
    assert_eq!(created.status(now), ApiKeyStatus::Active);

    let by_access = storage.api_key_by_access_key("ak-one").await.unwrap();
    assert_eq!(by_access.id, created.id);
    assert_eq!(by_access.secret_ciphertext, "v1:abc");

    storage.revoke_api_key(created.id, now).await.unwrap();
    let revoked = storage.api_key_by_id(created.id).await.unwrap();
    assert_eq!(revoked.status(now), ApiKeyStatus::Revoked);
    assert!(revoked.revoked_at.is_some());
}

#[tokio::test]
async fn access_key_is_unique() {
    let storage = storage().await;
    storage.insert_api_key(new_key("ak-dup")).await.unwrap();
    let err = storage.insert_api_key(new_key("ak-dup")).await.unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");
}

#[tokio::test]
async fn missing_rows_hit_the_not_found_sentinel() {
    let storage = storage().await;
    assert!(
        storage
            .api_key_by_access_key("nope")
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(storage.api_key_by_id(42).await.unwrap_err().is_not_found());
    assert!(
        storage
            .revoke_api_key(42, OffsetDateTime::now_utc())
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(
        storage
            .idempotency_find("absent")
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn expiry_update_applies() {
    let storage = storage().await;
    let now = OffsetDateTime::now_utc();
    let created = storage.insert_api_key(new_key("ak-exp")).await.unwrap();

    storage
        .set_api_key_expiry(created.id, Some(now - Duration::from_secs(60)))
        .await
        .unwrap();
    let expired = storage.api_key_by_id(created.id).await.unwrap();
    assert_eq!(expired.status(now), ApiKeyStatus::Expired);
}

#[tokio::test]
async fn request_id_is_unique() {
    let storage = storage().await;
    let record = DownstreamRequestRecord {
        request_id: "req-1".to_string(),
        api_key_id: None,
        action: "SubmitTask".to_string(),
        request_method: "POST".to_string(),
        request_path: "/v1/submit".to_string(),
        request_query: None,
        request_headers_json: serde_json::json!({}),
        request_body: Some(b"{}".to_vec()),
        client_ip: Some("127.0.0.1".to_string()),
        received_at: OffsetDateTime::now_utc(),
    };
    storage
        .insert_downstream_request(record.clone())
        .await
        .unwrap();
    let err = storage.insert_downstream_request(record).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn attempts_list_in_attempt_order() {
    let storage = storage().await;
    let now = OffsetDateTime::now_utc();
    for attempt_number in [2, 1, 3] {
        storage
            .insert_upstream_attempt(UpstreamAttemptRecord {
                request_id: "req-a".to_string(),
                attempt_number,
                upstream_action: "CVSync2AsyncSubmitTask".to_string(),
                request_headers_json: serde_json::json!({}),
                request_body: None,
                response_status: Some(200),
                response_headers_json: serde_json::json!({}),
                response_body: None,
                latency_ms: 10,
                error: None,
                sent_at: now,
            })
            .await
            .unwrap();
    }

    let attempts = storage.list_upstream_attempts("req-a").await.unwrap();
    let numbers: Vec<i32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn duplicate_attempt_number_conflicts() {
    let storage = storage().await;
    let record = UpstreamAttemptRecord {
        request_id: "req-b".to_string(),
        attempt_number: 1,
        upstream_action: "CVSync2AsyncSubmitTask".to_string(),
        request_headers_json: serde_json::json!({}),
        request_body: None,
        response_status: None,
        response_headers_json: serde_json::json!({}),
        response_body: None,
        latency_ms: 5,
        error: Some("connect refused".to_string()),
        sent_at: OffsetDateTime::now_utc(),
    };
    storage
        .insert_upstream_attempt(record.clone())
        .await
        .unwrap();
    let err = storage.insert_upstream_attempt(record).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn audit_events_list_in_creation_order() {
    let storage = storage().await;
    let base = OffsetDateTime::now_utc();
    for (offset, event_type) in [
        (0, "received"),
        (1, "auth_success"),
        (2, "upstream_call"),
        (3, "upstream_response"),
        (4, "response_sent"),
    ] {
        storage
            .insert_audit_event(AuditEventRecord {
                request_id: "req-c".to_string(),
                event_type: event_type.to_string(),
                actor: "ak-one".to_string(),
                action: "SubmitTask".to_string(),
                resource: "/v1/submit".to_string(),
                metadata_json: serde_json::json!({}),
                created_at: base + Duration::from_micros(offset),
            })
            .await
            .unwrap();
    }

    let events = storage.list_audit_events("req-c").await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "received",
            "auth_success",
            "upstream_call",
            "upstream_response",
            "response_sent"
        ]
    );
}

#[tokio::test]
async fn idempotency_insert_find_and_sweep() {
    let storage = storage().await;
    let now = OffsetDateTime::now_utc();

    storage
        .idempotency_insert("k1", "h1", 200, b"body-1", now, now + Duration::from_secs(60))
        .await
        .unwrap();
    let found = storage.idempotency_find("k1").await.unwrap();
    assert_eq!(found.request_hash, "h1");
    assert_eq!(found.response_body, b"body-1");

    // Same key again trips the unique index.
    let err = storage
        .idempotency_insert("k1", "h1", 200, b"body-2", now, now + Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // An already-expired record is removed by the sweeper.
    storage
        .idempotency_insert("k2", "h2", 200, b"old", now - Duration::from_secs(120), now - Duration::from_secs(60))
        .await
        .unwrap();
    let swept = storage.idempotency_sweep_expired(now).await.unwrap();
    assert_eq!(swept, 1);
    assert!(
        storage
            .idempotency_find("k2")
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(storage.idempotency_find("k1").await.is_ok());
}
