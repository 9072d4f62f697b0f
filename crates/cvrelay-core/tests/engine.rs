use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http::HeaderMap;
use time::OffsetDateTime;

use cvrelay_common::{ErrorCode, RelayConfigPatch};
use cvrelay_core::admission::{AdmissionConfig, AdmissionController};
use cvrelay_core::audit::AuditRecorder;
use cvrelay_core::auth::Authenticator;
use cvrelay_core::dispatch::Dispatcher;
use cvrelay_core::idempotency::IdempotencyResolver;
use cvrelay_core::upstream_client::{
    UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
};
use cvrelay_core::{
    AppState, CreatedKey, KeyManager, ReceivedRequest, RelayAction, RelayEngine, SecretBox,
};
use cvrelay_sign::{Credentials, SignInput, sign};
use cvrelay_storage::{SeaOrmStorage, Storage};

const RELAY_HOST: &str = "relay.local";
const REGION: &str = "cn-north-1";

struct MockUpstream {
    calls: AtomicUsize,
    delay: Duration,
    status: u16,
    body: Bytes,
}

impl MockUpstream {
    fn success(task_id: &str) -> Arc<Self> {
        let body = format!(
            r#"{{"code":10000,"status":10000,"data":{{"task_id":"{task_id}"}},"request_id":"up-1"}}"#
        );
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            status: 200,
            body: Bytes::from(body),
        })
    }

    fn with_delay(mut self: Arc<Self>, delay: Duration) -> Arc<Self> {
        Arc::get_mut(&mut self).unwrap().delay = delay;
        self
    }

    fn scripted(status: u16, body: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            status,
            body: Bytes::from(body.to_string()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl UpstreamClient for MockUpstream {
    fn send<'a>(
        &'a self,
        _req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(UpstreamHttpResponse {
                status: self.status,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: self.body.clone(),
            })
        })
    }
}

async fn build_engine(
    mock: Arc<MockUpstream>,
    admission: AdmissionConfig,
) -> (RelayEngine, KeyManager, Arc<SeaOrmStorage>) {
    let storage = Arc::new(SeaOrmStorage::connect("sqlite::memory:").await.unwrap());
    storage.sync().await.unwrap();
    let storage_dyn: Arc<dyn Storage> = storage.clone();

    let secrets = SecretBox::from_base64(&BASE64.encode([5u8; 32])).unwrap();
    let controller = AdmissionController::new(admission);
    let manager = KeyManager::new(storage_dyn.clone(), secrets.clone())
        .with_key_locks(controller.key_locks());

    let config = RelayConfigPatch {
        upstream_access_key: Some("upstream-ak".to_string()),
        upstream_secret_key: Some("upstream-sk".to_string()),
        dsn: Some("sqlite::memory:".to_string()),
        encryption_key: Some(BASE64.encode([5u8; 32])),
        ..RelayConfigPatch::default()
    }
    .into_config()
    .unwrap();

    let state = AppState {
        config,
        storage: storage_dyn.clone(),
        authenticator: Authenticator::new(storage_dyn.clone(), secrets.clone(), REGION.to_string()),
        admission: controller,
        dispatcher: Dispatcher::new(
            mock,
            Credentials {
                access_key: "upstream-ak".to_string(),
                secret_key: "upstream-sk".to_string(),
            },
            REGION.to_string(),
            "visual.volcengineapi.com".to_string(),
            Duration::from_secs(5),
        ),
        audit: AuditRecorder::new(storage_dyn.clone()),
        idempotency: IdempotencyResolver::new(storage_dyn, Duration::from_secs(3600)),
    };

    (RelayEngine::new(Arc::new(state)), manager, storage)
}

fn signed_request(
    path: &str,
    body: &[u8],
    key: &CreatedKey,
    idempotency_key: Option<&str>,
) -> ReceivedRequest {
    signed_request_with_secret(path, body, &key.record.access_key, &key.secret, idempotency_key)
}

fn signed_request_with_secret(
    path: &str,
    body: &[u8],
    access_key: &str,
    secret: &str,
    idempotency_key: Option<&str>,
) -> ReceivedRequest {
    let query: Vec<(String, String)> = Vec::new();
    let signed = sign(
        &SignInput {
            method: "POST",
            path,
            query: &query,
            host: RELAY_HOST,
            content_type: "application/json",
            payload: body,
        },
        &Credentials {
            access_key: access_key.to_string(),
            secret_key: secret.to_string(),
        },
        REGION,
        OffsetDateTime::now_utc(),
    );

    let mut headers = HeaderMap::new();
    headers.insert("authorization", signed.authorization.parse().unwrap());
    headers.insert("x-date", signed.x_date.parse().unwrap());
    headers.insert("x-content-sha256", signed.x_content_sha256.parse().unwrap());
    headers.insert("host", RELAY_HOST.parse().unwrap());
    headers.insert("content-type", "application/json".parse().unwrap());
    if let Some(key) = idempotency_key {
        headers.insert("idempotency-key", key.parse().unwrap());
    }

    ReceivedRequest {
        method: "POST".to_string(),
        path: path.to_string(),
        query,
        headers,
        body: Bytes::copy_from_slice(body),
        client_ip: Some("127.0.0.1".to_string()),
    }
}

const SUBMIT_BODY: &[u8] = br#"{"req_key":"jimeng_t2i_v40","prompt":"a lighthouse"}"#;

#[tokio::test]
async fn submit_success_relays_body_and_audits() {
    let mock = MockUpstream::success("task-1");
    let (engine, manager, storage) = build_engine(mock.clone(), AdmissionConfig::default()).await;
    let key = manager.create(None, None).await.unwrap();

    let response = engine
        .handle(
            RelayAction::SubmitTask,
            signed_request("/v1/submit", SUBMIT_BODY, &key, None),
        )
        .await;

    assert_eq!(response.status, 200);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["data"]["task_id"], "task-1");
    assert_eq!(mock.calls(), 1);

    let events = storage.list_audit_events(&response.request_id).await.unwrap();
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

    let attempts = storage
        .list_upstream_attempts(&response.request_id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].response_status, Some(200));
    assert!(attempts[0].error.is_none());
}

#[tokio::test]
async fn idempotent_replay_skips_the_upstream() {
    let mock = MockUpstream::success("task-replayed");
    let (engine, manager, _storage) = build_engine(mock.clone(), AdmissionConfig::default()).await;
    let key = manager.create(None, None).await.unwrap();

    let first = engine
        .handle(
            RelayAction::SubmitTask,
            signed_request("/v1/submit", SUBMIT_BODY, &key, Some("k1")),
        )
        .await;
    assert_eq!(first.status, 200);
    assert_eq!(mock.calls(), 1);

    let second = engine
        .handle(
            RelayAction::SubmitTask,
            signed_request("/v1/submit", SUBMIT_BODY, &key, Some("k1")),
        )
        .await;
    assert_eq!(second.status, 200);
    assert_eq!(
        second.body, first.body,
        "replay must return the stored response verbatim"
    );
    assert_eq!(mock.calls(), 1, "no second upstream dispatch");
}

#[tokio::test]
async fn idempotency_key_reuse_with_different_body_fails() {
    let mock = MockUpstream::success("task-2");
    let (engine, manager, _storage) = build_engine(mock.clone(), AdmissionConfig::default()).await;
    let key = manager.create(None, None).await.unwrap();

    let first = engine
        .handle(
            RelayAction::SubmitTask,
            signed_request("/v1/submit", SUBMIT_BODY, &key, Some("k2")),
        )
        .await;
    assert_eq!(first.status, 200);

    let other_body = br#"{"req_key":"jimeng_t2i_v40","prompt":"a different prompt"}"#;
    let second = engine
        .handle(
            RelayAction::SubmitTask,
            signed_request("/v1/submit", other_body, &key, Some("k2")),
        )
        .await;
    assert_eq!(second.status, 400);
    let body: serde_json::Value = serde_json::from_slice(&second.body).unwrap();
    assert_eq!(body["code"], ErrorCode::ValidationFailed.as_str());
    assert_eq!(mock.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_concurrency_is_rejected_immediately() {
    let mock = MockUpstream::success("task-slow").with_delay(Duration::from_secs(2));
    let (engine, manager, _storage) = build_engine(
        mock.clone(),
        AdmissionConfig {
            max_concurrent: 10,
            max_queue: 10,
            min_interval: Duration::ZERO,
        },
    )
    .await;
    let key = manager.create(None, None).await.unwrap();

    let mut joins = Vec::new();
    for _ in 0..5 {
        let engine = engine.clone();
        let request = signed_request("/v1/submit", SUBMIT_BODY, &key, None);
        joins.push(tokio::spawn(async move {
            engine.handle(RelayAction::SubmitTask, request).await
        }));
    }

    let mut ok = 0;
    let mut rate_limited = 0;
    for join in joins {
        let response = join.await.unwrap();
        match response.status {
            200 => ok += 1,
            429 => {
                let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
                assert_eq!(body["code"], ErrorCode::RateLimited.as_str());
                rate_limited += 1;
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(ok, 1, "exactly one request may hold the per-key lock");
    assert_eq!(rate_limited, 4);
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn queue_full_fails_closed() {
    let mock = MockUpstream::success("task-q").with_delay(Duration::from_millis(1500));
    let (engine, manager, _storage) = build_engine(
        mock.clone(),
        AdmissionConfig {
            max_concurrent: 1,
            max_queue: 0,
            min_interval: Duration::ZERO,
        },
    )
    .await;
    let holder = manager.create(None, None).await.unwrap();
    let rejected = manager.create(None, None).await.unwrap();

    let slow = {
        let engine = engine.clone();
        let request = signed_request("/v1/submit", SUBMIT_BODY, &holder, None);
        tokio::spawn(async move { engine.handle(RelayAction::SubmitTask, request).await })
    };
    // Wait until the slow request holds the only slot.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let response = engine
        .handle(
            RelayAction::SubmitTask,
            signed_request("/v1/submit", SUBMIT_BODY, &rejected, None),
        )
        .await;
    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["code"], ErrorCode::QueueFull.as_str());

    assert_eq!(slow.await.unwrap().status, 200);
}

#[tokio::test]
async fn bad_signature_is_rejected() {
    let mock = MockUpstream::success("task-x");
    let (engine, manager, _storage) = build_engine(mock.clone(), AdmissionConfig::default()).await;
    let key = manager.create(None, None).await.unwrap();

    let request = signed_request_with_secret(
        "/v1/submit",
        SUBMIT_BODY,
        &key.record.access_key,
        "not-the-real-secret",
        None,
    );
    let response = engine.handle(RelayAction::SubmitTask, request).await;

    assert_eq!(response.status, 401);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["code"], ErrorCode::AuthFailed.as_str());
    assert_eq!(mock.calls(), 0, "auth failures never reach the upstream");
}

#[tokio::test]
async fn revoked_key_is_rejected() {
    let mock = MockUpstream::success("task-r");
    let (engine, manager, _storage) = build_engine(mock.clone(), AdmissionConfig::default()).await;
    let key = manager.create(None, None).await.unwrap();
    manager.revoke(key.record.id).await.unwrap();

    let response = engine
        .handle(
            RelayAction::SubmitTask,
            signed_request("/v1/submit", SUBMIT_BODY, &key, None),
        )
        .await;

    assert_eq!(response.status, 401);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["code"], ErrorCode::KeyRevoked.as_str());
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn upstream_rate_limit_codes_propagate() {
    let mock = MockUpstream::scripted(
        200,
        r#"{"code":50429,"status":50429,"message":"model concurrency exceeded"}"#,
    );
    let (engine, manager, _storage) = build_engine(mock.clone(), AdmissionConfig::default()).await;
    let key = manager.create(None, None).await.unwrap();

    let response = engine
        .handle(
            RelayAction::SubmitTask,
            signed_request("/v1/submit", SUBMIT_BODY, &key, None),
        )
        .await;

    assert_eq!(response.status, 429);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["code"], ErrorCode::RateLimited.as_str());
}

#[tokio::test]
async fn business_failures_are_not_cached_for_replay() {
    let mock = MockUpstream::scripted(
        200,
        r#"{"code":60102,"status":10000,"message":"prompt rejected"}"#,
    );
    let (engine, manager, _storage) = build_engine(mock.clone(), AdmissionConfig::default()).await;
    let key = manager.create(None, None).await.unwrap();

    let first = engine
        .handle(
            RelayAction::SubmitTask,
            signed_request("/v1/submit", SUBMIT_BODY, &key, Some("k3")),
        )
        .await;
    assert_eq!(first.status, 502);

    // The failed attempt did not consume the key; a retry dispatches again.
    let second = engine
        .handle(
            RelayAction::SubmitTask,
            signed_request("/v1/submit", SUBMIT_BODY, &key, Some("k3")),
        )
        .await;
    assert_eq!(second.status, 502);
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn get_result_relays_without_idempotency() {
    let mock = MockUpstream::scripted(
        200,
        r#"{"code":10000,"status":10000,"data":{"status":"generating"}}"#,
    );
    let (engine, manager, _storage) = build_engine(mock.clone(), AdmissionConfig::default()).await;
    let key = manager.create(None, None).await.unwrap();

    let body = br#"{"req_key":"jimeng_t2i_v40","task_id":"task-1"}"#;
    for _ in 0..2 {
        let response = engine
            .handle(
                RelayAction::GetResult,
                signed_request("/v1/get-result", body, &key, None),
            )
            .await;
        assert_eq!(response.status, 200);
    }
    assert_eq!(mock.calls(), 2, "get-result is never replayed from cache");
}
