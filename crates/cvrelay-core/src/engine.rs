use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use cvrelay_common::ErrorCode;
use cvrelay_protocol::{self as protocol, is_rate_limit_code};
use cvrelay_storage::{DownstreamRequestRecord, UpstreamAttemptRecord};

use crate::audit::AuditEventType;
use crate::error::RelayError;
use crate::idempotency::{IdempotencyResolver, Resolution};
use crate::state::AppState;

/// The two relay actions, mirroring the upstream contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    SubmitTask,
    GetResult,
}

impl RelayAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayAction::SubmitTask => "SubmitTask",
            RelayAction::GetResult => "GetResult",
        }
    }

    pub fn upstream_action(&self) -> &'static str {
        match self {
            RelayAction::SubmitTask => protocol::ACTION_SUBMIT_TASK,
            RelayAction::GetResult => protocol::ACTION_GET_RESULT,
        }
    }
}

impl std::fmt::Display for RelayAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A downstream request after HTTP extraction, before processing.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: u16,
    pub body: Bytes,
    pub request_id: String,
}

/// The relay's request-processing pipeline: audit, auth, idempotency,
/// admission, dispatch, classification, response.
#[derive(Clone)]
pub struct RelayEngine {
    state: Arc<AppState>,
}

impl RelayEngine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub async fn handle(&self, action: RelayAction, request: ReceivedRequest) -> RelayResponse {
        let request_id = Uuid::new_v4().to_string();
        let started = tokio::time::Instant::now();

        let result = self.process(action, &request, &request_id).await;
        let (status, body) = match result {
            Ok((status, body)) => (status, body),
            Err(err) => {
                self.state
                    .audit
                    .record_event(
                        &request_id,
                        AuditEventType::Error,
                        request.client_ip.as_deref().unwrap_or("unknown"),
                        action.as_str(),
                        &request.path,
                        serde_json::json!({ "code": err.code.as_str(), "message": err.message }),
                    )
                    .await;
                let body = serde_json::to_vec(&err.body()).unwrap_or_default();
                (err.http_status(), Bytes::from(body))
            }
        };

        info!(
            event = "relay_responded",
            request_id = %request_id,
            action = %action,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );

        RelayResponse {
            status,
            body,
            request_id,
        }
    }

    async fn process(
        &self,
        action: RelayAction,
        request: &ReceivedRequest,
        request_id: &str,
    ) -> Result<(u16, Bytes), RelayError> {
        let state = &self.state;
        let client_ip = request.client_ip.as_deref().unwrap_or("unknown");

        state
            .audit
            .record_event(
                request_id,
                AuditEventType::Received,
                client_ip,
                action.as_str(),
                &request.path,
                serde_json::json!({ "method": request.method }),
            )
            .await;

        let identity = match state
            .authenticator
            .authenticate(
                &request.method,
                &request.path,
                &request.query,
                &request.headers,
                &request.body,
            )
            .await
        {
            Ok(identity) => {
                state
                    .audit
                    .record_event(
                        request_id,
                        AuditEventType::AuthSuccess,
                        &identity.access_key,
                        action.as_str(),
                        &request.path,
                        serde_json::json!({}),
                    )
                    .await;
                identity
            }
            Err(err) => {
                state
                    .audit
                    .record_event(
                        request_id,
                        AuditEventType::AuthFailed,
                        client_ip,
                        action.as_str(),
                        &request.path,
                        serde_json::json!({ "code": err.code.as_str() }),
                    )
                    .await;
                self.record_downstream(action, request, request_id, None).await;
                return Err(err);
            }
        };

        self.record_downstream(action, request, request_id, Some(identity.id))
            .await;

        let idempotency_key = match action {
            RelayAction::SubmitTask => header_value(&request.headers, "idempotency-key"),
            RelayAction::GetResult => None,
        };
        let request_hash = IdempotencyResolver::request_hash(&request.body);
        let now = OffsetDateTime::now_utc();

        if let Some(key) = idempotency_key.as_deref() {
            if let Resolution::Replay(record) = state
                .idempotency
                .resolve(key, &request_hash, now)
                .await?
            {
                state
                    .audit
                    .record_event(
                        request_id,
                        AuditEventType::ResponseSent,
                        &identity.access_key,
                        action.as_str(),
                        &request.path,
                        serde_json::json!({ "replayed": true }),
                    )
                    .await;
                let status = u16::try_from(record.response_status).unwrap_or(200);
                return Ok((status, Bytes::from(record.response_body)));
            }
        }

        let permit = state
            .admission
            .admit(identity.id, action == RelayAction::SubmitTask)
            .await?;

        state
            .audit
            .record_event(
                request_id,
                AuditEventType::UpstreamCall,
                &identity.access_key,
                action.as_str(),
                action.upstream_action(),
                serde_json::json!({}),
            )
            .await;

        let sent_at = OffsetDateTime::now_utc();
        let outcome = state
            .dispatcher
            .dispatch(action.upstream_action(), &request.body)
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                state
                    .audit
                    .record_attempt(UpstreamAttemptRecord {
                        request_id: request_id.to_string(),
                        attempt_number: 1,
                        upstream_action: action.upstream_action().to_string(),
                        request_headers_json: serde_json::json!({}),
                        request_body: Some(request.body.to_vec()),
                        response_status: None,
                        response_headers_json: serde_json::json!({}),
                        response_body: None,
                        latency_ms: 0,
                        error: Some(err.code.as_str().to_string()),
                        sent_at,
                    })
                    .await;
                drop(permit);
                return Err(err);
            }
        };

        // Classify before recording so the attempt row distinguishes a
        // retryable throttle from a fatal business failure.
        let classification = classify_upstream(outcome.status, &outcome.body);

        state
            .audit
            .record_attempt(UpstreamAttemptRecord {
                request_id: request_id.to_string(),
                attempt_number: 1,
                upstream_action: action.upstream_action().to_string(),
                request_headers_json: headers_json(&outcome.request_headers),
                request_body: Some(request.body.to_vec()),
                response_status: Some(i32::from(outcome.status)),
                response_headers_json: headers_json(&outcome.headers),
                response_body: Some(outcome.body.to_vec()),
                latency_ms: outcome.latency_ms,
                error: classification
                    .as_ref()
                    .err()
                    .map(|err| err.code.as_str().to_string()),
                sent_at,
            })
            .await;

        state
            .audit
            .record_event(
                request_id,
                AuditEventType::UpstreamResponse,
                &identity.access_key,
                action.as_str(),
                action.upstream_action(),
                serde_json::json!({ "status": outcome.status, "latency_ms": outcome.latency_ms }),
            )
            .await;

        drop(permit);
        classification?;

        if let Some(key) = idempotency_key.as_deref() {
            // Fail-open: the submission already reached the upstream, so
            // the response still goes out; only replayability is lost.
            if let Err(err) = state
                .idempotency
                .store(key, &request_hash, outcome.status, &outcome.body, now)
                .await
            {
                tracing::warn!(
                    event = "idempotency_store_failed",
                    request_id = %request_id,
                    error = %err
                );
            }
        }

        state
            .audit
            .record_event(
                request_id,
                AuditEventType::ResponseSent,
                &identity.access_key,
                action.as_str(),
                &request.path,
                serde_json::json!({ "status": outcome.status }),
            )
            .await;

        Ok((outcome.status, outcome.body))
    }

    async fn record_downstream(
        &self,
        action: RelayAction,
        request: &ReceivedRequest,
        request_id: &str,
        api_key_id: Option<i64>,
    ) {
        let query = if request.query.is_empty() {
            None
        } else {
            serde_urlencoded::to_string(&request.query).ok()
        };
        self.state
            .audit
            .record_downstream(DownstreamRequestRecord {
                request_id: request_id.to_string(),
                api_key_id,
                action: action.as_str().to_string(),
                request_method: request.method.clone(),
                request_path: request.path.clone(),
                request_query: query,
                request_headers_json: header_map_json(&request.headers),
                request_body: Some(request.body.to_vec()),
                client_ip: request.client_ip.clone(),
                received_at: OffsetDateTime::now_utc(),
            })
            .await;
    }
}

/// Map upstream HTTP status and business envelope onto the error taxonomy.
fn classify_upstream(status: u16, body: &[u8]) -> Result<(), RelayError> {
    let envelope: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let code = envelope
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_i64());
    let business_status = envelope
        .as_ref()
        .and_then(|v| v.get("status"))
        .and_then(|v| v.as_i64());
    let message = envelope
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    // Rate-limit codes win regardless of the HTTP status they ride in on.
    if let Some(code) = code.filter(|c| is_rate_limit_code(*c)) {
        return Err(RelayError::rate_limited(format!(
            "upstream throttled the request (code {code})"
        )));
    }

    if !(200..300).contains(&status) {
        return Err(RelayError::business(format!(
            "upstream returned HTTP {status}: {message}"
        )));
    }

    if envelope.is_none() {
        return Err(RelayError::decode("upstream response is not valid JSON"));
    }
    if code.is_none() && business_status.is_none() {
        return Err(RelayError::new(
            ErrorCode::DecodeFailed,
            "upstream response envelope is missing code/status",
        ));
    }

    if code == Some(protocol::CODE_ENTITLEMENT)
        || business_status == Some(protocol::CODE_ENTITLEMENT)
    {
        return Err(RelayError::business(format!(
            "upstream entitlement mismatch (code 50400): the relay's upstream \
             credentials are not enabled for this req_key; check the service \
             subscription and region. upstream message: {message}"
        )));
    }

    let success = protocol::BUSINESS_SUCCESS;
    if code.unwrap_or(success) != success || business_status.unwrap_or(success) != success {
        let failed = code
            .filter(|c| *c != success)
            .or(business_status)
            .unwrap_or_default();
        return Err(RelayError::business(format!(
            "upstream business failure (code {failed}): {message}"
        )));
    }

    Ok(())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn header_map_json(headers: &HeaderMap) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        if name.as_str().eq_ignore_ascii_case("authorization") {
            map.insert(name.to_string(), serde_json::Value::String("<redacted>".to_string()));
            continue;
        }
        if let Ok(value) = value.to_str() {
            map.insert(
                name.to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }
    serde_json::Value::Object(map)
}

fn headers_json(headers: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("authorization") {
            map.insert(name.clone(), serde_json::Value::String("<redacted>".to_string()));
            continue;
        }
        map.insert(name.clone(), serde_json::Value::String(value.clone()));
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_accepts_success_envelope() {
        let body = br#"{"code":10000,"status":10000,"data":{"task_id":"t"}}"#;
        assert!(classify_upstream(200, body).is_ok());
    }

    #[test]
    fn classify_maps_rate_limit_codes() {
        for code in [50429, 50430] {
            let body = format!(r#"{{"code":{code},"status":{code},"message":"busy"}}"#);
            let err = classify_upstream(200, body.as_bytes()).unwrap_err();
            assert_eq!(err.code, ErrorCode::RateLimited, "code {code}");
        }
        // Also inside an HTTP 429.
        let body = br#"{"code":50429,"status":50429}"#;
        let err = classify_upstream(429, body).unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimited);
    }

    #[test]
    fn classify_enriches_entitlement_failures() {
        let body = br#"{"code":50400,"status":50400,"message":"no access"}"#;
        let err = classify_upstream(200, body).unwrap_err();
        assert_eq!(err.code, ErrorCode::BusinessFailed);
        assert!(err.message.contains("req_key"));
        assert!(err.message.contains("no access"));
    }

    #[test]
    fn classify_flags_other_business_codes() {
        let body = br#"{"code":60102,"status":10000,"message":"bad prompt"}"#;
        let err = classify_upstream(200, body).unwrap_err();
        assert_eq!(err.code, ErrorCode::BusinessFailed);
        assert!(err.message.contains("60102"));
    }

    #[test]
    fn classify_rejects_malformed_bodies() {
        let err = classify_upstream(200, b"<html>oops</html>").unwrap_err();
        assert_eq!(err.code, ErrorCode::DecodeFailed);

        let err = classify_upstream(200, b"{\"unrelated\":true}").unwrap_err();
        assert_eq!(err.code, ErrorCode::DecodeFailed);
    }

    #[test]
    fn classify_maps_http_errors_to_business() {
        let err = classify_upstream(500, b"internal").unwrap_err();
        assert_eq!(err.code, ErrorCode::BusinessFailed);
    }
}
