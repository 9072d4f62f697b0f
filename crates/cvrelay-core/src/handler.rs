use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header::CONTENT_TYPE};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::post;
use bytes::Bytes;
use tracing::info;

use crate::engine::{ReceivedRequest, RelayAction, RelayEngine};

/// Whole-request ceiling; expiry cancels the handler chain, which releases
/// any admission resources it held.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub fn relay_router(engine: Arc<RelayEngine>) -> Router {
    Router::new()
        .route("/v1/submit", post(submit_handler))
        .route("/v1/get-result", post(get_result_handler))
        .route("/", post(action_handler))
        .layer(middleware::from_fn(request_timeout))
        .with_state(engine)
}

async fn request_timeout(request: Request, next: Next) -> Response {
    match tokio::time::timeout(REQUEST_TIMEOUT, next.run(request)).await {
        Ok(response) => response,
        Err(_) => error_response(StatusCode::GATEWAY_TIMEOUT, "request deadline exceeded"),
    }
}

async fn submit_handler(
    State(engine): State<Arc<RelayEngine>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(engine, RelayAction::SubmitTask, peer, method, uri, headers, body).await
}

async fn get_result_handler(
    State(engine): State<Arc<RelayEngine>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(engine, RelayAction::GetResult, peer, method, uri, headers, body).await
}

/// Upstream-shaped entrypoint: `POST /?Action=...&Version=...`.
async fn action_handler(
    State(engine): State<Arc<RelayEngine>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query = parse_query(uri.query());
    let action = query
        .iter()
        .find(|(k, _)| k == "Action")
        .map(|(_, v)| v.as_str());
    let action = match action {
        Some(cvrelay_protocol::ACTION_SUBMIT_TASK) => RelayAction::SubmitTask,
        Some(cvrelay_protocol::ACTION_GET_RESULT) => RelayAction::GetResult,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "unknown or missing Action parameter",
            );
        }
    };
    dispatch(engine, action, peer, method, uri, headers, body).await
}

async fn dispatch(
    engine: Arc<RelayEngine>,
    action: RelayAction,
    peer: SocketAddr,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_ip = client_ip(&headers, peer);
    info!(
        event = "relay_received",
        action = %action,
        path = %uri.path(),
        client_ip = client_ip.as_deref().unwrap_or("unknown"),
        body_bytes = body.len(),
    );

    let request = ReceivedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: parse_query(uri.query()),
        headers,
        body,
        client_ip,
    };

    let relayed = engine.handle(action, request).await;

    let mut response = Response::new(Body::from(relayed.body));
    *response.status_mut() =
        StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::BAD_GATEWAY);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&relayed.request_id) {
        response.headers_mut().insert("x-relay-request-id", value);
    }
    response
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    match query {
        Some(raw) if !raw.is_empty() => {
            serde_urlencoded::from_str::<Vec<(String, String)>>(raw).unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    Some(peer.ip().to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let code = match status {
        StatusCode::GATEWAY_TIMEOUT => "TIMEOUT",
        _ => "VALIDATION_FAILED",
    };
    let body = serde_json::json!({
        "code": code,
        "message": message,
    });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
