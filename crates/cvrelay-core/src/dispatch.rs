use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;
use tokio::time::Instant;

use cvrelay_protocol::API_VERSION;
use cvrelay_sign::{Credentials, SignInput, sign};

use crate::error::RelayError;
use crate::upstream_client::{
    UpstreamClient, UpstreamHttpRequest, UpstreamTransportErrorKind,
};

/// Raw result of one forward call; business classification happens in the
/// engine, after the attempt is recorded.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub latency_ms: i64,
    pub request_headers: Vec<(String, String)>,
}

/// Signs and forwards requests with the relay's own upstream credentials.
pub struct Dispatcher {
    client: Arc<dyn UpstreamClient>,
    credentials: Credentials,
    region: String,
    host: String,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        credentials: Credentials,
        region: String,
        host: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            credentials,
            region,
            host,
            timeout,
        }
    }

    pub async fn dispatch(&self, action: &str, body: &[u8]) -> Result<DispatchOutcome, RelayError> {
        let query = vec![
            ("Action".to_string(), action.to_string()),
            ("Version".to_string(), API_VERSION.to_string()),
        ];
        let signed = sign(
            &SignInput {
                method: "POST",
                path: "/",
                query: &query,
                host: &self.host,
                content_type: "application/json",
                payload: body,
            },
            &self.credentials,
            &self.region,
            OffsetDateTime::now_utc(),
        );

        let request_headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("host".to_string(), self.host.clone()),
            ("x-date".to_string(), signed.x_date.clone()),
            (
                "x-content-sha256".to_string(),
                signed.x_content_sha256.clone(),
            ),
            ("authorization".to_string(), signed.authorization.clone()),
        ];
        let request = UpstreamHttpRequest {
            method: "POST".to_string(),
            url: format!("https://{}/?Action={action}&Version={API_VERSION}", self.host),
            headers: request_headers.clone(),
            body: Some(Bytes::copy_from_slice(body)),
        };

        let started = Instant::now();
        let response = tokio::time::timeout(self.timeout, self.client.send(request)).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        let response = match response {
            Ok(result) => result,
            Err(_) => {
                return Err(RelayError::timeout(format!(
                    "upstream call exceeded {:?}",
                    self.timeout
                )));
            }
        };

        match response {
            Ok(resp) => Ok(DispatchOutcome {
                status: resp.status,
                headers: resp.headers,
                body: resp.body,
                latency_ms,
                request_headers,
            }),
            Err(failure) => {
                let err = match failure.kind {
                    UpstreamTransportErrorKind::Timeout => {
                        RelayError::timeout("upstream call timed out")
                    }
                    _ => RelayError::internal("upstream transport failure"),
                };
                Err(err.with_source(failure))
            }
        }
    }
}
