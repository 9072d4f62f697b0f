use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use time::OffsetDateTime;
use tracing::debug;

use cvrelay_common::ErrorBody;
use cvrelay_protocol::{
    GetResultRequestBody, GetResultResponseBody, SubmitTaskRequestBody, SubmitTaskResponseBody,
};
use cvrelay_sign::{Credentials, SignInput, sign};

use crate::error::ClientError;

/// Exponential backoff profile: `initial × multiplier^attempt`, clamped at
/// `max_delay`, then jittered by a uniform factor in [0.5, 1.5].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Default profile for queries and downloads.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Submission profile: more patient, tighter cap.
    pub fn submit() -> Self {
        Self {
            max_retries: 6,
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(20),
        }
    }

    /// The deterministic (un-jittered) delay before retry `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let clamped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        self.delay_for(attempt).mul_f64(factor)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `http://127.0.0.1:8080`.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub submit_retry: RetryPolicy,
    pub query_retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: "cn-north-1".to_string(),
            submit_retry: RetryPolicy::submit(),
            query_retry: RetryPolicy::standard(),
        }
    }

    fn host(&self) -> String {
        let stripped = self
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        stripped
            .split('/')
            .next()
            .unwrap_or(stripped)
            .to_string()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }
}

/// The two relay calls, behind a trait so the waiter and flow tests can
/// script responses.
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn submit_task(
        &self,
        body: &SubmitTaskRequestBody,
    ) -> Result<SubmitTaskResponseBody, ClientError>;
    async fn get_result(
        &self,
        body: &GetResultRequestBody,
    ) -> Result<GetResultResponseBody, ClientError>;
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Raw HTTP POST seam; the wreq implementation is swapped out in tests.
pub trait HttpPoster: Send + Sync {
    fn post(
        &self,
        url: String,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse, String>> + Send + '_>>;
}

pub struct WreqPoster {
    client: wreq::Client,
}

impl WreqPoster {
    pub fn new(timeout: Duration) -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl HttpPoster for WreqPoster {
    fn post(
        &self,
        url: String,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse, String>> + Send + '_>> {
        Box::pin(async move {
            let mut builder = self.client.post(&url);
            for (name, value) in &headers {
                builder = builder.header(name, value);
            }
            let response = builder
                .body(body)
                .send()
                .await
                .map_err(|err| err.to_string())?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(|err| err.to_string())?;
            Ok(RawResponse { status, body })
        })
    }
}

/// Signed, retrying transport toward the relay.
pub struct RelayClient {
    config: ClientConfig,
    http: Arc<dyn HttpPoster>,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let poster = WreqPoster::new(Duration::from_secs(60))
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        Ok(Self::with_poster(config, Arc::new(poster)))
    }

    pub fn with_poster(config: ClientConfig, http: Arc<dyn HttpPoster>) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn call_with_retry(
        &self,
        path: &str,
        idempotency_key: Option<&str>,
        body: Bytes,
        policy: &RetryPolicy,
    ) -> Result<Bytes, ClientError> {
        let mut attempt = 0u32;
        loop {
            let result = self.call_once(path, idempotency_key, body.clone()).await;
            match result {
                Ok(response_body) => return Ok(response_body),
                Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                    let delay = policy.jittered_delay(attempt);
                    debug!(
                        event = "relay_call_retry",
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once(
        &self,
        path: &str,
        idempotency_key: Option<&str>,
        body: Bytes,
    ) -> Result<Bytes, ClientError> {
        let query: Vec<(String, String)> = Vec::new();
        let host = self.config.host();
        let signed = sign(
            &SignInput {
                method: "POST",
                path,
                query: &query,
                host: &host,
                content_type: "application/json",
                payload: &body,
            },
            &Credentials {
                access_key: self.config.access_key.clone(),
                secret_key: self.config.secret_key.clone(),
            },
            &self.config.region,
            OffsetDateTime::now_utc(),
        );

        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("host".to_string(), host),
            ("x-date".to_string(), signed.x_date),
            ("x-content-sha256".to_string(), signed.x_content_sha256),
            ("authorization".to_string(), signed.authorization),
        ];
        if let Some(key) = idempotency_key {
            headers.push(("idempotency-key".to_string(), key.to_string()));
        }

        let response = self
            .http
            .post(self.config.url(path), headers, body)
            .await
            .map_err(ClientError::Transport)?;

        if (200..300).contains(&response.status) {
            return Ok(response.body);
        }

        match serde_json::from_slice::<ErrorBody>(&response.body) {
            Ok(error_body) => Err(ClientError::Api {
                code: error_body.code,
                message: error_body.message,
            }),
            Err(_) => Err(ClientError::Http {
                status: response.status,
                message: String::from_utf8_lossy(&response.body).into_owned(),
            }),
        }
    }
}

#[async_trait]
impl RelayApi for RelayClient {
    async fn submit_task(
        &self,
        body: &SubmitTaskRequestBody,
    ) -> Result<SubmitTaskResponseBody, ClientError> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| ClientError::Validation(format!("unserializable request: {err}")))?;
        let response = self
            .call_with_retry(
                "/v1/submit",
                None,
                Bytes::from(payload),
                &self.config.submit_retry,
            )
            .await?;
        serde_json::from_slice(&response)
            .map_err(|err| ClientError::Decode(format!("submit response: {err}")))
    }

    async fn get_result(
        &self,
        body: &GetResultRequestBody,
    ) -> Result<GetResultResponseBody, ClientError> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| ClientError::Validation(format!("unserializable request: {err}")))?;
        let response = self
            .call_with_retry(
                "/v1/get-result",
                None,
                Bytes::from(payload),
                &self.config.query_retry,
            )
            .await?;
        serde_json::from_slice(&response)
            .map_err(|err| ClientError::Decode(format!("get-result response: {err}")))
    }
}

impl RelayClient {
    /// Submit with an idempotency key, making retries replay-safe on the
    /// relay side.
    pub async fn submit_task_idempotent(
        &self,
        body: &SubmitTaskRequestBody,
        idempotency_key: &str,
    ) -> Result<SubmitTaskResponseBody, ClientError> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| ClientError::Validation(format!("unserializable request: {err}")))?;
        let response = self
            .call_with_retry(
                "/v1/submit",
                Some(idempotency_key),
                Bytes::from(payload),
                &self.config.submit_retry,
            )
            .await?;
        serde_json::from_slice(&response)
            .map_err(|err| ClientError::Decode(format!("submit response: {err}")))
    }
}
