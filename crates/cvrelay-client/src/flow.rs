use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use cvrelay_protocol::TaskStatus;

use crate::download::download_to_dir;
use crate::error::ClientError;
use crate::request::GenerationRequest;
use crate::transport::{RelayApi, RelayClient};
use crate::waiter::{WaitOptions, wait_for_result};

/// Knobs for one submit → wait → download run.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub out_dir: PathBuf,
    pub overwrite: bool,
    /// Overrides the per-output-kind wait defaults when set.
    pub wait: Option<WaitOptions>,
    /// Serial spacing between submissions in a batch.
    pub batch_spacing: Duration,
    /// Attach idempotency keys to submissions so transport retries are
    /// replay-safe.
    pub idempotent_submit: bool,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            overwrite: false,
            wait: None,
            batch_spacing: Duration::from_millis(500),
            idempotent_submit: true,
        }
    }
}

/// Everything one run produced, including partial progress when a stage
/// failed: the task id survives a wait timeout, downloaded files survive a
/// later download error.
#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub task_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub files: Vec<PathBuf>,
    pub error: Option<ClientError>,
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status == Some(TaskStatus::Done)
    }
}

/// Composes the client stages into one resilient run.
pub struct GenerationFlow {
    client: RelayClient,
    http: wreq::Client,
    options: FlowOptions,
}

impl GenerationFlow {
    pub fn new(client: RelayClient, options: FlowOptions) -> Result<Self, ClientError> {
        let http = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            http,
            options,
        })
    }

    /// submit → wait → download. Never panics out of a stage; the outcome
    /// carries whatever was achieved plus the first error.
    pub async fn run(&self, request: &GenerationRequest) -> GenerationOutcome {
        let mut outcome = GenerationOutcome::default();

        let body = match request.build().await {
            Ok(body) => body,
            Err(err) => {
                outcome.error = Some(err);
                return outcome;
            }
        };
        let caps = request.preset.capabilities();

        let submitted = if self.options.idempotent_submit {
            self.client
                .submit_task_idempotent(&body, &new_idempotency_key())
                .await
        } else {
            self.client.submit_task(&body).await
        };
        let response = match submitted {
            Ok(response) => response,
            Err(err) => {
                outcome.error = Some(err);
                return outcome;
            }
        };
        let task_id = match response.data.map(|data| data.task_id) {
            Some(task_id) if !task_id.is_empty() => task_id,
            _ => {
                outcome.error = Some(ClientError::Decode(
                    "submission succeeded but returned no task id".to_string(),
                ));
                return outcome;
            }
        };
        info!(event = "task_submitted", preset = %request.preset, task_id = %task_id);
        outcome.task_id = Some(task_id.clone());

        let wait_options = self
            .options
            .wait
            .clone()
            .unwrap_or_else(|| WaitOptions::for_output(caps.output));
        let data = match wait_for_result(&self.client, &body.req_key, &task_id, &wait_options).await
        {
            Ok(data) => data,
            Err(err) => {
                outcome.error = Some(err);
                return outcome;
            }
        };
        outcome.status = Some(data.status);

        if data.status != TaskStatus::Done {
            outcome.error = Some(ClientError::TaskFailed {
                task_id: task_id.clone(),
                status: data.status.to_string(),
            });
            return outcome;
        }

        let mut urls: Vec<String> = Vec::new();
        if let Some(video_url) = data.video_url.as_ref().filter(|u| !u.is_empty()) {
            urls.push(video_url.clone());
        }
        if let Some(image_urls) = data.image_urls.as_ref() {
            urls.extend(image_urls.iter().filter(|u| !u.is_empty()).cloned());
        }
        if urls.is_empty() {
            outcome.error = Some(ClientError::Download(
                "task is done but carries no result URL".to_string(),
            ));
            return outcome;
        }

        for url in urls {
            match download_to_dir(
                &self.http,
                &url,
                &self.options.out_dir,
                &task_id,
                self.options.overwrite,
            )
            .await
            {
                Ok(path) => outcome.files.push(path),
                Err(err) => {
                    warn!(event = "download_failed", task_id = %task_id, url = %url, error = %err);
                    if outcome.error.is_none() {
                        outcome.error = Some(err);
                    }
                }
            }
        }

        outcome
    }

    /// Serial batch execution with inter-submission spacing, so a batch
    /// does not trip the upstream's per-key concurrency policy.
    pub async fn run_batch(&self, requests: &[GenerationRequest]) -> Vec<GenerationOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            if index > 0 && !self.options.batch_spacing.is_zero() {
                tokio::time::sleep(self.options.batch_spacing).await;
            }
            outcomes.push(self.run(request).await);
        }
        outcomes
    }
}

/// Random 128-bit idempotency key, hex encoded.
fn new_idempotency_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes[..]);
    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
