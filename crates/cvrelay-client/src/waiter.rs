use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use cvrelay_protocol::{GetResultData, GetResultRequestBody, TaskStatus};

use crate::error::ClientError;
use crate::presets::OutputKind;
use crate::transport::RelayApi;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const EMPTY_PAYLOAD_RETRIES: u32 = 3;
const EMPTY_PAYLOAD_DELAY: Duration = Duration::from_millis(500);

/// Polling cadence and hard deadline for one task.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl WaitOptions {
    pub fn for_output(kind: OutputKind) -> Self {
        let timeout = match kind {
            OutputKind::Image => Duration::from_secs(60),
            OutputKind::Video => Duration::from_secs(5 * 60),
        };
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        // A zero interval would busy-spin against the relay.
        self.poll_interval = if interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::for_output(OutputKind::Video)
    }
}

/// Poll `GetResult` until the task reaches a terminal status or the hard
/// timeout expires. Returns the terminal result data; the caller decides
/// what a non-`done` terminal means.
///
/// A `done` result with an empty payload is re-fetched up to three times at
/// half-second spacing; the upstream occasionally marks `done` before the
/// result URL is materialized.
pub async fn wait_for_result(
    api: &dyn RelayApi,
    req_key: &str,
    task_id: &str,
    options: &WaitOptions,
) -> Result<GetResultData, ClientError> {
    let started = Instant::now();
    let request = GetResultRequestBody {
        req_key: req_key.to_string(),
        task_id: task_id.to_string(),
    };

    loop {
        let data = fetch(api, &request).await?;
        debug!(
            event = "poll_result",
            task_id,
            status = %data.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );

        if data.status == TaskStatus::Done && !data.has_payload() {
            return backfill_payload(api, &request, data).await;
        }
        if data.status.is_terminal() {
            return Ok(data);
        }

        if started.elapsed() + options.poll_interval >= options.timeout {
            return Err(ClientError::WaitTimeout {
                task_id: task_id.to_string(),
                elapsed_secs: started.elapsed().as_secs(),
            });
        }
        tokio::time::sleep(options.poll_interval).await;
    }
}

async fn fetch(
    api: &dyn RelayApi,
    request: &GetResultRequestBody,
) -> Result<GetResultData, ClientError> {
    let response = api.get_result(request).await?;
    if !response.is_success() {
        let code = response.failure_code().unwrap_or_default();
        return Err(ClientError::Decode(format!(
            "get-result returned business code {code}"
        )));
    }
    response
        .data
        .ok_or_else(|| ClientError::Decode("get-result response carries no data".to_string()))
}

async fn backfill_payload(
    api: &dyn RelayApi,
    request: &GetResultRequestBody,
    mut data: GetResultData,
) -> Result<GetResultData, ClientError> {
    for _ in 0..EMPTY_PAYLOAD_RETRIES {
        tokio::time::sleep(EMPTY_PAYLOAD_DELAY).await;
        data = fetch(api, request).await?;
        if data.has_payload() {
            break;
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cvrelay_protocol::{
        GetResultResponseBody, SubmitTaskRequestBody, SubmitTaskResponseBody,
    };

    struct ScriptedApi {
        calls: AtomicUsize,
        script: Mutex<Vec<GetResultResponseBody>>,
    }

    impl ScriptedApi {
        fn new(script: Vec<GetResultResponseBody>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RelayApi for ScriptedApi {
        async fn submit_task(
            &self,
            _body: &SubmitTaskRequestBody,
        ) -> Result<SubmitTaskResponseBody, ClientError> {
            unreachable!("waiter never submits")
        }

        async fn get_result(
            &self,
            _body: &GetResultRequestBody,
        ) -> Result<GetResultResponseBody, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                panic!("polled more often than scripted");
            }
            Ok(script.remove(0))
        }
    }

    fn response(status: TaskStatus, video_url: Option<&str>) -> GetResultResponseBody {
        GetResultResponseBody {
            code: 10000,
            message: None,
            status: 10000,
            data: Some(GetResultData {
                status,
                image_urls: None,
                video_url: video_url.map(|s| s.to_string()),
                resp_data: None,
            }),
            request_id: None,
            time_elapsed: None,
        }
    }

    fn fast_options() -> WaitOptions {
        WaitOptions::default().with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn returns_after_exactly_three_polls() {
        let api = ScriptedApi::new(vec![
            response(TaskStatus::InQueue, None),
            response(TaskStatus::Generating, None),
            response(TaskStatus::Done, Some("https://cdn.example/v.mp4")),
        ]);

        let data = wait_for_result(&api, "jimeng_ti2v_v30", "task-6", &fast_options())
            .await
            .unwrap();

        assert_eq!(data.status, TaskStatus::Done);
        assert_eq!(data.video_url.as_deref(), Some("https://cdn.example/v.mp4"));
        assert_eq!(api.calls(), 3, "a fourth poll must never happen");
    }

    #[tokio::test]
    async fn non_done_terminals_are_returned_not_polled_past() {
        let api = ScriptedApi::new(vec![
            response(TaskStatus::InQueue, None),
            response(TaskStatus::Failed, None),
        ]);

        let data = wait_for_result(&api, "jimeng_ti2v_v30", "task-7", &fast_options())
            .await
            .unwrap();
        assert_eq!(data.status, TaskStatus::Failed);
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn empty_done_payload_triggers_followup_fetches() {
        let api = ScriptedApi::new(vec![
            response(TaskStatus::Done, None),
            response(TaskStatus::Done, None),
            response(TaskStatus::Done, Some("https://cdn.example/late.mp4")),
        ]);

        let data = wait_for_result(&api, "jimeng_ti2v_v30", "task-8", &fast_options())
            .await
            .unwrap();
        assert_eq!(data.video_url.as_deref(), Some("https://cdn.example/late.mp4"));
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn empty_payload_gives_up_after_three_followups() {
        let api = ScriptedApi::new(vec![
            response(TaskStatus::Done, None),
            response(TaskStatus::Done, None),
            response(TaskStatus::Done, None),
            response(TaskStatus::Done, None),
        ]);

        let data = wait_for_result(&api, "jimeng_ti2v_v30", "task-9", &fast_options())
            .await
            .unwrap();
        assert_eq!(data.status, TaskStatus::Done);
        assert!(!data.has_payload());
        assert_eq!(api.calls(), 4, "initial fetch plus three follow-ups");
    }

    #[tokio::test]
    async fn hard_timeout_expires() {
        let forever: Vec<GetResultResponseBody> = (0..50)
            .map(|_| response(TaskStatus::Generating, None))
            .collect();
        let api = ScriptedApi::new(forever);
        let options = WaitOptions::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_timeout(Duration::from_millis(100));

        let err = wait_for_result(&api, "jimeng_ti2v_v30", "task-10", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::WaitTimeout { .. }));
    }

    #[test]
    fn zero_poll_interval_is_coerced() {
        let options = WaitOptions::default().with_poll_interval(Duration::ZERO);
        assert_eq!(options.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn default_timeouts_by_output_kind() {
        assert_eq!(
            WaitOptions::for_output(OutputKind::Image).timeout,
            Duration::from_secs(60)
        );
        assert_eq!(
            WaitOptions::for_output(OutputKind::Video).timeout,
            Duration::from_secs(300)
        );
    }
}
