use serde::{Deserialize, Serialize};

use crate::types::TaskStatus;

/// Body of a `CVSync2AsyncGetResult` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResultRequestBody {
    pub req_key: String,
    pub task_id: String,
}

/// Task state and (when done) result locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResultData {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    /// Model-specific extra payload, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp_data: Option<String>,
}

impl GetResultData {
    /// Whether a `done` result actually carries something to download.
    ///
    /// The upstream occasionally flips to `done` before the result URL is
    /// materialized; callers treat that as an empty payload.
    pub fn has_payload(&self) -> bool {
        let images = self
            .image_urls
            .as_ref()
            .is_some_and(|urls| urls.iter().any(|u| !u.is_empty()));
        let video = self.video_url.as_ref().is_some_and(|u| !u.is_empty());
        images || video
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResultResponseBody {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<GetResultData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_elapsed: Option<String>,
}

impl GetResultResponseBody {
    pub fn is_success(&self) -> bool {
        self.code == crate::types::BUSINESS_SUCCESS && self.status == crate::types::BUSINESS_SUCCESS
    }

    pub fn failure_code(&self) -> Option<i64> {
        if self.code != crate::types::BUSINESS_SUCCESS {
            Some(self.code)
        } else if self.status != crate::types::BUSINESS_SUCCESS {
            Some(self.status)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_with_video_parses() {
        let json = r#"{"code":10000,"status":10000,"data":{"status":"done","video_url":"https://cdn.example/v.mp4"}}"#;
        let body: GetResultResponseBody = serde_json::from_str(json).unwrap();
        let data = body.data.unwrap();
        assert_eq!(data.status, TaskStatus::Done);
        assert!(data.has_payload());
    }

    #[test]
    fn done_with_empty_urls_has_no_payload() {
        let data = GetResultData {
            status: TaskStatus::Done,
            image_urls: Some(vec![String::new()]),
            video_url: None,
            resp_data: None,
        };
        assert!(!data.has_payload());
    }

    #[test]
    fn generating_round_trips() {
        let body = GetResultResponseBody {
            code: 10000,
            message: None,
            status: 10000,
            data: Some(GetResultData {
                status: TaskStatus::Generating,
                image_urls: None,
                video_url: None,
                resp_data: None,
            }),
            request_id: Some("r-2".to_string()),
            time_elapsed: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        let parsed: GetResultResponseBody = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, body);
    }
}
