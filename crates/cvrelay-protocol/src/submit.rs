use serde::{Deserialize, Serialize};

use crate::types::CameraStrength;

/// Body of a `CVSync2AsyncSubmitTask` call.
///
/// `req_key` selects the model preset; the optional fields are only
/// meaningful for presets whose capability record accepts them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitTaskRequestBody {
    pub req_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Inlined image payloads, base64 without a data-URL header.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binary_data_base64: Vec<String>,
    /// Remote image inputs, passed through untouched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_strength: Option<CameraStrength>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitTaskData {
    pub task_id: String,
}

/// Upstream response envelope for a submission.
///
/// `code` and `status` both equal 10000 on success; business failures ride
/// inside a 200 with a non-success pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitTaskResponseBody {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SubmitTaskData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_elapsed: Option<String>,
}

impl SubmitTaskResponseBody {
    pub fn is_success(&self) -> bool {
        self.code == crate::types::BUSINESS_SUCCESS && self.status == crate::types::BUSINESS_SUCCESS
    }

    /// The first non-success business code, if any.
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
