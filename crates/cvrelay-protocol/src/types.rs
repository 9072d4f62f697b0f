use serde::{Deserialize, Serialize};

/// Upstream action names, carried in the `Action` query parameter.
pub const ACTION_SUBMIT_TASK: &str = "CVSync2AsyncSubmitTask";
pub const ACTION_GET_RESULT: &str = "CVSync2AsyncGetResult";

/// Upstream API version, carried in the `Version` query parameter.
pub const API_VERSION: &str = "2022-08-31";

/// Business success value for both the `code` and `status` envelope fields.
pub const BUSINESS_SUCCESS: i64 = 10000;

/// Rate-limit signals that must propagate as retryable errors.
pub const CODE_RATE_LIMITED_QPS: i64 = 50429;
pub const CODE_RATE_LIMITED_CONCURRENCY: i64 = 50430;

/// Entitlement/scope mismatch; not retryable, enriched with diagnostics.
pub const CODE_ENTITLEMENT: i64 = 50400;

pub fn is_rate_limit_code(code: i64) -> bool {
    code == CODE_RATE_LIMITED_QPS || code == CODE_RATE_LIMITED_CONCURRENCY
}

/// Task lifecycle as reported by `GetResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InQueue,
    Generating,
    Done,
    Failed,
    NotFound,
    Expired,
}

impl TaskStatus {
    /// A terminal status never transitions further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::NotFound | TaskStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::InQueue => "in_queue",
            TaskStatus::Generating => "generating",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::NotFound => "not_found",
            TaskStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Camera movement intensity for the recamera preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraStrength {
    Weak,
    Medium,
    Strong,
}

impl CameraStrength {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStrength::Weak => "weak",
            CameraStrength::Medium => "medium",
            CameraStrength::Strong => "strong",
        }
    }
}
