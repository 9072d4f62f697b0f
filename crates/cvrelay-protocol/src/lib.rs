pub mod get_result;
pub mod submit;
pub mod types;

pub use get_result::{GetResultData, GetResultRequestBody, GetResultResponseBody};
pub use submit::{SubmitTaskData, SubmitTaskRequestBody, SubmitTaskResponseBody};
pub use types::{
    ACTION_GET_RESULT, ACTION_SUBMIT_TASK, API_VERSION, BUSINESS_SUCCESS, CODE_ENTITLEMENT,
    CODE_RATE_LIMITED_CONCURRENCY, CODE_RATE_LIMITED_QPS, CameraStrength, TaskStatus,
    is_rate_limit_code,
};
