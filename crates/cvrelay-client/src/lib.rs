pub mod download;
pub mod error;
pub mod flow;
pub mod presets;
pub mod request;
pub mod transport;
pub mod waiter;

pub use download::{download_to_dir, sanitize_task_id};
pub use error::ClientError;
pub use flow::{FlowOptions, GenerationFlow, GenerationOutcome};
pub use presets::{Capabilities, OutputKind, Preset};
pub use request::{GenerationRequest, ImageInput};
pub use transport::{ClientConfig, RelayApi, RelayClient, RetryPolicy};
pub use waiter::{WaitOptions, wait_for_result};
