pub mod config;
pub mod error;

pub use config::{ConfigError, RelayConfig, RelayConfigPatch, parse_duration};
pub use error::{ErrorBody, ErrorCode};
