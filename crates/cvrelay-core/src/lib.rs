pub mod admission;
pub mod audit;
pub mod auth;
pub mod bootstrap;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handler;
pub mod idempotency;
pub mod keymgr;
pub mod secrets;
pub mod state;
pub mod upstream_client;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionPermit, KeyLockTable};
pub use audit::{AuditEventType, AuditRecorder};
pub use auth::{ApiKeyIdentity, Authenticator};
pub use engine::{ReceivedRequest, RelayAction, RelayEngine, RelayResponse};
pub use error::RelayError;
pub use handler::relay_router;
pub use keymgr::{CreatedKey, KeyManager};
pub use secrets::{SecretBox, SecretBoxError};
pub use state::AppState;
