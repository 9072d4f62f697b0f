use std::sync::Arc;

use cvrelay_common::RelayConfig;
use cvrelay_storage::Storage;

use crate::admission::AdmissionController;
use crate::audit::AuditRecorder;
use crate::auth::Authenticator;
use crate::dispatch::Dispatcher;
use crate::idempotency::IdempotencyResolver;

/// Everything a running relay instance holds. In-memory admission state is
/// instance-local; persistence goes through `storage`.
pub struct AppState {
    pub config: RelayConfig,
    pub storage: Arc<dyn Storage>,
    pub authenticator: Authenticator,
    pub admission: AdmissionController,
    pub dispatcher: Dispatcher,
    pub audit: AuditRecorder,
    pub idempotency: IdempotencyResolver,
}
