pub mod presence;
pub mod registry;
pub mod router;
pub mod session;
pub mod state;

pub use presence::{PresenceNotifier, PresenceSource};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use router::MessageRouter;
pub use state::{GatewayContext, GatewayState, SessionSettings};

use chime_api::{ServiceError, ServiceResult};
use tracing::error;

/// Runs store work off the async runtime.
pub(crate) async fn blocking<F, T>(f: F) -> ServiceResult<T>
where
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ServiceError::Storage(anyhow::anyhow!("blocking task failed: {}", e))
    })?
}
