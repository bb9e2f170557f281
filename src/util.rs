//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::platform::{PlatformError, PlatformResult};
use crate::{Error, Result};

/// Run filesystem work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Bound a platform call by `duration`.
///
/// An expired deadline becomes `PlatformError::Timeout`, which is transient.
/// The call's future is dropped, so the backend may still complete it.
pub async fn with_deadline<F, T>(duration: Duration, call: F) -> PlatformResult<T>
where
    F: Future<Output = PlatformResult<T>>,
{
    match timeout(duration, call).await {
        Ok(result) => result,
        Err(_) => Err(PlatformError::Timeout(duration)),
    }
}
