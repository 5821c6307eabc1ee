//! Deadline helpers. A zero timeout means "wait forever".

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Result, SocketError};

pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

/// Run `fut` until `deadline`, failing with `Timeout { operation }` on expiry.
pub(crate) async fn wait_until<F: Future>(
    deadline: Option<Instant>,
    fut: F,
    operation: &'static str,
) -> Result<F::Output> {
    match deadline {
        None => Ok(fut.await),
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| SocketError::timeout(operation)),
    }
}
