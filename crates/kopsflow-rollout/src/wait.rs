//! Cancellable sleeps

use crate::error::{Result, RolloutError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `cancel` fires first
pub(crate) async fn sleep(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(RolloutError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(RolloutError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
