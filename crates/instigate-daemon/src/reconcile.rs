use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use instigate_core::storage::InstigatorStorage;
use instigate_core::tick::{Tick, TickError, TickErrorKind};

use crate::error::Result;
use crate::run_blocking;

pub const INTERRUPTED_MESSAGE: &str = "tick interrupted before completion; recovered by reconciliation";

/// Fail every STARTED tick that began more than `grace` before `now`.
/// Cursors stay where the last terminal tick left them. A second pass finds
/// nothing to do.
pub async fn reconcile_stale_ticks(
    storage: Arc<dyn InstigatorStorage>,
    grace: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<Tick>> {
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
    let older_than = now - grace;
    let error = TickError::new(TickErrorKind::Interrupted, INTERRUPTED_MESSAGE);
    let recovered =
        run_blocking(move || storage.fail_stale_ticks(older_than, &error, now)).await?;

    for tick in &recovered {
        tracing::warn!(
            tick = %tick.label(),
            started_at = %tick.started_at,
            "failed interrupted tick"
        );
    }
    if !recovered.is_empty() {
        tracing::info!(count = recovered.len(), "reconciliation finished");
    }
    Ok(recovered)
}
