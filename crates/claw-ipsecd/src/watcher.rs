//! Membership change detection.

use std::sync::Arc;
use std::time::Duration;

use claw_ipsec::Reconciler;
use tracing::{debug, info, warn};

/// How often the membership version is checked.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Polls the membership version and runs a reload whenever it changes.
///
/// The first tick fires immediately and always reloads. A version is only
/// remembered once its reload succeeded, so failures are retried every tick.
/// Never returns.
pub async fn watch_membership(reconciler: Arc<Reconciler>, interval: Duration) {
    let mut last: Option<String> = None;
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        let version = match reconciler.store().current_version() {
            Ok(version) => version,
            Err(e) => {
                warn!(error = %e, "failed to read membership version");
                continue;
            }
        };
        if last.as_deref() == Some(version.as_str()) {
            debug!(version = %version, "membership unchanged");
            continue;
        }

        info!(version = %version, "membership changed, reloading");
        let pass = Arc::clone(&reconciler);
        match tokio::task::spawn_blocking(move || pass.reload()).await {
            Ok(Ok(_)) => last = Some(version),
            Ok(Err(e)) => warn!(error = %e, "reload after membership change failed"),
            Err(e) => warn!(error = %e, "reload task failed"),
        }
    }
}
