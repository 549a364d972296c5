use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::service::RuleApplicationService;

/// Periodically delete expired job records until `shutdown` fires. The first
/// sweep runs immediately.
pub async fn run_retention_sweeper(
    service: RuleApplicationService,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "job retention sweeper started");
    loop {
        match service.prune_expired().await {
            Ok(0) => debug!("no expired rule application jobs"),
            Ok(removed) => info!(removed, "pruned expired rule application jobs"),
            Err(err) => warn!(error = %err, "job retention sweep failed"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
    info!("job retention sweeper stopped");
}
