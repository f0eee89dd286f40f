//! Reconnection loop for disconnected targets.
//!
//! Every interval the loop runs a connect pass over the targets that are
//! disconnected at that moment. Passes run one after another, so at most one
//! connect attempt per target is ever in flight from this loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::connector::TargetConnector;
use super::stopped;

/// Default delay between connect passes.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Run the reconnection loop until shutdown.
pub async fn run_reconnect_loop(
    connector: Arc<TargetConnector>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_ms = interval.as_millis() as u64,
        "Starting reconnection loop"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stopped(&mut shutdown) => break,
        }

        if *shutdown.borrow() {
            break;
        }

        debug!("Connection maintenance pass");
        let report = connector.connect_all().await;
        if report.attempted > 0 {
            debug!(
                attempted = report.attempted,
                connected = report.connected,
                still_disconnected = report.failed,
                "Reconnect pass finished"
            );
        }
    }

    info!("Reconnection loop shutting down");
}
