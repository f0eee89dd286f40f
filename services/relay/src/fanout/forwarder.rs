//! Fan-out of client chunks to every connected target.
//!
//! One write per connected target runs concurrently; the call returns once
//! every write has finished or failed. Failures never propagate past their
//! own target:
//! - reset / broken pipe: the target is marked disconnected and left for the
//!   reconnection loop
//! - anything else: logged, connection kept
//!
//! Disconnected targets are skipped and the chunk is not queued for them.
//! Writes carry no timeout; a target that stops reading holds up the
//! forward until its socket errors.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use super::stats::RelayStats;
use super::target::{TargetAddr, TargetConnection, TargetRegistry};
use crate::error::is_disconnect_error;

/// Result of writing one chunk to one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Chunk written and flushed.
    Delivered,
    /// Connection was gone; the target is now disconnected.
    Disconnected,
    /// Write failed with a transient error; the connection is kept.
    Failed,
}

/// Per-call summary of a fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReport {
    pub delivered: usize,
    pub disconnected: usize,
    pub failed: usize,
}

impl ForwardReport {
    /// Number of targets a write was attempted on.
    pub fn attempted(&self) -> usize {
        self.delivered + self.disconnected + self.failed
    }
}

/// Replicates chunks to all connected targets.
pub struct Forwarder {
    registry: Arc<TargetRegistry>,
    stats: Arc<RelayStats>,
}

impl Forwarder {
    /// Create a forwarder over `registry`.
    pub fn new(registry: Arc<TargetRegistry>, stats: Arc<RelayStats>) -> Self {
        Self { registry, stats }
    }

    /// Registry the forwarder reads target state from.
    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Write `data` to every target that is connected right now.
    pub async fn forward(&self, data: &[u8]) -> ForwardReport {
        let targets = self.registry.connected();
        if targets.is_empty() {
            debug!(bytes = data.len(), "No connected targets, dropping chunk");
            return ForwardReport::default();
        }

        let outcomes = join_all(
            targets
                .iter()
                .map(|(addr, conn)| self.forward_to_target(addr, conn, data)),
        )
        .await;

        let mut report = ForwardReport::default();
        for outcome in outcomes {
            match outcome {
                ForwardOutcome::Delivered => report.delivered += 1,
                ForwardOutcome::Disconnected => report.disconnected += 1,
                ForwardOutcome::Failed => report.failed += 1,
            }
        }
        report
    }

    async fn forward_to_target(
        &self,
        addr: &TargetAddr,
        conn: &TargetConnection,
        data: &[u8],
    ) -> ForwardOutcome {
        let result = conn.send(data).await;
        self.settle(addr, conn.id(), data.len(), result)
    }

    /// Apply the result of one target write to the stats and the registry.
    fn settle(
        &self,
        addr: &TargetAddr,
        connection_id: u64,
        bytes: usize,
        result: io::Result<()>,
    ) -> ForwardOutcome {
        match result {
            Ok(()) => {
                self.stats
                    .target_writes_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                debug!(target_addr = %addr, bytes, "Data forwarded to target");
                ForwardOutcome::Delivered
            }
            Err(e) if is_disconnect_error(&e) => {
                self.stats.target_writes_failed.fetch_add(1, Ordering::Relaxed);
                // Only demote if no newer connection has replaced this one.
                if self
                    .registry
                    .disconnect_if_current(addr, connection_id)
                    .is_some()
                {
                    self.stats.targets_demoted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target_addr = %addr,
                        connection_id,
                        error = %e,
                        "Target connection closed, marking disconnected"
                    );
                }
                ForwardOutcome::Disconnected
            }
            Err(e) => {
                self.stats.target_writes_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target_addr = %addr,
                    error = %e,
                    "Failed to forward data to target"
                );
                ForwardOutcome::Failed
            }
        }
    }
}
