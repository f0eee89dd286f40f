//! Outbound connection management.
//!
//! The connector dials disconnected targets and installs the resulting
//! connection in the registry. Dialing a target that is already connected is
//! a no-op, so callers can run a full pass without knowing which targets are
//! healthy.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::stats::RelayStats;
use super::target::{TargetAddr, TargetConnection, TargetRegistry};
use crate::error::RelayError;

/// Default connect timeout for target connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a single connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection was installed.
    Connected,
    /// The target already had a connection; nothing was dialed or replaced.
    AlreadyConnected,
    /// The attempt failed; the target stays disconnected.
    Failed,
}

/// Summary of a connect pass over all disconnected targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectPassReport {
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
}

/// Dials targets and records new connections in the registry.
pub struct TargetConnector {
    registry: Arc<TargetRegistry>,
    stats: Arc<RelayStats>,
    connect_timeout: Duration,
}

impl TargetConnector {
    /// Create a connector with the default connect timeout.
    pub fn new(registry: Arc<TargetRegistry>, stats: Arc<RelayStats>) -> Self {
        Self::with_timeout(registry, stats, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create a connector with a custom connect timeout.
    pub fn with_timeout(
        registry: Arc<TargetRegistry>,
        stats: Arc<RelayStats>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            stats,
            connect_timeout,
        }
    }

    /// Registry the connector installs connections into.
    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Connect a single target unless it is already connected.
    ///
    /// Failures are logged and leave the target disconnected.
    pub async fn connect(&self, addr: &TargetAddr) -> ConnectOutcome {
        match self.registry.get(addr) {
            Some(state) if state.is_connected() => return ConnectOutcome::AlreadyConnected,
            Some(_) => {}
            None => {
                warn!(target_addr = %addr, "Refusing to connect unregistered target");
                return ConnectOutcome::Failed;
            }
        }

        self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let stream = match self.try_connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    target_addr = %addr,
                    error = %e,
                    reason = e.reason_code(),
                    "Failed to connect to target"
                );
                return ConnectOutcome::Failed;
            }
        };

        let conn = TargetConnection::new(stream);
        let connection_id = conn.id();

        if self.registry.connect_if_disconnected(addr, conn) {
            self.stats.connect_successes.fetch_add(1, Ordering::Relaxed);
            info!(target_addr = %addr, connection_id, "Connected to target");
            ConnectOutcome::Connected
        } else if self.registry.is_closed() {
            debug!(target_addr = %addr, "Relay is stopping, dropping new connection");
            ConnectOutcome::Failed
        } else {
            debug!(
                target_addr = %addr,
                "Target connected concurrently, dropping duplicate connection"
            );
            ConnectOutcome::AlreadyConnected
        }
    }

    /// Attempt every disconnected target concurrently.
    ///
    /// Each attempt is isolated: a slow or failing target does not cancel the
    /// others, and the pass completes once all attempts have finished.
    pub async fn connect_all(&self) -> ConnectPassReport {
        let pending = self.registry.disconnected();
        if pending.is_empty() {
            return ConnectPassReport::default();
        }

        let outcomes = join_all(pending.iter().map(|addr| self.connect(addr))).await;

        let mut report = ConnectPassReport {
            attempted: pending.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                ConnectOutcome::Connected => report.connected += 1,
                ConnectOutcome::Failed => report.failed += 1,
                ConnectOutcome::AlreadyConnected => {}
            }
        }

        debug!(
            attempted = report.attempted,
            connected = report.connected,
            failed = report.failed,
            "Connect pass complete"
        );

        report
    }

    /// Dial a target within the connect timeout.
    async fn try_connect(&self, addr: &TargetAddr) -> Result<TcpStream, RelayError> {
        debug!(target_addr = %addr, "Connecting to target");

        match timeout(
            self.connect_timeout,
            TcpStream::connect((addr.host(), addr.port())),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(RelayError::Connect {
                addr: addr.to_string(),
                source,
            }),
            Err(_) => Err(RelayError::ConnectTimeout {
                addr: addr.to_string(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            }),
        }
    }
}
