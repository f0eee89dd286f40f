//! Relay lifecycle: startup, steady state and graceful shutdown.
//!
//! Startup dials every target once before the listener accepts any client,
//! so early traffic is not dropped for targets that are reachable. Shutdown
//! flips the stop flag, closes target connections, stops the listener and
//! waits for sessions, all within a fixed grace period.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::RelayError;
use crate::fanout::{
    run_reconnect_loop, Forwarder, Listener, RelayStats, TargetAddr, TargetConnection,
    TargetConnector, TargetRegistry, CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_RECONNECT_INTERVAL,
};

/// Default bound on the shutdown sequence.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Configuration for a TCP relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the listener binds to.
    pub bind_addr: SocketAddr,
    /// Targets in configuration order.
    pub targets: Vec<TargetAddr>,
    /// Timeout for each outbound connect.
    pub connect_timeout: Duration,
    /// Delay between reconnect passes.
    pub reconnect_interval: Duration,
    /// Bound on the shutdown sequence.
    pub grace_period: Duration,
    /// Maximum bytes read from a client per chunk.
    pub chunk_size: usize,
}

impl RelayConfig {
    /// Create a relay configuration with default timings.
    pub fn new(bind_addr: SocketAddr, targets: Vec<TargetAddr>) -> Self {
        Self {
            bind_addr,
            targets,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// A started TCP relay: targets dialed once and listener bound.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<TargetRegistry>,
    connector: Arc<TargetConnector>,
    listener: Listener,
    stats: Arc<RelayStats>,
    stop_tx: watch::Sender<bool>,
}

impl Relay {
    /// Initialize the registry, run the initial connect pass and bind the
    /// listener.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let stats = Arc::new(RelayStats::default());
        let registry = Arc::new(TargetRegistry::new(config.targets.iter().cloned()));
        let connector = Arc::new(TargetConnector::with_timeout(
            Arc::clone(&registry),
            Arc::clone(&stats),
            config.connect_timeout,
        ));

        info!(target_count = registry.len(), "Connecting to targets");
        let report = connector.connect_all().await;
        info!(
            connected = report.connected,
            disconnected = report.failed,
            "Initial connect pass complete"
        );

        let forwarder = Arc::new(Forwarder::new(Arc::clone(&registry), Arc::clone(&stats)));
        let listener = Listener::bind(config.bind_addr, forwarder, Arc::clone(&stats))
            .await?
            .with_chunk_size(config.chunk_size);

        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            connector,
            listener,
            stats,
            stop_tx,
        })
    }

    /// Get the local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared target registry.
    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Relay counters.
    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Subscribe to the stop flag (`true` once shutdown has begun).
    pub fn stop_flag(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Serve clients until `signal` resolves, then shut down.
    ///
    /// A failed accept loop also shuts the relay down, and its error is
    /// returned.
    pub async fn run<F>(self, signal: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        let Relay {
            config,
            registry,
            connector,
            listener,
            stats,
            stop_tx,
        } = self;

        let reconnect_task = tokio::spawn(
            run_reconnect_loop(connector, config.reconnect_interval, stop_tx.subscribe())
                .instrument(tracing::info_span!("reconnect")),
        );
        let mut listener_task = tokio::spawn(listener.run(stop_tx.subscribe()));

        let listener_exit = tokio::select! {
            _ = signal => {
                info!("Received shutdown signal");
                None
            }
            result = &mut listener_task => Some(result),
        };

        // A listener that already exited has nothing left to drain.
        let listener_task = listener_exit.is_none().then_some(listener_task);
        let result = match listener_exit {
            None | Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => {
                error!(error = %e, "Listener failed");
                Err(e)
            }
            Some(Err(e)) => Err(RelayError::TaskFailed(e.to_string())),
        };

        shutdown(
            &registry,
            &stop_tx,
            listener_task,
            reconnect_task,
            config.grace_period,
        )
        .await;

        let stats = stats.snapshot();
        info!(
            sessions_accepted = stats.sessions_accepted,
            bytes_received = stats.bytes_received,
            targets_demoted = stats.targets_demoted,
            "Relay stopped"
        );
        result
    }
}

/// Stop the relay within `grace_period`.
///
/// The registry is closed before anything is awaited, so a connect still in
/// flight cannot install a connection once the targets have been taken.
async fn shutdown(
    registry: &TargetRegistry,
    stop_tx: &watch::Sender<bool>,
    listener_task: Option<JoinHandle<Result<(), RelayError>>>,
    reconnect_task: JoinHandle<()>,
    grace_period: Duration,
) {
    info!(grace_ms = grace_period.as_millis() as u64, "Shutting down relay");
    stop_tx.send_replace(true);

    let connections = registry.close_all();
    reconnect_task.abort();
    let listener_abort = listener_task.as_ref().map(JoinHandle::abort_handle);

    let sequence = async {
        if let Err(e) = reconnect_task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Reconnection task failed during shutdown");
            }
        }

        close_targets(&connections).await;

        if let Some(listener_task) = listener_task {
            match listener_task.await {
                Ok(Ok(())) => debug!("Listener drained"),
                Ok(Err(e)) => warn!(error = %e, "Listener exited with error during shutdown"),
                Err(e) => warn!(error = %e, "Listener task failed during shutdown"),
            }
        }
    };

    if timeout(grace_period, sequence).await.is_err() {
        warn!("Shutdown grace period elapsed, abandoning remaining work");
        if let Some(listener_abort) = listener_abort {
            listener_abort.abort();
        }
    }
}

/// Close target connections concurrently, best-effort, so one stuck close
/// does not hold up the rest.
async fn close_targets(connections: &[(TargetAddr, TargetConnection)]) {
    if connections.is_empty() {
        return;
    }

    join_all(connections.iter().map(|(addr, conn)| async move {
        match conn.close().await {
            Ok(()) => debug!(target_addr = %addr, "Closed target connection"),
            Err(e) => warn!(target_addr = %addr, error = %e, "Error closing target connection"),
        }
    }))
    .await;
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
