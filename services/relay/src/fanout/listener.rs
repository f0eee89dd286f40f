//! TCP listener and session dispatch.
//!
//! Accepts client connections and runs each as an independent session task.
//! Errors that only concern the connection being accepted are logged and
//! skipped; any other accept error ends the listener with an error, which the
//! lifecycle controller treats as fatal.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument};

use super::forwarder::Forwarder;
use super::session::{ClientSession, CHUNK_SIZE};
use super::stats::RelayStats;
use super::stopped;
use crate::error::{is_transient_accept_error, RelayError};

/// Accepts clients and dispatches them to sessions.
pub struct Listener {
    listener: TcpListener,
    forwarder: Arc<Forwarder>,
    stats: Arc<RelayStats>,
    chunk_size: usize,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(
        bind_addr: SocketAddr,
        forwarder: Arc<Forwarder>,
        stats: Arc<RelayStats>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(bind_addr = %local_addr, "Listener bound");

        Ok(Self {
            listener,
            forwarder,
            stats,
            chunk_size: CHUNK_SIZE,
        })
    }

    /// Override the per-read chunk size for new sessions.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until the stop flag is set, then wait for open sessions
    /// to finish.
    ///
    /// Sessions see the same stop flag and end at their next read, so the
    /// drain is short unless a forward is stuck on a target write. Callers
    /// bound it with a timeout; dropping this future aborts the sessions.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let Self {
            listener,
            forwarder,
            stats,
            chunk_size,
        } = self;

        info!(bind_addr = %listener.local_addr()?, "Listener started");

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        stats.sessions_accepted.fetch_add(1, Ordering::Relaxed);
                        stats.sessions_active.fetch_add(1, Ordering::Relaxed);
                        debug!(peer_addr = %peer_addr, "New client connected");

                        let session = ClientSession::new(
                            stream,
                            peer_addr,
                            Arc::clone(&forwarder),
                            Arc::clone(&stats),
                        )
                        .with_chunk_size(chunk_size);
                        let stats = Arc::clone(&stats);
                        let shutdown = shutdown.clone();

                        sessions.spawn(
                            async move {
                                match session.run(shutdown).await {
                                    Ok(end) => debug!(end = ?end, "Session ended"),
                                    Err(e) => debug!(error = %e, "Error handling client"),
                                }
                                stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
                                stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
                            }
                            .instrument(tracing::info_span!("session", peer = %peer_addr)),
                        );
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        debug!(error = %e, "Transient accept error");
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        return Err(RelayError::Accept(e));
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Session task failed");
                    }
                }
                _ = stopped(&mut shutdown) => break,
            }
        }

        // Stop accepting before draining.
        drop(listener);
        info!(open_sessions = sessions.len(), "Listener stopped");

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Session task failed");
            }
        }

        Ok(())
    }
}
