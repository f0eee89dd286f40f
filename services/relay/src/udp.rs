//! UDP datagram fan-out.
//!
//! Stateless counterpart to the TCP relay: every datagram received on the
//! listening socket is sent to every configured target. There are no
//! connections to maintain, so a failed send is logged and forgotten.
//!
//! Datagrams leave through a separate ephemeral socket so replies from the
//! targets never arrive on the listening port and get relayed again.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::fanout::{stopped, TargetAddr, CHUNK_SIZE};

/// Datagram fan-out relay.
pub struct UdpRelay {
    ingress: UdpSocket,
    egress: UdpSocket,
    targets: Vec<TargetAddr>,
    chunk_size: usize,
}

impl UdpRelay {
    /// Bind the listening socket and an ephemeral egress socket of the same
    /// address family.
    pub async fn bind(bind_addr: SocketAddr, targets: Vec<TargetAddr>) -> Result<Self, RelayError> {
        let ingress = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: bind_addr,
                source,
            })?;

        let egress_addr = match bind_addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let egress = UdpSocket::bind(egress_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: egress_addr,
                source,
            })?;

        info!(
            bind_addr = %ingress.local_addr()?,
            target_count = targets.len(),
            "UDP listener bound"
        );

        Ok(Self {
            ingress,
            egress,
            targets,
            chunk_size: CHUNK_SIZE,
        })
    }

    /// Override the maximum datagram size read from the listening socket.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Get the local address the listening socket is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.ingress.local_addr()
    }

    /// Relay datagrams until `signal` resolves, then wait at most
    /// `grace_period` for the in-flight fan-out.
    pub async fn serve<F>(self, signal: F, grace_period: Duration) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut task = tokio::spawn(self.run(stop_rx));

        tokio::select! {
            _ = signal => info!("Received shutdown signal"),
            result = &mut task => {
                return result.map_err(|e| RelayError::TaskFailed(e.to_string()))?;
            }
        }

        stop_tx.send_replace(true);
        let abort = task.abort_handle();
        match timeout(grace_period, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(RelayError::TaskFailed(e.to_string())),
            Err(_) => {
                warn!("Shutdown grace period elapsed, abandoning UDP relay");
                abort.abort();
                Ok(())
            }
        }
    }

    /// Receive and fan out datagrams until the stop flag is set.
    ///
    /// A receive error ends the relay.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            debug!("Waiting for data");
            let (n, peer_addr) = tokio::select! {
                received = self.ingress.recv_from(&mut buf) => received?,
                _ = stopped(&mut shutdown) => break,
            };

            debug!(peer_addr = %peer_addr, bytes = n, "Received datagram");
            self.fan_out(&buf[..n]).await;
        }

        info!("UDP relay stopped");
        Ok(())
    }

    /// Send one datagram to every target concurrently, returning how many
    /// sends succeeded.
    pub async fn fan_out(&self, data: &[u8]) -> usize {
        let results = join_all(self.targets.iter().map(|target| async move {
            match self
                .egress
                .send_to(data, (target.host(), target.port()))
                .await
            {
                Ok(_) => {
                    debug!(target_addr = %target, "Data forwarded to target");
                    true
                }
                Err(e) => {
                    warn!(target_addr = %target, error = %e, "Failed to forward datagram");
                    false
                }
            }
        }))
        .await;

        results.into_iter().filter(|sent| *sent).count()
    }
}
