//! Client session handling.
//!
//! A session reads chunks from one inbound connection and hands each to the
//! forwarder before reading the next, so chunks reach every target in the
//! order they were read. The session ends on EOF, a read error, or when the
//! relay stops; the client socket is shut down on every exit path.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use super::forwarder::Forwarder;
use super::stats::RelayStats;
use super::stopped;

/// Maximum bytes read from a client per chunk.
pub const CHUNK_SIZE: usize = 4096;

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed its side.
    PeerClosed,
    /// The relay is shutting down.
    Stopped,
}

/// One accepted client connection.
pub struct ClientSession {
    stream: TcpStream,
    peer_addr: SocketAddr,
    forwarder: Arc<Forwarder>,
    stats: Arc<RelayStats>,
    chunk_size: usize,
}

impl ClientSession {
    /// Wrap an accepted client stream.
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        forwarder: Arc<Forwarder>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            stream,
            peer_addr,
            forwarder,
            stats,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Override the read chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Run the session to completion.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> io::Result<SessionEnd> {
        let result = self.pump(&mut shutdown).await;

        if let Err(e) = self.stream.shutdown().await {
            debug!(error = %e, "Client shutdown failed");
        }
        debug!(peer_addr = %self.peer_addr, "Client connection closed");

        result
    }

    async fn pump(&mut self, shutdown: &mut watch::Receiver<bool>) -> io::Result<SessionEnd> {
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            if *shutdown.borrow() {
                return Ok(SessionEnd::Stopped);
            }

            let n = tokio::select! {
                read = self.stream.read(&mut buf) => read?,
                _ = stopped(shutdown) => return Ok(SessionEnd::Stopped),
            };

            if n == 0 {
                return Ok(SessionEnd::PeerClosed);
            }

            self.stats.chunks_received.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_received
                .fetch_add(n as u64, Ordering::Relaxed);
            debug!(bytes = n, "Received data from client");

            let report = self.forwarder.forward(&buf[..n]).await;
            debug!(
                delivered = report.delivered,
                disconnected = report.disconnected,
                failed = report.failed,
                "Chunk fanned out"
            );
        }
    }
}
