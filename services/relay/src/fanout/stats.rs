//! Relay counters.
//!
//! Plain relaxed atomics updated on the hot path; `snapshot` copies them out
//! for logging and tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every relay component.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total client sessions accepted.
    pub sessions_accepted: AtomicU64,
    /// Client sessions currently open.
    pub sessions_active: AtomicU64,
    /// Client sessions closed.
    pub sessions_closed: AtomicU64,
    /// Chunks read from clients.
    pub chunks_received: AtomicU64,
    /// Bytes read from clients.
    pub bytes_received: AtomicU64,
    /// Per-target writes that completed.
    pub target_writes_succeeded: AtomicU64,
    /// Per-target writes that failed (any error class).
    pub target_writes_failed: AtomicU64,
    /// Targets moved to disconnected after a reset or broken pipe.
    pub targets_demoted: AtomicU64,
    /// Outbound connect attempts.
    pub connect_attempts: AtomicU64,
    /// Outbound connects that produced a new connection.
    pub connect_successes: AtomicU64,
}

/// Plain copy of [`RelayStats`] at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub sessions_accepted: u64,
    pub sessions_active: u64,
    pub sessions_closed: u64,
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub target_writes_succeeded: u64,
    pub target_writes_failed: u64,
    pub targets_demoted: u64,
    pub connect_attempts: u64,
    pub connect_successes: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            target_writes_succeeded: self.target_writes_succeeded.load(Ordering::Relaxed),
            target_writes_failed: self.target_writes_failed.load(Ordering::Relaxed),
            targets_demoted: self.targets_demoted.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_successes: self.connect_successes.load(Ordering::Relaxed),
        }
    }
}
