//! Error types for the relay.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Relay errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Could not bind the listening socket.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The accept loop hit a non-recoverable error.
    #[error("accept_failed: {0}")]
    Accept(#[source] io::Error),

    /// Target did not accept the connection within the connect timeout.
    #[error("connect_timeout: {addr} after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    /// Target refused or otherwise failed the connection.
    #[error("connect_failed: {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Address is not part of the configured target set.
    #[error("unknown_target: {0}")]
    UnknownTarget(String),

    /// A background task panicked or was cancelled.
    #[error("task_failed: {0}")]
    TaskFailed(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Bind { .. } => "bind_failed",
            RelayError::Accept(_) => "accept_failed",
            RelayError::ConnectTimeout { .. } => "connect_timeout",
            RelayError::Connect { .. } => "connect_failed",
            RelayError::UnknownTarget(_) => "unknown_target",
            RelayError::TaskFailed(_) => "task_failed",
            RelayError::Io(_) => "io_error",
        }
    }
}

/// Whether a write error means the target connection is gone.
///
/// Reset and broken-pipe errors demote the target; anything else is treated
/// as transient and leaves the connection in place.
pub fn is_disconnect_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

/// Whether an accept error only concerns the connection being accepted.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(io::ErrorKind::ConnectionReset, true)]
    #[case(io::ErrorKind::BrokenPipe, true)]
    #[case(io::ErrorKind::TimedOut, false)]
    #[case(io::ErrorKind::WouldBlock, false)]
    #[case(io::ErrorKind::ConnectionAborted, false)]
    #[case(io::ErrorKind::Other, false)]
    fn test_disconnect_classification(#[case] kind: io::ErrorKind, #[case] expected: bool) {
        assert_eq!(is_disconnect_error(&io::Error::from(kind)), expected);
    }

    #[rstest]
    #[case(io::ErrorKind::ConnectionAborted, true)]
    #[case(io::ErrorKind::Interrupted, true)]
    #[case(io::ErrorKind::AddrInUse, false)]
    #[case(io::ErrorKind::PermissionDenied, false)]
    fn test_accept_classification(#[case] kind: io::ErrorKind, #[case] expected: bool) {
        assert_eq!(is_transient_accept_error(&io::Error::from(kind)), expected);
    }

    #[test]
    fn test_reason_codes() {
        let err = RelayError::ConnectTimeout {
            addr: "10.0.0.1:9000".to_string(),
            timeout_ms: 5000,
        };
        assert_eq!(err.reason_code(), "connect_timeout");
        assert_eq!(err.to_string(), "connect_timeout: 10.0.0.1:9000 after 5000ms");

        let err = RelayError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(err.reason_code(), "io_error");
    }
}
