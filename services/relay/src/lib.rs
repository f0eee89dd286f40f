//! Fan-out relay.
//!
//! Accepts client connections on one port and replicates every byte received
//! to a fixed set of target servers over persistent outbound connections.
//! Targets fail and recover independently; neither the client nor the other
//! targets notice.

pub mod config;
pub mod error;
pub mod fanout;
pub mod lifecycle;
pub mod logging;
pub mod udp;

pub use error::RelayError;
pub use fanout::{
    ClientSession, ConnectOutcome, ConnectPassReport, ForwardOutcome, ForwardReport, Forwarder,
    Listener, RelayStats, RelayStatsSnapshot, SessionEnd, TargetAddr, TargetConnection,
    TargetConnector, TargetRegistry, TargetSnapshot, TargetState,
};
pub use lifecycle::{shutdown_signal, Relay, RelayConfig};
pub use udp::UdpRelay;
