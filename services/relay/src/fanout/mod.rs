//! TCP fan-out relay.
//!
//! This module provides:
//! - The target registry (per-target connection state)
//! - Outbound connection management with a bounded connect timeout
//! - The periodic reconnection loop
//! - Concurrent fan-out of client chunks to connected targets
//! - Client session handling and the accept loop
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session -> Forwarder -> Target 1..N
//!                                      |
//!                       write failure: Registry <- Reconnection loop
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use fanout::{Forwarder, Listener, TargetConnector, TargetRegistry, RelayStats};
//!
//! let registry = Arc::new(TargetRegistry::new(targets));
//! let stats = Arc::new(RelayStats::default());
//! let connector = TargetConnector::new(Arc::clone(&registry), Arc::clone(&stats));
//! connector.connect_all().await;
//!
//! let forwarder = Arc::new(Forwarder::new(registry, Arc::clone(&stats)));
//! let listener = Listener::bind("0.0.0.0:9000".parse()?, forwarder, stats).await?;
//! listener.run(shutdown_rx).await?;
//! ```

mod connector;
mod forwarder;
mod listener;
mod reconnect;
mod session;
mod stats;
pub(crate) mod target;

pub use connector::{ConnectOutcome, ConnectPassReport, TargetConnector, DEFAULT_CONNECT_TIMEOUT};
pub use forwarder::{ForwardOutcome, ForwardReport, Forwarder};
pub use listener::Listener;
pub use reconnect::{run_reconnect_loop, DEFAULT_RECONNECT_INTERVAL};
pub use session::{ClientSession, SessionEnd, CHUNK_SIZE};
pub use stats::{RelayStats, RelayStatsSnapshot};
pub use target::{TargetAddr, TargetConnection, TargetRegistry, TargetSnapshot, TargetState};

use tokio::sync::watch;

/// Resolve once the stop flag is set.
///
/// A dropped sender means the controller is gone, which also counts as a
/// stop.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}
