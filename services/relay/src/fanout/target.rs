//! Target registry.
//!
//! Every configured target address owns exactly one slot for the lifetime of
//! the process. A slot holds either `Disconnected` or a fully opened
//! connection, and is replaced with a single atomic pointer swap, so readers
//! never observe a connection that is half opened or half closed.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::RelayError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A downstream target endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    /// Hostname or IP literal (IPv6 without brackets).
    host: String,
    /// Target port.
    port: u16,
}

impl TargetAddr {
    /// Create a new target address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    /// Hostname or IP literal, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// An established outbound connection to a target.
///
/// Clones share the same stream. Writers serialize on the stream lock, so a
/// chunk is always written whole before the next one starts.
#[derive(Debug, Clone)]
pub struct TargetConnection {
    id: u64,
    stream: Arc<Mutex<TcpStream>>,
}

impl TargetConnection {
    /// Wrap a freshly connected stream.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Write the whole chunk and flush it.
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.write_all(data).await?;
        stream.flush().await
    }

    /// Shut down the write side. The socket itself is released when the last
    /// clone is dropped.
    pub async fn close(&self) -> io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.shutdown().await
    }
}

/// Connection state of a single target.
#[derive(Debug, Clone, Default)]
pub enum TargetState {
    #[default]
    Disconnected,
    Connected(TargetConnection),
}

impl TargetState {
    pub fn is_connected(&self) -> bool {
        matches!(self, TargetState::Connected(_))
    }

    pub fn connection(&self) -> Option<&TargetConnection> {
        match self {
            TargetState::Connected(conn) => Some(conn),
            TargetState::Disconnected => None,
        }
    }
}

/// Point-in-time view of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSnapshot {
    pub addr: TargetAddr,
    pub connected: bool,
    pub connection_id: Option<u64>,
}

struct TargetSlot {
    addr: TargetAddr,
    state: ArcSwap<TargetState>,
}

/// Shared record of every target's connection state.
///
/// The set of targets is fixed at construction; entries are only ever
/// transitioned between `Disconnected` and `Connected`. Once closed, no new
/// connection can be installed.
pub struct TargetRegistry {
    slots: Vec<TargetSlot>,
    index: HashMap<TargetAddr, usize>,
    closed: AtomicBool,
}

impl TargetRegistry {
    /// Create a registry with every target disconnected.
    ///
    /// Repeated addresses collapse into the first occurrence.
    pub fn new(targets: impl IntoIterator<Item = TargetAddr>) -> Self {
        let mut slots = Vec::new();
        let mut index = HashMap::new();

        for addr in targets {
            if index.contains_key(&addr) {
                warn!(target_addr = %addr, "Duplicate target address ignored");
                continue;
            }
            index.insert(addr.clone(), slots.len());
            slots.push(TargetSlot {
                addr,
                state: ArcSwap::from_pointee(TargetState::Disconnected),
            });
        }

        debug!(target_count = slots.len(), "Target registry initialized");

        Self {
            slots,
            index,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of distinct targets.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no targets are configured.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether `close_all` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Target addresses in configuration order.
    pub fn addrs(&self) -> impl Iterator<Item = &TargetAddr> {
        self.slots.iter().map(|slot| &slot.addr)
    }

    fn slot(&self, addr: &TargetAddr) -> Option<&TargetSlot> {
        self.index.get(addr).map(|&i| &self.slots[i])
    }

    /// Current state of a target, or `None` if it is not registered.
    pub fn get(&self, addr: &TargetAddr) -> Option<Arc<TargetState>> {
        self.slot(addr).map(|slot| slot.state.load_full())
    }

    /// Replace a target's state unconditionally, returning the previous one.
    pub fn set(
        &self,
        addr: &TargetAddr,
        state: TargetState,
    ) -> Result<Arc<TargetState>, RelayError> {
        let slot = self
            .slot(addr)
            .ok_or_else(|| RelayError::UnknownTarget(addr.to_string()))?;
        Ok(slot.state.swap(Arc::new(state)))
    }

    /// Install a connection if the target is still disconnected and the
    /// registry is open.
    ///
    /// Returns false (and drops `conn`) otherwise.
    pub fn connect_if_disconnected(&self, addr: &TargetAddr, conn: TargetConnection) -> bool {
        let Some(slot) = self.slot(addr) else {
            return false;
        };

        // Load before checking the flag: if `close_all` runs in between, its
        // swap invalidates `current` and the exchange below fails.
        let current = slot.state.load_full();
        if current.is_connected() || self.is_closed() {
            return false;
        }

        let prev = slot
            .state
            .compare_and_swap(&current, Arc::new(TargetState::Connected(conn)));
        Arc::ptr_eq(&*prev, &current)
    }

    /// Mark a target disconnected if `connection_id` is still its live
    /// connection.
    ///
    /// A stale id (the target was already demoted or has since reconnected)
    /// leaves the state alone and returns `None`.
    pub fn disconnect_if_current(
        &self,
        addr: &TargetAddr,
        connection_id: u64,
    ) -> Option<TargetConnection> {
        let slot = self.slot(addr)?;

        let current = slot.state.load_full();
        let conn = match &*current {
            TargetState::Connected(conn) if conn.id() == connection_id => conn.clone(),
            _ => return None,
        };

        let prev = slot
            .state
            .compare_and_swap(&current, Arc::new(TargetState::Disconnected));
        Arc::ptr_eq(&*prev, &current).then_some(conn)
    }

    /// Connected targets with their connections.
    pub fn connected(&self) -> Vec<(TargetAddr, TargetConnection)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                slot.state
                    .load()
                    .connection()
                    .map(|conn| (slot.addr.clone(), conn.clone()))
            })
            .collect()
    }

    /// Addresses of targets that are currently disconnected.
    pub fn disconnected(&self) -> Vec<TargetAddr> {
        self.slots
            .iter()
            .filter(|slot| !slot.state.load().is_connected())
            .map(|slot| slot.addr.clone())
            .collect()
    }

    /// Number of targets currently connected.
    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.load().is_connected())
            .count()
    }

    /// Close the registry and disconnect every target, returning the
    /// connections that were live.
    pub fn close_all(&self) -> Vec<(TargetAddr, TargetConnection)> {
        self.closed.store(true, Ordering::SeqCst);
        self.slots
            .iter()
            .filter_map(|slot| {
                let prev = slot.state.swap(Arc::new(TargetState::Disconnected));
                prev.connection()
                    .map(|conn| (slot.addr.clone(), conn.clone()))
            })
            .collect()
    }

    /// State of every target in configuration order.
    pub fn snapshot(&self) -> Vec<TargetSnapshot> {
        self.slots
            .iter()
            .map(|slot| {
                let state = slot.state.load();
                TargetSnapshot {
                    addr: slot.addr.clone(),
                    connected: state.is_connected(),
                    connection_id: state.connection().map(TargetConnection::id),
                }
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Connected loopback pair: (client side, accepted side).
    pub(crate) async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn addr(host: &str) -> TargetAddr {
        TargetAddr::new(host, 9000)
    }

    #[test]
    fn test_target_addr_display() {
        assert_eq!(addr("10.0.0.1").to_string(), "10.0.0.1:9000");
        assert_eq!(addr("relay.example.test").to_string(), "relay.example.test:9000");
        assert_eq!(addr("fd00::1").to_string(), "[fd00::1]:9000");
        assert_eq!(addr("[fd00::1]"), addr("fd00::1"));
    }

    #[test]
    fn test_registry_starts_disconnected() {
        let registry = TargetRegistry::new(vec![addr("10.0.0.1"), addr("10.0.0.2")]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(registry.disconnected(), vec![addr("10.0.0.1"), addr("10.0.0.2")]);
        assert!(!registry.get(&addr("10.0.0.1")).unwrap().is_connected());
        assert!(registry.get(&addr("10.0.0.9")).is_none());
    }

    #[test]
    fn test_registry_collapses_duplicates() {
        let registry = TargetRegistry::new(vec![
            addr("10.0.0.2"),
            addr("10.0.0.1"),
            addr("10.0.0.2"),
        ]);
        let addrs: Vec<_> = registry.addrs().cloned().collect();
        assert_eq!(addrs, vec![addr("10.0.0.2"), addr("10.0.0.1")]);
    }

    #[test]
    fn test_set_unknown_target() {
        let registry = TargetRegistry::new(vec![addr("10.0.0.1")]);
        let err = registry
            .set(&addr("10.0.0.2"), TargetState::Disconnected)
            .unwrap_err();
        assert_eq!(err.reason_code(), "unknown_target");
    }

    #[tokio::test]
    async fn test_connect_if_disconnected_is_idempotent() {
        let target = addr("10.0.0.1");
        let registry = TargetRegistry::new(vec![target.clone()]);

        let (first, _peer1) = loopback_pair().await;
        let first = TargetConnection::new(first);
        let first_id = first.id();
        assert!(registry.connect_if_disconnected(&target, first));

        let (second, _peer2) = loopback_pair().await;
        assert!(!registry.connect_if_disconnected(&target, TargetConnection::new(second)));

        let state = registry.get(&target).unwrap();
        assert_eq!(state.connection().map(TargetConnection::id), Some(first_id));
    }

    #[tokio::test]
    async fn test_disconnect_ignores_stale_connection() {
        let target = addr("10.0.0.1");
        let registry = TargetRegistry::new(vec![target.clone()]);

        let (stream, _peer) = loopback_pair().await;
        let conn = TargetConnection::new(stream);
        let id = conn.id();
        registry.set(&target, TargetState::Connected(conn)).unwrap();

        assert!(registry.disconnect_if_current(&target, id + 1000).is_none());
        assert!(registry.get(&target).unwrap().is_connected());

        let removed = registry.disconnect_if_current(&target, id).unwrap();
        assert_eq!(removed.id(), id);
        assert!(!registry.get(&target).unwrap().is_connected());

        // Second demotion of the same connection is a no-op.
        assert!(registry.disconnect_if_current(&target, id).is_none());
    }

    #[tokio::test]
    async fn test_close_all() {
        let a = addr("10.0.0.1");
        let b = addr("10.0.0.2");
        let registry = TargetRegistry::new(vec![a.clone(), b.clone()]);

        let (stream, _peer) = loopback_pair().await;
        registry
            .set(&a, TargetState::Connected(TargetConnection::new(stream)))
            .unwrap();

        let snapshot = registry.snapshot();
        assert!(snapshot[0].connected);
        assert!(snapshot[0].connection_id.is_some());
        assert!(!snapshot[1].connected);

        let taken = registry.close_all();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, a);
        assert_eq!(registry.connected_count(), 0);
        assert!(registry.is_closed());
    }

    #[tokio::test]
    async fn test_closed_registry_rejects_new_connections() {
        let target = addr("10.0.0.1");
        let registry = TargetRegistry::new(vec![target.clone()]);
        assert!(registry.close_all().is_empty());

        let (stream, _peer) = loopback_pair().await;
        assert!(!registry.connect_if_disconnected(&target, TargetConnection::new(stream)));
        assert_eq!(registry.connected_count(), 0);
    }
}
