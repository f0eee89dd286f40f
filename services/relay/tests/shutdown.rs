
use std::time::{Duration, Instant};

use harness::{
    eventually, test_config, RecordingTarget, RelayHandle, SaturatedTarget, StalledTarget,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn shutdown_closes_targets_and_sessions() {
    let a = RecordingTarget::spawn().await.unwrap();
    let relay = RelayHandle::spawn(test_config(vec![a.target_addr()]))
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(1), || a.connection_count() == 1).await);

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"before").await.unwrap();
    assert_eq!(a.wait_for_len(6).await, b"before");

    let registry = std::sync::Arc::clone(&relay.registry);
    let stop_flag = relay.stop_flag.clone();
    assert!(!*stop_flag.borrow());

    timeout(Duration::from_secs(2), relay.shutdown())
        .await
        .expect("shutdown should finish within the grace period")
        .unwrap();

    assert!(*stop_flag.borrow());
    assert_eq!(registry.connected_count(), 0);

    // The target sees its connection closed.
    assert!(eventually(Duration::from_secs(1), || a.eof_count() == 1).await);

    // The idle client session was ended by the relay.
    let mut rest = Vec::new();
    let read = timeout(Duration::from_secs(1), client.read_to_end(&mut rest))
        .await
        .expect("client session should be closed");
    assert!(read.is_ok() || rest.is_empty());
}

#[tokio::test]
async fn shutdown_is_bounded_when_a_target_write_hangs() {
    let stalled = StalledTarget::spawn().await.unwrap();
    let mut config = test_config(vec![stalled.target_addr()]);
    config.grace_period = Duration::from_millis(300);

    let relay = RelayHandle::spawn(config).await.unwrap();
    assert!(relay.is_connected(&stalled.target_addr()));

    // Push far more than the socket buffers hold so the forward blocks.
    let relay_addr = relay.addr;
    let writer = tokio::spawn(async move {
        let mut client = TcpStream::connect(relay_addr).await?;
        let payload = vec![0u8; 32 * 1024 * 1024];
        client.write_all(&payload).await
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stop_flag = relay.stop_flag.clone();
    let started = Instant::now();
    timeout(Duration::from_secs(3), relay.shutdown())
        .await
        .expect("shutdown must not wait on a hung target")
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(*stop_flag.borrow());

    writer.abort();
}

#[tokio::test]
async fn shutdown_with_no_targets_or_clients() {
    let relay = RelayHandle::spawn(test_config(Vec::new())).await.unwrap();
    let addr = relay.addr;

    relay.shutdown().await.unwrap();

    // The listener is gone.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn connect_in_flight_at_shutdown_is_not_installed() {
    let mut saturated = SaturatedTarget::spawn().await.unwrap();
    let target = saturated.target_addr();

    let mut config = test_config(vec![target.clone()]);
    config.connect_timeout = Duration::from_millis(1500);
    config.reconnect_interval = Duration::from_millis(50);
    config.grace_period = Duration::from_secs(4);

    // The initial pass times out against the full backlog.
    let relay = RelayHandle::spawn(config).await.unwrap();
    assert!(!relay.is_connected(&target));

    // Let the reconnect loop start a dial that stalls in the handshake.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let attempts = relay.stats.snapshot().connect_attempts;
    assert!(attempts >= 2, "reconnect pass never started");

    let registry = std::sync::Arc::clone(&relay.registry);
    let stats = std::sync::Arc::clone(&relay.stats);

    // Accept while shutdown runs so a surviving dial would complete.
    let (result, ()) = tokio::join!(relay.shutdown(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        saturated.drain();
    });
    result.unwrap();

    assert!(eventually(Duration::from_secs(2), || saturated.accepted_count() >= 1).await);

    // Past the first SYN retransmit of any dial that was left running.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(registry.connected_count(), 0);
    assert_eq!(stats.snapshot().connect_successes, 0);
}
