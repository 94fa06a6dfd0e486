//! Gateway Lifecycle Tests
//!
//! Drives a real gateway over loopback TCP the way the peer process does:
//! read the handshake file, call the entry point, register a watchdog on the
//! callback channel, then die and check the gateway notices.

use fluss_gateway::bridge::{FlussBridge, InMemoryConnector};
use fluss_gateway::config::{GatewayConfig, WatchdogConfig};
use fluss_gateway::gateway::{
    handshake, CallbackServer, GatewayHandle, GatewayObject, GatewayServer, HandshakeRecord,
    LivenessProbe, LivenessState, PeerClient, TerminationReason, WatchdogMonitor, WATCHDOG_KEY,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Helpers
// =============================================================================

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::test();
    config.watchdog = WatchdogConfig {
        registration_timeout: Duration::from_secs(2),
        ..WatchdogConfig::test()
    };
    config
}

async fn start(config: &GatewayConfig) -> GatewayHandle {
    let bridge = Arc::new(FlussBridge::new(Arc::new(InMemoryConnector::new())));
    GatewayServer::new(config.clone())
        .start(bridge)
        .await
        .expect("gateway should start")
}

fn spawn_monitor(
    handle: &GatewayHandle,
    config: &GatewayConfig,
    stop: CancellationToken,
) -> (JoinHandle<TerminationReason>, tokio::sync::watch::Receiver<LivenessState>) {
    let monitor = WatchdogMonitor::new(handle.registry(), config.watchdog.clone());
    let states = monitor.subscribe();
    let task = tokio::spawn(async move { monitor.run(stop).await });
    (task, states)
}

async fn connect_liveness(handle: &GatewayHandle, probe: Arc<LivenessProbe>) -> CallbackServer {
    let mut objects: HashMap<String, Arc<dyn GatewayObject>> = HashMap::new();
    objects.insert("p0".to_string(), probe);
    CallbackServer::connect(handle.endpoint().callback_addr(), objects)
        .await
        .expect("callback connect")
}

/// Wait until the gateway has pinged `probe` at least `n` times
async fn wait_for_pings(probe: &LivenessProbe, n: u64) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while probe.pings() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("gateway should ping the registered watchdog");
}

async fn wait_for_state(
    states: &mut tokio::sync::watch::Receiver<LivenessState>,
    wanted: LivenessState,
) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while *states.borrow_and_update() != wanted {
            if states.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("watchdog should reach the expected state");
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_handshake_publishes_live_ports() {
    let config = config();
    let handle = start(&config).await;
    let endpoint = handle.endpoint();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conn_info");
    handshake::publish(&path, &HandshakeRecord::new(endpoint.port, endpoint.callback_port))
        .unwrap();

    let (mut client, record) = PeerClient::connect_from_handshake(&path, config.host)
        .await
        .unwrap();
    assert_eq!(record.listener_port, endpoint.port);
    assert_eq!(record.callback_port, endpoint.callback_port);
    assert_ne!(record.listener_port, record.callback_port);

    let connected = client.call_entry("is_connected", vec![]).await.unwrap();
    assert_eq!(connected, json!(false));

    handle.shutdown().await;
}

// =============================================================================
// Watchdog
// =============================================================================

#[tokio::test]
async fn test_peer_death_terminates_gateway() {
    let config = config();
    let handle = start(&config).await;
    let (task, mut states) = spawn_monitor(&handle, &config, CancellationToken::new());

    let probe = Arc::new(LivenessProbe::new());
    let callbacks = connect_liveness(&handle, probe.clone()).await;
    let mut client = PeerClient::connect(handle.endpoint().addr()).await.unwrap();
    client.register(WATCHDOG_KEY, "p0").await.unwrap();

    wait_for_state(&mut states, LivenessState::Polling).await;
    wait_for_pings(&probe, 3).await;
    assert!(!task.is_finished(), "a live peer keeps the gateway up");

    // Peer process goes away
    callbacks.stop().await;

    let reason = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("watchdog should notice the dead peer")
        .unwrap();
    assert_eq!(reason, TerminationReason::PeerDead);
    assert_eq!(reason.exit_code(), 1);

    handle.shutdown().await;
    assert!(handle.is_shut_down());
}

#[tokio::test]
async fn test_peer_reporting_dead_terminates_gateway() {
    let config = config();
    let handle = start(&config).await;
    let (task, mut states) = spawn_monitor(&handle, &config, CancellationToken::new());

    let probe = Arc::new(LivenessProbe::new());
    let _callbacks = connect_liveness(&handle, probe.clone()).await;
    let mut client = PeerClient::connect(handle.endpoint().addr()).await.unwrap();
    client.register(WATCHDOG_KEY, "p0").await.unwrap();
    wait_for_state(&mut states, LivenessState::Polling).await;
    wait_for_pings(&probe, 1).await;

    probe.set_alive(false);

    let reason = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, TerminationReason::PeerDead);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_register_before_callback_connection_opens() {
    let mut config = config();
    config.watchdog.check_interval = Duration::from_millis(1);

    for _ in 0..10 {
        let handle = start(&config).await;
        let (task, _states) = spawn_monitor(&handle, &config, CancellationToken::new());

        // Register first; the callback connection comes later
        let mut client = PeerClient::connect(handle.endpoint().addr()).await.unwrap();
        client.register(WATCHDOG_KEY, "p0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished(), "an unopened callback channel is not a dead peer");

        let probe = Arc::new(LivenessProbe::new());
        let callbacks = connect_liveness(&handle, probe.clone()).await;
        wait_for_pings(&probe, 3).await;
        assert!(!task.is_finished(), "a live peer keeps the gateway up");

        callbacks.stop().await;
        let reason = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, TerminationReason::PeerDead);
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn test_callback_connection_never_opened_terminates_gateway() {
    let mut config = GatewayConfig::test();
    config.watchdog.registration_timeout = Duration::from_millis(100);
    let handle = start(&config).await;
    let (task, _states) = spawn_monitor(&handle, &config, CancellationToken::new());

    let mut client = PeerClient::connect(handle.endpoint().addr()).await.unwrap();
    client.register(WATCHDOG_KEY, "p0").await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, TerminationReason::NoWatchdogRegistered);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_no_registration_terminates_gateway() {
    let mut config = GatewayConfig::test();
    config.watchdog.registration_timeout = Duration::from_millis(100);
    let handle = start(&config).await;
    let (task, _states) = spawn_monitor(&handle, &config, CancellationToken::new());

    // A peer that connects but never registers does not count
    let mut client = PeerClient::connect(handle.endpoint().addr()).await.unwrap();
    client.call_entry("list_databases", vec![]).await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, TerminationReason::NoWatchdogRegistered);
    assert_eq!(reason.exit_code(), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_local_shutdown_exits_cleanly() {
    let config = config();
    let handle = start(&config).await;
    let stop = handle.shutdown_token().child_token();
    let (task, mut states) = spawn_monitor(&handle, &config, stop.clone());

    let _callbacks = connect_liveness(&handle, Arc::new(LivenessProbe::new())).await;
    let mut client = PeerClient::connect(handle.endpoint().addr()).await.unwrap();
    client.register(WATCHDOG_KEY, "p0").await.unwrap();
    wait_for_state(&mut states, LivenessState::Polling).await;

    stop.cancel();
    let reason = task.await.unwrap();
    assert_eq!(reason, TerminationReason::Shutdown);
    assert_eq!(reason.exit_code(), 0);
    handle.shutdown().await;
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_twice_and_sessions_closed() {
    let config = config();
    let handle = start(&config).await;
    let addr = handle.endpoint().addr();

    let mut client = PeerClient::connect(addr).await.unwrap();
    client
        .call_entry("connect", vec![json!("localhost:9123")])
        .await
        .unwrap();

    handle.shutdown().await;
    handle.shutdown().await;
    assert!(handle.is_shut_down());
    assert!(handle.registry().names().is_empty());
    assert!(handle.objects().is_empty());

    assert!(client.call_entry("is_connected", vec![]).await.is_err());
    assert!(PeerClient::connect(addr).await.is_err());
}
