//! Integration tests: beacon discovery, session round-trips, pushes,
//! shutdown and cache refresh over real sockets on localhost.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use relay_core::beacon::{Advertiser, Prober, ProberConfig};
use relay_core::cache::{CacheEvent, MergeOutcome};
use relay_core::client::{BridgeConfig, CONNECT_TIMEOUT, HostPushHandler, RelayBridge, RelayClient};
use relay_core::host::{HostEvent, MemoryHost, RELAY_DEVICE_GUID, SimulatedDevice, update_lock};
use relay_core::protocol::{JointRole, JointSnapshot};
use relay_core::settings::{MemorySettings, SettingsExt, keys};
use relay_core::{
    ConnectionInfo, DeviceRegistry, PushHandler, RelayError, RelayHandler, RelayServer, RelayService, RelayStatus, RemoteDeviceSnapshot,
    ServerConfig,
};
use tokio_util::sync::CancellationToken;

// ── Helpers ──────────────────────────────────────────────────────

const SKELETON: [JointRole; 3] = [JointRole::Head, JointRole::SpineWaist, JointRole::FootLeft];

fn joints(n: usize) -> Vec<JointSnapshot> {
    (0..n)
        .map(|i| JointSnapshot::new(format!("J{i}"), JointRole::Manual))
        .collect()
}

/// A free UDP port on loopback, so parallel tests never share a
/// discovery port.
fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn loopback_config() -> ServerConfig {
    ServerConfig {
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        discovery: None,
    }
}

/// A running server whose host has one simulated device.
async fn serve_one_device() -> (RelayServer, Arc<MemoryHost>, Arc<SimulatedDevice>, ConnectionInfo) {
    let host = Arc::new(MemoryHost::new());
    let sim = Arc::new(SimulatedDevice::new("SIM-1", "Sim", &SKELETON));
    host.add_device("SIM-1", "Simulated One", sim.clone());

    let handler = Arc::new(RelayHandler::new(host.clone(), host.clone(), update_lock()).with_hostname("me@box"));
    let mut server = RelayServer::new(handler, loopback_config());
    let addr = server.start().await.unwrap();
    (server, host, sim, addr.into())
}

async fn wait_for(host: &MemoryHost, event: HostEvent) {
    let mut rx = host.subscribe();
    if host.history().contains(&event) {
        return;
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(seen) = rx.recv().await {
            if seen == event {
                return;
            }
        }
    })
    .await
    .expect("host event not seen");
}

// ── Beacon ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_beacon_end_to_end() {
    let port = free_udp_port();

    let mut advertiser = Advertiser::new("X", 5000).with_discovery_port(port);
    advertiser.set_payload("hello");
    advertiser.start().await.unwrap();

    let mut config = ProberConfig::new("X");
    config.target = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.discovery_port = port;
    let mut prober = Prober::new(config).unwrap();
    let mut updates = prober.subscribe();
    prober.start().await.unwrap();

    let found = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            updates.changed().await.unwrap();
            let set = updates.borrow_and_update().clone();
            if !set.is_empty() {
                return set;
            }
        }
    })
    .await
    .expect("no beacon within 2s");

    assert_eq!(found.len(), 1);
    let location = found.iter().next().unwrap();
    assert_eq!(location.payload, "hello");
    assert_eq!(location.address.port(), 5000);

    prober.stop().await;
    advertiser.stop().await;
}

#[tokio::test]
async fn test_beacon_ignores_other_service_types() {
    let port = free_udp_port();

    let mut advertiser = Advertiser::new("Other", 5000).with_discovery_port(port);
    advertiser.start().await.unwrap();

    let mut config = ProberConfig::new("X");
    config.target = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.discovery_port = port;
    config.interval = Duration::from_millis(100);
    let mut prober = Prober::new(config).unwrap();
    prober.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(prober.locations().await.is_empty());

    prober.stop().await;
    advertiser.stop().await;
}

#[tokio::test]
async fn test_server_advertises_its_port() {
    let port = free_udp_port();
    let host = Arc::new(MemoryHost::new());
    let handler = Arc::new(RelayHandler::new(host.clone(), host, update_lock()));
    let mut server = RelayServer::new(
        handler,
        ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            discovery: Some(relay_core::server::DiscoveryConfig {
                service_type: relay_core::SERVICE_TYPE.into(),
                port,
            }),
        },
    );
    let addr = server.start().await.unwrap();

    let mut config = ProberConfig::new(relay_core::SERVICE_TYPE);
    config.target = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.discovery_port = port;
    let mut prober = Prober::new(config).unwrap();
    let mut updates = prober.subscribe();
    prober.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), updates.changed())
        .await
        .expect("no beacon")
        .unwrap();
    let set = prober.locations().await;
    let location = set.iter().next().unwrap();
    assert_eq!(location.address.port(), addr.port());
    assert_eq!(location.payload, addr.port().to_string());

    prober.stop().await;
    server.stop().await;
}

// ── Sessions ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_call_round_trips() {
    let (mut server, host, sim, info) = serve_one_device().await;
    host.add_device(RELAY_DEVICE_GUID, "Relay", Arc::new(SimulatedDevice::new(RELAY_DEVICE_GUID, "Relay", &[])));

    let client = RelayClient::connect(&info, CONNECT_TIMEOUT, None).await.unwrap();
    assert!(client.ping_service().await.unwrap() > 0);
    assert_eq!(client.get_remote_hostname().await.unwrap(), "me@box");

    let devices = client.list_tracking_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].guid, "SIM-1");
    assert_eq!(devices[0].name, "Simulated One");
    assert!(client.get_tracking_device("NOPE").await.unwrap().is_none());

    let joints = client.get_tracked_joints("SIM-1").await.unwrap().unwrap();
    assert_eq!(joints.len(), 3);
    assert_eq!(server.heartbeat().await, 1);
    assert_eq!(sim.update_count(), 1);

    let snap = client.device_initialize("SIM-1").await.unwrap().unwrap();
    assert!(snap.initialized);
    client.device_signal_joint("SIM-1", 2).await.unwrap();
    assert_eq!(sim.signals(), vec![2]);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_request_shutdown_reaches_server_host() {
    let (mut server, host, _, info) = serve_one_device().await;
    let client = RelayClient::connect(&info, CONNECT_TIMEOUT, None).await.unwrap();

    assert!(client.request_shutdown("operator", false).await.unwrap());
    assert!(host.history().contains(&HostEvent::RequestExit {
        reason: "operator".into(),
        fatal: false
    }));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_pushes_reach_pinged_clients() {
    let (mut server, _, _, info) = serve_one_device().await;
    let client_host = Arc::new(MemoryHost::new());
    let pushes: Arc<dyn PushHandler> = Arc::new(HostPushHandler::new(client_host.clone()));

    let pinged = RelayClient::connect(&info, CONNECT_TIMEOUT, Some(pushes.clone())).await.unwrap();
    let silent = RelayClient::connect(&info, CONNECT_TIMEOUT, Some(pushes)).await.unwrap();
    pinged.ping_service().await.unwrap();
    silent.get_remote_hostname().await.unwrap();

    assert_eq!(server.handler().request_reload().await, 1);
    wait_for(&client_host, HostEvent::RefreshInterface).await;

    assert_eq!(server.handler().request_client_shutdown("update", true).await, 1);
    wait_for(
        &client_host,
        HostEvent::RequestExit {
            reason: "update".into(),
            fatal: true,
        },
    )
    .await;

    pinged.close().await;
    silent.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_goodbye_releases_demand() {
    let (mut server, _, _, info) = serve_one_device().await;
    let client = RelayClient::connect(&info, CONNECT_TIMEOUT, None).await.unwrap();

    client.get_tracked_joints("SIM-1").await.unwrap();
    assert_eq!(server.handler().demanded().await, vec!["SIM-1".to_string()]);

    client.close().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.handler().demanded().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("demand not released");
    assert_eq!(server.heartbeat().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_stopped_server_fails_cleanly() {
    let (mut server, _, _, info) = serve_one_device().await;
    let client = RelayClient::connect(&info, CONNECT_TIMEOUT, None).await.unwrap();
    client.ping_service().await.unwrap();

    server.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(5), client.ping_service())
        .await
        .expect("call hung after stop");
    assert!(matches!(result, Err(RelayError::ChannelClosed)));

    let again = RelayClient::connect(&info, CONNECT_TIMEOUT, None).await;
    assert!(again.is_err());
}

// ── Bridge ───────────────────────────────────────────────────────

fn bridge_for(local_server_port: Option<u16>) -> (Arc<MemoryHost>, Arc<MemorySettings>, Arc<RelayBridge>) {
    let host = Arc::new(MemoryHost::new());
    let settings = Arc::new(MemorySettings::new());
    let bridge = RelayBridge::new(
        host.clone(),
        settings.clone(),
        update_lock(),
        BridgeConfig {
            local_server_port,
            ..BridgeConfig::default()
        },
    );
    (host, settings, bridge)
}

#[tokio::test]
async fn test_bridge_refresh_and_merge() {
    let (mut server, _, sim, info) = serve_one_device().await;
    let (host, settings, bridge) = bridge_for(None);

    let status = bridge.initialize(info, &CancellationToken::new()).await;
    assert_eq!(status, RelayStatus::Success);
    assert_eq!(bridge.hostname().as_deref(), Some("me@box"));
    assert!(bridge.ping_ms().is_some());
    assert!(host.history().contains(&HostEvent::ReloadDevices));

    let persisted: Vec<RemoteDeviceSnapshot> = settings.get_or(keys::CACHED_REMOTE_DEVICES, Vec::new());
    assert_eq!(persisted.len(), 1);
    assert_eq!(settings.get_or(keys::CACHED_RELAY_HOSTNAME, String::new()), "me@box");

    let exposed = bridge.exposed_devices().await;
    assert_eq!(exposed.len(), 1);
    assert_eq!(exposed[0].0, "TRACKINGRELAY:SIM-1");

    let id = bridge.cache().device("SIM-1").await.unwrap().joints.id();

    // same joint count: in place
    sim.set_joints(joints(3));
    bridge.update_device("SIM-1").await.unwrap();
    let cached = bridge.cache().device("SIM-1").await.unwrap();
    assert_eq!(cached.joints.id(), id);
    assert_eq!(cached.joints.joints()[0].name, "J0");

    // different count: rebuilt
    sim.set_joints(joints(5));
    let mut events = bridge.cache().subscribe();
    bridge.update_device("SIM-1").await.unwrap();
    let cached = bridge.cache().device("SIM-1").await.unwrap();
    assert_ne!(cached.joints.id(), id);
    assert_eq!(cached.joints.len(), 5);
    assert_eq!(
        events.recv().await.unwrap(),
        CacheEvent::Reset { guid: "SIM-1".into() }
    );
    assert_eq!(bridge.cache().merge_joints("SIM-1", joints(5)).await, Some(MergeOutcome::InPlace));

    bridge.disconnect().await;
    assert_eq!(bridge.status(), RelayStatus::Disconnected);
    // falls back to the persisted list
    assert_eq!(bridge.exposed_devices().await.len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_bridge_refresh_reports_joint_changes() {
    let (mut server, _, sim, info) = serve_one_device().await;
    let (_, _, bridge) = bridge_for(None);
    assert_eq!(bridge.initialize(info, &CancellationToken::new()).await, RelayStatus::Success);
    let id = bridge.cache().device("SIM-1").await.unwrap().joints.id();
    let mut events = bridge.cache().subscribe();

    // 3 -> 5 joints: the collection is rebuilt
    sim.set_joints(joints(5));
    assert_eq!(bridge.refresh(&CancellationToken::new()).await, RelayStatus::Success);
    assert_eq!(events.recv().await.unwrap(), CacheEvent::Reset { guid: "SIM-1".into() });
    assert_eq!(events.recv().await.unwrap(), CacheEvent::DevicesReplaced);
    let rebuilt = bridge.cache().device("SIM-1").await.unwrap().joints.id();
    assert_ne!(rebuilt, id);

    // 5 -> 5 joints: every index is updated in place
    assert_eq!(bridge.refresh(&CancellationToken::new()).await, RelayStatus::Success);
    for index in 0..5 {
        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::Updated {
                guid: "SIM-1".into(),
                index
            }
        );
    }
    assert_eq!(events.recv().await.unwrap(), CacheEvent::DevicesReplaced);
    assert_eq!(bridge.cache().device("SIM-1").await.unwrap().joints.id(), rebuilt);

    server.stop().await;
}

#[tokio::test]
async fn test_bridge_empty_list_keeps_cache() {
    let (mut server, server_host, _, info) = serve_one_device().await;
    let (_, _, bridge) = bridge_for(None);

    assert_eq!(bridge.initialize(info.clone(), &CancellationToken::new()).await, RelayStatus::Success);
    assert_eq!(bridge.cache().len().await, 1);

    server_host.remove_device("SIM-1");
    assert_eq!(bridge.refresh(&CancellationToken::new()).await, RelayStatus::DevicesListEmpty);
    assert_eq!(bridge.cache().len().await, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_bridge_detects_lost_connection() {
    let (mut server, _, _, info) = serve_one_device().await;
    let (_, _, bridge) = bridge_for(None);
    assert_eq!(bridge.initialize(info, &CancellationToken::new()).await, RelayStatus::Success);

    server.stop().await;
    assert!(bridge.update_device("SIM-1").await.is_err());
    assert_eq!(bridge.status(), RelayStatus::ConnectionLost);
    assert!(!bridge.exposed_devices().await.is_empty());
}

#[tokio::test]
async fn test_bridge_cancelled_initialize() {
    let (mut server, _, _, info) = serve_one_device().await;
    let (_, _, bridge) = bridge_for(None);

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(bridge.initialize(info, &cancel).await, RelayStatus::ConnectionError);

    server.stop().await;
}

#[tokio::test]
async fn test_backfeed_and_relayed_exclusion() {
    // Upstream server with a real device.
    let (mut upstream, _, _, upstream_info) = serve_one_device().await;

    // A node running both roles on one host.
    let host = Arc::new(MemoryHost::new());
    let settings = Arc::new(MemorySettings::new());
    let lock = update_lock();
    let handler = Arc::new(RelayHandler::new(host.clone(), host.clone(), lock.clone()));
    let mut server = RelayServer::new(handler, loopback_config());
    let own = server.start().await.unwrap();

    let bridge = RelayBridge::new(
        host.clone(),
        settings,
        lock,
        BridgeConfig {
            local_server_port: Some(own.port()),
            ..BridgeConfig::default()
        },
    );

    let looped = ConnectionInfo::new("127.0.0.1", own.port());
    assert!(server.is_backfeed(&looped));
    assert_eq!(
        bridge.initialize(looped, &CancellationToken::new()).await,
        RelayStatus::BackFeedDetected
    );

    assert_eq!(
        bridge.initialize(upstream_info, &CancellationToken::new()).await,
        RelayStatus::Success
    );
    host.replace_relayed(bridge.relayed_devices().await);
    host.add_device(RELAY_DEVICE_GUID, "Relay", Arc::new(SimulatedDevice::new(RELAY_DEVICE_GUID, "Relay", &[])));
    assert_eq!(host.devices().len(), 2);

    let client = RelayClient::connect(&own.into(), CONNECT_TIMEOUT, None).await.unwrap();
    assert!(client.list_tracking_devices().await.unwrap().is_empty());
    assert!(client.get_tracked_joints("TRACKINGRELAY:SIM-1").await.unwrap().is_none());

    client.close().await;
    bridge.disconnect().await;
    server.stop().await;
    upstream.stop().await;
}
