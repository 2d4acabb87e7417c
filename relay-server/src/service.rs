//! Relay server service core logic.
//!
//! Owns the host, the settings store and the [`RelayServer`], drives the
//! heartbeat, and optionally runs a client role that mirrors another
//! relay into the same host.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_core::client::{BridgeConfig, RelayBridge};
use relay_core::host::{HostEvent, MemoryHost, SimulatedDevice, UpdateLock, update_lock};
use relay_core::protocol::JointRole;
use relay_core::server::{RelayHandler, RelayServer, local_ipv4_addresses};
use relay_core::settings::{JsonFileSettings, SettingsExt, SettingsStore, keys};
use relay_core::{ConnectionInfo, DeviceRegistry, RelayStatus};

use crate::config::RelayServerConfig;

const DEMO_SKELETON: [JointRole; 7] = [
    JointRole::Head,
    JointRole::SpineWaist,
    JointRole::HipLeft,
    JointRole::HipRight,
    JointRole::FootLeft,
    JointRole::FootRight,
    JointRole::ElbowLeft,
];

// ── RelayServerService ───────────────────────────────────────────

pub struct RelayServerService {
    config: RelayServerConfig,
    stop: CancellationToken,
}

impl RelayServerService {
    pub fn new(config: RelayServerConfig) -> Self {
        Self {
            config,
            stop: CancellationToken::new(),
        }
    }

    /// Cancel to stop the service from another task.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run until stopped.
    ///
    /// 1. Opens the settings store and builds the host.
    /// 2. Starts the RPC endpoint and the beacon.
    /// 3. Connects the co-located client role, if configured.
    /// 4. Ticks the heartbeat until the stop handle is cancelled.
    /// 5. Shuts the client role and the server down in order.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let settings: Arc<dyn SettingsStore> = Arc::new(JsonFileSettings::open(&self.config.settings.path)?);
        let host = Arc::new(MemoryHost::new());
        let lock = update_lock();

        for guid in &self.config.demo.devices {
            let device = Arc::new(SimulatedDevice::new(guid.clone(), guid.clone(), &DEMO_SKELETON));
            host.add_device(guid.clone(), format!("Simulated {guid}"), device);
        }

        let handler = Arc::new(RelayHandler::new(host.clone(), host.clone(), lock.clone()));
        let mut server = RelayServer::new(handler, self.config.to_server_config(settings.as_ref()));
        let addr = server.start().await?;
        settings.set(keys::SERVER_PORT, &addr.port())?;

        let ips: Vec<String> = local_ipv4_addresses().iter().map(|ip| ip.to_string()).collect();
        info!("relay server reachable at {} (port {})", ips.join(", "), addr.port());
        info!("status: {}", server.status().to_string().replace('\n', " | "));

        let bridge = if self.config.client.enabled {
            Some(self.start_client(host.clone(), settings.clone(), lock.clone(), addr.port()).await)
        } else {
            None
        };

        let mut events = host.subscribe();
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = interval.tick() => {
                    server.heartbeat().await;
                    update_relayed(&host).await;
                }
                event = events.recv() => match event {
                    Ok(HostEvent::ReloadDevices) => {
                        if let Some(bridge) = &bridge {
                            host.replace_relayed(bridge.relayed_devices().await);
                            server.handler().request_reload().await;
                        }
                    }
                    Ok(HostEvent::RequestExit { reason, fatal }) => {
                        warn!(reason, fatal, "exit requested");
                        break;
                    }
                    Ok(HostEvent::RefreshInterface) => {}
                    Err(e) => warn!(error = %e, "host event feed lagged"),
                },
            }
        }

        if let Some(bridge) = bridge {
            bridge.disconnect().await;
        }
        server.handler().request_client_shutdown("Relay server is shutting down", false).await;
        server.stop().await;
        info!("relay server service stopped");
        Ok(())
    }

    async fn start_client(
        &self,
        host: Arc<MemoryHost>,
        settings: Arc<dyn SettingsStore>,
        lock: UpdateLock,
        own_port: u16,
    ) -> Arc<RelayBridge> {
        let bridge = RelayBridge::new(
            host.clone(),
            settings.clone(),
            lock,
            BridgeConfig {
                local_server_port: Some(own_port),
                ..BridgeConfig::default()
            },
        );

        let address: String = settings.get_or(keys::CLIENT_IP, self.config.client.address.clone());
        let port: u16 = settings.get_or(keys::CLIENT_PORT, self.config.client.port);
        let status = bridge
            .initialize(ConnectionInfo::new(address, port), &self.stop)
            .await;
        match status {
            RelayStatus::Success => info!("client role relaying {} devices", bridge.exposed_devices().await.len()),
            RelayStatus::BackFeedDetected => warn!("client role disabled: it points at this server"),
            other => warn!(status = %other, "client role not connected: {}", bridge.status_text().description),
        }
        host.replace_relayed(bridge.relayed_devices().await);
        bridge
    }
}

/// Pull fresh joints for every relayed device.
async fn update_relayed(host: &MemoryHost) {
    for (_, device) in host.devices() {
        if device.is_relayed() {
            device.update().await;
        }
    }
}
