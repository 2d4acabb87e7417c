//! Relay client: entry point.
//!
//! ```text
//! relay-client                        Discover a server and list its devices
//! relay-client --server <host:port>   Connect to a specific server
//! relay-client --discover             Only list servers answering the beacon
//! relay-client --watch                Keep pulling joints until Ctrl-C
//! relay-client --gen-config           Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_core::host::{HostEvent, MemoryHost, update_lock};
use relay_core::settings::{JsonFileSettings, SettingsStore};
use relay_core::{ConnectionInfo, RelayBridge, RelayStatus};

use relay_client::config::ClientConfig;
use relay_client::{discovery, display};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "relay-client", about = "Tracking relay client")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "relay-client.toml")]
    config: PathBuf,

    /// Server address (overrides config). Example: 192.168.1.20:10042
    #[arg(short, long)]
    server: Option<String>,

    /// List the servers answering the beacon and exit.
    #[arg(long)]
    discover: bool,

    /// Keep pulling joints and reprinting until Ctrl-C.
    #[arg(short, long)]
    watch: bool,

    /// Re-enable a blacklisted remote device.
    #[arg(long, value_name = "GUID")]
    enable: Vec<String>,

    /// Hide a remote device from the host.
    #[arg(long, value_name = "GUID")]
    disable: Vec<String>,

    /// Ask the connected server to shut down.
    #[arg(long)]
    shutdown_server: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ClientConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ClientConfig::load(&cli.config);
    if let Some(server) = &cli.server {
        config.set_server(server);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("relay-client v{}", env!("CARGO_PKG_VERSION"));

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received, shutting down");
            stop.cancel();
        });
    }

    if cli.discover || config.server.address.is_empty() {
        let found = discovery::discover(&config.discovery, config.discovery_wait()).await?;
        print!("{}", display::render_locations(&found));
        if cli.discover {
            return Ok(());
        }
        match discovery::pick(&found) {
            Some(target) => {
                config.server.address = target.ip().to_string();
                config.server.port = target.port();
            }
            None => return Err("no relay server answered; pass --server".into()),
        }
    }

    let settings: Arc<dyn SettingsStore> = Arc::new(JsonFileSettings::open(&config.settings.path)?);
    let host = Arc::new(MemoryHost::new());
    let bridge = RelayBridge::new(host.clone(), settings, update_lock(), config.to_bridge_config());

    for guid in &cli.enable {
        bridge.set_device_enabled(guid, true)?;
    }
    for guid in &cli.disable {
        bridge.set_device_enabled(guid, false)?;
    }

    let target = ConnectionInfo::new(config.server.address.clone(), config.server.port);
    info!("connecting to {}:{}", target.ip(), target.port());
    let status = bridge.initialize(target, &stop).await;
    print!(
        "{}",
        display::render_status(&bridge.status_text(), bridge.hostname().as_deref(), bridge.ping_ms())
    );
    if status != RelayStatus::Success {
        // cached devices are still worth showing
        print!("{}", display::render_devices(&bridge.exposed_devices().await));
        return Err(format!("relay not connected: {status}").into());
    }

    if cli.shutdown_server {
        let accepted = bridge.request_server_shutdown("Requested by relay client", false).await?;
        println!("server shutdown {}", if accepted { "accepted" } else { "refused" });
        bridge.disconnect().await;
        return Ok(());
    }

    host.replace_relayed(bridge.relayed_devices().await);
    print!("{}", display::render_devices(&bridge.exposed_devices().await));

    if cli.watch {
        watch(&config, &bridge, &host, &stop).await;
    }

    bridge.disconnect().await;
    Ok(())
}

/// Pull joints for every exposed device each interval and reprint.
async fn watch(config: &ClientConfig, bridge: &Arc<RelayBridge>, host: &MemoryHost, stop: &CancellationToken) {
    let mut events = host.subscribe();
    let mut interval = tokio::time::interval(config.update_interval());
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let devices = bridge.exposed_devices().await;
                for (_, device) in &devices {
                    if let Err(e) = bridge.update_device(&device.guid).await {
                        warn!(guid = %device.guid, error = %e, "joint pull failed");
                    }
                }
                print!("{}", display::render_devices(&bridge.exposed_devices().await));
            }
            event = events.recv() => match event {
                Ok(HostEvent::RequestExit { reason, fatal }) => {
                    warn!(reason, fatal, "server asked us to stop");
                    break;
                }
                Ok(HostEvent::ReloadDevices) => host.replace_relayed(bridge.relayed_devices().await),
                Ok(HostEvent::RefreshInterface) => {
                    print!(
                        "{}",
                        display::render_status(&bridge.status_text(), bridge.hostname().as_deref(), bridge.ping_ms())
                    );
                }
                Err(e) => warn!(error = %e, "host event feed lagged"),
            },
        }
    }
}
