//! Relay server: entry point.
//!
//! ```text
//! relay-server                  Run in the foreground
//! relay-server --config <path>  Load a custom config TOML
//! relay-server --port <port>    Override the RPC port
//! relay-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_server::config::RelayServerConfig;
use relay_server::service::RelayServerService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "relay-server", about = "Tracking relay server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "relay-server.toml")]
    config: PathBuf,

    /// RPC port, overriding the config file and stored setting.
    #[arg(short, long)]
    port: Option<u16>,

    /// Do not answer discovery probes.
    #[arg(long)]
    no_discovery: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&RelayServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = RelayServerConfig::load(&cli.config);
    if cli.port.is_some() {
        config.network.port = cli.port;
    }
    if cli.no_discovery {
        config.discovery.enabled = false;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("relay-server v{}", env!("CARGO_PKG_VERSION"));
    info!("discovery: {} on port {}", config.discovery.enabled, config.discovery.port);

    let service = RelayServerService::new(config);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
