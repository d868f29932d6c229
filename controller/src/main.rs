use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use murmur_protocol::config::{
    Config, DEFAULT_CORS_ALLOW_HEADERS, DEFAULT_CORS_ALLOW_ORIGIN, DEFAULT_CONTROLLER_PORT,
    DEFAULT_IP, DEFAULT_MAX_SCAN_DELAY_SECS, DEFAULT_MIN_PEERS, DEFAULT_SCAN_INTERVAL_SECS,
};
use murmur_protocol::{Addr, Controller};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "murmur-controller",
    about = "Topology controller of the murmur dissemination network"
)]
struct Cli {
    /// Listen host
    #[arg(long, env = "GOSSIP_IP", default_value = DEFAULT_IP)]
    ip: String,

    /// Listen port
    #[arg(long, env = "GOSSIP_PORT", default_value_t = DEFAULT_CONTROLLER_PORT)]
    port: u16,

    /// Scheme used to reach nodes (http or https)
    #[arg(long, default_value = "http")]
    protocol: String,

    /// Minimum peer degree to maintain for every node
    #[arg(long, default_value_t = DEFAULT_MIN_PEERS)]
    min_peers: usize,

    /// Seconds without a successful RPC before a node is forgotten
    #[arg(long, default_value_t = DEFAULT_MAX_SCAN_DELAY_SECS)]
    max_scan_delay: u64,

    /// Seconds between two scan passes
    #[arg(long, default_value_t = DEFAULT_SCAN_INTERVAL_SECS)]
    scan_interval: u64,

    /// Node addresses to seed the registry with (host:port, comma separated)
    #[arg(long, value_delimiter = ',')]
    seeds: Vec<String>,

    /// Access-Control-Allow-Origin header value
    #[arg(long, default_value = DEFAULT_CORS_ALLOW_ORIGIN)]
    cors_allow_origin: String,

    /// Access-Control-Allow-Headers header value
    #[arg(long, default_value = DEFAULT_CORS_ALLOW_HEADERS)]
    cors_allow_headers: String,
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = Config::default();
        config.protocol = self.protocol.parse()?;
        config.controller.min_peers = self.min_peers;
        config.controller.max_scan_delay = Duration::from_secs(self.max_scan_delay);
        config.controller.scan_interval = Duration::from_secs(self.scan_interval);
        config.cors.allow_origin = self.cors_allow_origin.clone();
        config.cors.allow_headers = self.cors_allow_headers.clone();
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Arc::new(cli.config()?);
    let addr = Addr::new(cli.ip.clone(), cli.port);

    let controller = Controller::new(addr, config);
    for seed in &cli.seeds {
        let addr: Addr = seed
            .parse()
            .with_context(|| format!("invalid seed address {seed:?}"))?;
        controller.register_peer(addr).await;
    }

    tracing::info!(controller = %controller, "Starting murmur controller");
    controller.run().await
}
