use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use murmur_protocol::config::{
    Config, DEFAULT_BACKOFF_MILLIS, DEFAULT_CORS_ALLOW_HEADERS, DEFAULT_CORS_ALLOW_ORIGIN,
    DEFAULT_IP, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_PING_DELAY_SECS, DEFAULT_MAX_RECIPIENTS,
    DEFAULT_MAX_RETRIES, DEFAULT_NODE_PORT, DEFAULT_PING_INTERVAL_SECS,
};
use murmur_protocol::{Addr, Node};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "murmur-node", about = "Gossip node of the murmur dissemination network")]
struct Cli {
    /// Listen host
    #[arg(long, env = "GOSSIP_IP", default_value = DEFAULT_IP)]
    ip: String,

    /// Listen port
    #[arg(long, env = "GOSSIP_PORT", default_value_t = DEFAULT_NODE_PORT)]
    port: u16,

    /// Scheme used to reach peers (http or https)
    #[arg(long, default_value = "http")]
    protocol: String,

    /// Upper bound on the number of peers receiving each fan-out
    #[arg(long, default_value_t = DEFAULT_MAX_RECIPIENTS)]
    max_recipients: usize,

    /// Seconds without a successful RPC before a peer is dropped
    #[arg(long, default_value_t = DEFAULT_MAX_PING_DELAY_SECS)]
    max_ping_delay: u64,

    /// Seconds between two ping passes
    #[arg(long, default_value_t = DEFAULT_PING_INTERVAL_SECS)]
    ping_interval: u64,

    /// Milliseconds of base backoff between send retries
    #[arg(long, default_value_t = DEFAULT_BACKOFF_MILLIS)]
    backoff: u64,

    /// Failed RPCs in a row before a peer is considered unreachable
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Retries after the first failed send attempt
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

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
        config.node.max_recipients = self.max_recipients;
        config.node.max_ping_delay = Duration::from_secs(self.max_ping_delay);
        config.node.ping_interval = Duration::from_secs(self.ping_interval);
        config.peer.backoff_duration = Duration::from_millis(self.backoff);
        config.peer.max_attempts = self.max_attempts;
        config.peer.max_retries = self.max_retries;
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

    tracing::info!(addr = %addr, "Starting murmur node");
    Node::new(addr, config).run().await
}
