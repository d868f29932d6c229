use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default listen host for nodes and controllers.
pub const DEFAULT_IP: &str = "127.0.0.1";
/// Default listen port for a node.
pub const DEFAULT_NODE_PORT: u16 = 8080;
/// Default listen port for a controller.
pub const DEFAULT_CONTROLLER_PORT: u16 = 7080;
/// Maximum number of peers receiving a single fan-out.
pub const DEFAULT_MAX_RECIPIENTS: usize = 4;
/// Seconds without a successful RPC before a node drops a peer.
pub const DEFAULT_MAX_PING_DELAY_SECS: u64 = 5 * 60;
/// Seconds between two ping passes.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
/// Minimum peer degree the controller maintains for every node.
pub const DEFAULT_MIN_PEERS: usize = 3;
/// Seconds without a successful RPC before the controller forgets a peer.
pub const DEFAULT_MAX_SCAN_DELAY_SECS: u64 = 60 * 60;
/// Seconds between two controller scan passes.
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;
/// Milliseconds of base backoff between send retries.
pub const DEFAULT_BACKOFF_MILLIS: u64 = 200;
/// Failed RPCs in a row before a peer is considered unreachable.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Retries after the first failed attempt of a send.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default `Access-Control-Allow-Origin` value.
pub const DEFAULT_CORS_ALLOW_ORIGIN: &str = "*";
/// Default `Access-Control-Allow-Headers` value.
pub const DEFAULT_CORS_ALLOW_HEADERS: &str =
    "Accept, Content-Type, Content-Length, Accept-Encoding";

/// Scheme used for peer-to-peer requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(anyhow::anyhow!(
                "unknown protocol {other:?}, expected \"http\" or \"https\""
            )),
        }
    }
}

/// Configuration shared by nodes, controllers and peer records.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub protocol: Protocol,
    pub node: NodeConfig,
    pub controller: ControllerConfig,
    pub peer: PeerConfig,
    pub cors: CorsConfig,
}

impl Config {
    /// Timeout applied to every peer RPC.
    ///
    /// Bounded by the ping interval so a hung peer cannot make ping passes
    /// pile up on each other.
    pub fn rpc_timeout(&self) -> Duration {
        self.node.ping_interval / 2
    }
}

/// Gossip-engine knobs.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Upper bound on the number of peers a fan-out reaches.
    pub max_recipients: usize,
    /// Age of the last successful RPC past which a peer is dropped.
    pub max_ping_delay: Duration,
    /// Delay between two ping passes.
    pub ping_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_recipients: DEFAULT_MAX_RECIPIENTS,
            max_ping_delay: Duration::from_secs(DEFAULT_MAX_PING_DELAY_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
        }
    }
}

/// Topology-manager knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Minimum peer degree the controller maintains for every node.
    pub min_peers: usize,
    /// Age of the last successful RPC past which the controller forgets a
    /// peer. Longer than the node-side threshold so the controller can keep
    /// trying to repair peers the nodes already gave up on.
    pub max_scan_delay: Duration,
    /// Delay between the end of one scan pass and the start of the next.
    pub scan_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_peers: DEFAULT_MIN_PEERS,
            max_scan_delay: Duration::from_secs(DEFAULT_MAX_SCAN_DELAY_SECS),
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
        }
    }
}

/// Per-peer RPC retry knobs.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Base backoff between retries; attempt `i` waits `backoff * 2^i` plus
    /// up to one extra `backoff` of jitter.
    pub backoff_duration: Duration,
    /// Consecutive failed RPCs before the peer is considered unreachable.
    pub max_attempts: u32,
    /// Retries after the first attempt of a send envelope.
    pub max_retries: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            backoff_duration: Duration::from_millis(DEFAULT_BACKOFF_MILLIS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// CORS headers emitted by every HTTP handler.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allow_origin: String,
    pub allow_headers: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: DEFAULT_CORS_ALLOW_ORIGIN.to_string(),
            allow_headers: DEFAULT_CORS_ALLOW_HEADERS.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = Config::default();
        assert_eq!(config.protocol, Protocol::Http);
        assert_eq!(config.node.max_recipients, 4);
        assert_eq!(config.node.max_ping_delay, Duration::from_secs(300));
        assert_eq!(config.node.ping_interval, Duration::from_secs(30));
        assert_eq!(config.controller.min_peers, 3);
        assert_eq!(config.controller.max_scan_delay, Duration::from_secs(3600));
        assert_eq!(config.controller.scan_interval, Duration::from_secs(60));
        assert_eq!(config.peer.backoff_duration, Duration::from_millis(200));
        assert_eq!(config.peer.max_attempts, 5);
        assert_eq!(config.peer.max_retries, 3);
        assert_eq!(config.cors.allow_origin, "*");
    }

    #[test]
    fn rpc_timeout_is_half_the_ping_interval() {
        let config = Config::default();
        assert_eq!(config.rpc_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn protocol_from_str() {
        assert_eq!("http".parse::<Protocol>().unwrap(), Protocol::Http);
        assert_eq!("https".parse::<Protocol>().unwrap(), Protocol::Https);
        assert!("gopher".parse::<Protocol>().is_err());
    }
}
