use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Address of a node: its listen host and port.
///
/// An address is also the unique identity of a node across the whole fleet;
/// two records with the same address refer to the same node.
///
/// An empty `ip` on the wire means "I don't know my own address" and is
/// filled in from the remote socket by the receiving handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
}

impl Addr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Addr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("address {s:?} is not of the form host:port"))?;
        let port = port
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid port in {s:?}: {e}"))?;
        Ok(Self::new(ip, port))
    }
}

/// A piece of replicated information at a given point in time.
///
/// The timestamp is a signed nanosecond counter and totally orders states;
/// the payload is opaque to the protocol. A timestamp of 0 marks unstamped
/// end-user input and is replaced with the current clock on submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "time", default)]
    pub timestamp: i64,
    #[serde(default)]
    pub data: String,
}

impl State {
    pub fn new(timestamp: i64, data: impl Into<String>) -> Self {
        Self {
            timestamp,
            data: data.into(),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.timestamp)
    }
}

/// Plain-message response body for acknowledgements and errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Response to `GET /status`: the timestamp of the latest known state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "lastState")]
    pub last_state: i64,
}

/// Response to `GET /peers` on a node: the addresses of its peer records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<Addr>,
}

/// One node in a controller's graph snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: Addr,
    pub peers: Vec<Addr>,
}

/// Response to `GET /peers` on the controller: the whole known graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_wire_format() {
        let addr = Addr::new("127.0.0.1", 8080);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, r#"{"ip":"127.0.0.1","port":8080}"#);
        let back: Addr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn addr_missing_fields_default() {
        let addr: Addr = serde_json::from_str(r#"{"port":8080}"#).unwrap();
        assert_eq!(addr, Addr::new("", 8080));
        let addr: Addr = serde_json::from_str("{}").unwrap();
        assert_eq!(addr, Addr::default());
    }

    #[test]
    fn addr_from_str() {
        let addr: Addr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(addr, Addr::new("127.0.0.1", 8080));
        assert!("127.0.0.1".parse::<Addr>().is_err());
        assert!("127.0.0.1:notaport".parse::<Addr>().is_err());
    }

    #[test]
    fn state_wire_format() {
        let state = State::new(1000, "hello");
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"time":1000,"data":"hello"}"#);
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn state_missing_timestamp_is_unstamped() {
        let state: State = serde_json::from_str(r#"{"data":"hello"}"#).unwrap();
        assert_eq!(state.timestamp, 0);
        assert_eq!(state.data, "hello");
    }

    #[test]
    fn status_response_field_name() {
        let json = serde_json::to_string(&StatusResponse { last_state: 42 }).unwrap();
        assert_eq!(json, r#"{"lastState":42}"#);
    }

    #[test]
    fn display_impls() {
        assert_eq!(Addr::new("10.0.0.1", 7080).to_string(), "10.0.0.1:7080");
        assert_eq!(State::new(255, "x").to_string(), "ff");
    }
}
