use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::types::{Addr, PeersResponse, State, StatusResponse};

/// Reachability bookkeeping for a peer, kept under one lock so readers
/// always see a consistent attempts / last-success pair.
#[derive(Debug)]
struct PeerStatus {
    /// Consecutive failed RPCs since the last success.
    attempts: u32,
    /// Instant of the most recent successful RPC. Never rewinds.
    last_success: DateTime<Utc>,
    /// Largest state timestamp this peer has advertised to us.
    last_state: i64,
}

/// A node's record of another node, and the client used to talk to it.
///
/// The same record type serves both sides of the system: a node tracks the
/// peers it gossips with, and the controller tracks every node in the fleet.
/// `known_peers` is the controller-only projection of the remote peer list;
/// nodes leave it empty.
pub struct Peer {
    pub addr: Addr,
    status: RwLock<PeerStatus>,
    known_peers: RwLock<Vec<Addr>>,
    http: reqwest::Client,
    config: Arc<Config>,
}

impl Peer {
    pub fn new(addr: Addr, http: reqwest::Client, config: Arc<Config>) -> Self {
        Self {
            addr,
            status: RwLock::new(PeerStatus {
                attempts: 0,
                last_success: Utc::now(),
                last_state: 0,
            }),
            known_peers: RwLock::new(Vec::new()),
            http,
            config,
        }
    }

    /// Retrieve the latest state from the peer.
    pub async fn get(&self) -> Result<State> {
        let res = match self.request(self.http.get(self.url())).await {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(peer = %self, error = %e, "Failed to retrieve the latest state");
                self.update_status(false).await;
                return Err(anyhow::Error::from(e).context("failed to reach peer"));
            }
        };
        if res.status() != StatusCode::OK {
            tracing::warn!(peer = %self, status = %res.status(), "Failed to retrieve the latest state");
            self.update_status(false).await;
            anyhow::bail!("peer returned HTTP {}", res.status());
        }

        let state: State = match res.json().await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(peer = %self, error = %e, "Failed to decode state");
                self.update_status(false).await;
                return Err(anyhow::Error::from(e).context("failed to decode state"));
            }
        };

        tracing::info!(peer = %self, state = %state, "Retrieved state");
        self.record_success(state.timestamp).await;
        Ok(state)
    }

    /// Retrieve the peer list of the peer.
    pub async fn get_peers(&self) -> Result<Vec<Addr>> {
        let res = match self.request(self.http.get(format!("{}/peers", self.url()))).await {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(peer = %self, error = %e, "Failed to retrieve peers");
                self.update_status(false).await;
                return Err(anyhow::Error::from(e).context("failed to reach peer"));
            }
        };
        if res.status() != StatusCode::OK {
            tracing::warn!(peer = %self, status = %res.status(), "Failed to retrieve peers");
            self.update_status(false).await;
            anyhow::bail!("peer returned HTTP {}", res.status());
        }

        let peers: PeersResponse = match res.json().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(peer = %self, error = %e, "Failed to decode peers");
                self.update_status(false).await;
                return Err(anyhow::Error::from(e).context("failed to decode peers"));
            }
        };

        tracing::info!(peer = %self, "Retrieved peers");
        self.update_status(true).await;
        Ok(peers.peers)
    }

    /// Check if the peer is reachable and learn the timestamp of its latest
    /// state. Failures only mark the status; they never surface.
    pub async fn ping(&self) {
        tracing::debug!(peer = %self, "Ping");

        let res = match self.request(self.http.get(format!("{}/status", self.url()))).await {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(peer = %self, error = %e, "Ping failed");
                self.update_status(false).await;
                return;
            }
        };
        if res.status() != StatusCode::OK {
            tracing::warn!(peer = %self, status = %res.status(), "Ping failed");
            self.update_status(false).await;
            return;
        }

        match res.json::<StatusResponse>().await {
            Ok(status) => self.record_success(status.last_state).await,
            Err(e) => {
                tracing::warn!(peer = %self, error = %e, "Failed to decode status");
                self.update_status(false).await;
            }
        }
    }

    /// Push a state to the peer.
    ///
    /// Unreachable peers are skipped without any I/O; pings are the only way
    /// back from unreachability.
    pub async fn send(&self, state: &State) {
        if self.is_unreachable().await {
            tracing::info!(peer = %self, state = %state, "Skip sending state to unreachable peer");
            return;
        }

        tracing::info!(peer = %self, state = %state, "Sending state to peer");
        if !self.post_with_retries(self.url(), state).await {
            tracing::warn!(peer = %self, state = %state, "Failed to send state");
        }
    }

    /// Ask the peer to add `addr` to its peer list.
    pub async fn send_peering_request(&self, addr: Addr) {
        tracing::info!(peer = %self, addr = %addr, "Sending peering request");
        if !self
            .post_with_retries(format!("{}/peers", self.url()), &addr)
            .await
        {
            tracing::warn!(peer = %self, addr = %addr, "Failed to send peering request");
        }
    }

    /// Ask the peer to remove `addr` from its peer list. Fire-and-forget,
    /// no retries: this runs on the way out.
    pub async fn send_peer_deletion_request(&self, addr: Addr) {
        tracing::info!(peer = %self, addr = %addr, "Sending peer deletion request");
        let res = self
            .request(self.http.delete(format!("{}/peers", self.url())).json(&addr))
            .await;
        match res {
            Ok(res) if res.status() == StatusCode::OK => self.update_status(true).await,
            Ok(res) => {
                tracing::warn!(peer = %self, status = %res.status(), "Failed to send peer deletion request");
                self.update_status(false).await;
            }
            Err(e) => {
                tracing::warn!(peer = %self, error = %e, "Failed to send peer deletion request");
                self.update_status(false).await;
            }
        }
    }

    /// POST a JSON body with the shared retry envelope: up to
    /// `max_retries` + 1 attempts, exponential backoff with jitter between
    /// them. A fully failed envelope counts as a single failed attempt, so
    /// one bad message cannot push a peer across the unreachability
    /// threshold on its own.
    async fn post_with_retries<T: Serialize>(&self, url: String, body: &T) -> bool {
        for attempt in 0..=self.config.peer.max_retries {
            match self.request(self.http.post(&url).json(body)).await {
                Ok(res) if res.status() == StatusCode::OK => {
                    self.update_status(true).await;
                    return true;
                }
                Ok(res) => {
                    tracing::debug!(peer = %self, status = %res.status(), attempt, "Attempt failed");
                }
                Err(e) => {
                    tracing::debug!(peer = %self, error = %e, attempt, "Attempt failed");
                }
            }

            if attempt < self.config.peer.max_retries {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        self.update_status(false).await;
        false
    }

    async fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::Result<reqwest::Response> {
        builder.timeout(self.config.rpc_timeout()).send().await
    }

    /// Backoff before retry `attempt + 1`: `backoff * 2^attempt` plus up to
    /// one extra `backoff` of jitter so synchronized senders spread out.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.peer.backoff_duration * 2u32.pow(attempt);
        if self.config.peer.backoff_duration.is_zero() {
            return base;
        }
        base + rand::thread_rng().gen_range(Duration::ZERO..self.config.peer.backoff_duration)
    }

    /// Record the outcome of a terminating RPC. Success resets the failure
    /// counter and advances `last_success`; failure only bumps the counter.
    pub async fn update_status(&self, ok: bool) {
        let mut status = self.status.write().await;
        if ok {
            status.attempts = 0;
            status.last_success = Utc::now();
        } else {
            status.attempts += 1;
            tracing::info!(peer = %self, attempts = status.attempts, "Unsuccessful attempts");
        }
    }

    /// Success that also carries the peer's advertised state timestamp.
    async fn record_success(&self, last_state: i64) {
        let mut status = self.status.write().await;
        status.attempts = 0;
        status.last_success = Utc::now();
        status.last_state = last_state;
    }

    pub async fn attempts(&self) -> u32 {
        self.status.read().await.attempts
    }

    pub async fn last_state(&self) -> i64 {
        self.status.read().await.last_state
    }

    pub async fn last_success(&self) -> DateTime<Utc> {
        self.status.read().await.last_success
    }

    /// Too many failed attempts in a row; sends are suppressed until a
    /// success flips the counter back.
    pub async fn is_unreachable(&self) -> bool {
        self.status.read().await.attempts >= self.config.peer.max_attempts
    }

    /// No successful RPC within the node-side window; the peer is dropped.
    pub async fn is_irrecoverable(&self) -> bool {
        self.age().await > self.config.node.max_ping_delay
    }

    /// No successful RPC within the controller-side window, which is longer
    /// than the node-side one.
    pub async fn is_ctrl_irrecoverable(&self) -> bool {
        self.age().await > self.config.controller.max_scan_delay
    }

    async fn age(&self) -> Duration {
        let last_success = self.status.read().await.last_success;
        Utc::now()
            .signed_duration_since(last_success)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether this peer can be connected with the target: not itself, and
    /// not already peered with it.
    pub async fn can_peer(&self, other: &Peer) -> bool {
        if self.addr == other.addr {
            tracing::info!(peer = %self, "Cannot peer with itself");
            return false;
        }
        if self.known_peers.read().await.contains(&other.addr) {
            tracing::info!(peer = %self, other = %other, "Cannot peer with already peered node");
            return false;
        }
        true
    }

    /// Snapshot of the peer list advertised by this peer, as learned from
    /// its last successful `get_peers`.
    pub async fn known_peers(&self) -> Vec<Addr> {
        self.known_peers.read().await.clone()
    }

    pub async fn known_peer_count(&self) -> usize {
        self.known_peers.read().await.len()
    }

    /// Replace the projection after a successful scan.
    pub async fn set_known_peers(&self, peers: Vec<Addr>) {
        *self.known_peers.write().await = peers;
    }

    /// Optimistically extend the projection after issuing a peering request.
    pub async fn add_known_peer(&self, addr: Addr) {
        self.known_peers.write().await.push(addr);
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.config.protocol, self.addr)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer").field("addr", &self.addr).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dead_addr, fast_config, spawn_peer_server};
    use crate::types::MessageResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer(addr: Addr, config: Arc<Config>) -> Peer {
        Peer::new(addr, reqwest::Client::new(), config)
    }

    fn counting_router(hits: Arc<AtomicUsize>, status: StatusCode) -> Router {
        Router::new().route(
            "/",
            post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (status, Json(MessageResponse::new("State received")))
                }
            }),
        )
    }

    #[tokio::test]
    async fn get_retrieves_state_and_marks_success() {
        let addr = spawn_peer_server(
            Router::new().route("/", get(|| async { Json(State::new(42, "payload")) })),
        )
        .await;
        let peer = peer(addr, fast_config());
        peer.update_status(false).await;

        let state = peer.get().await.unwrap();
        assert_eq!(state, State::new(42, "payload"));
        assert_eq!(peer.last_state().await, 42);
        assert_eq!(peer.attempts().await, 0);
    }

    #[tokio::test]
    async fn get_failure_bumps_attempts() {
        let peer = peer(dead_addr().await, fast_config());
        assert!(peer.get().await.is_err());
        assert_eq!(peer.attempts().await, 1);
    }

    #[tokio::test]
    async fn get_peers_decodes_addresses() {
        let listed = vec![Addr::new("127.0.0.1", 8081), Addr::new("127.0.0.1", 8082)];
        let response = PeersResponse {
            peers: listed.clone(),
        };
        let addr = spawn_peer_server(Router::new().route(
            "/peers",
            get(move || {
                let response = response.clone();
                async move { Json(response) }
            }),
        ))
        .await;
        let peer = peer(addr, fast_config());

        assert_eq!(peer.get_peers().await.unwrap(), listed);
        assert_eq!(peer.attempts().await, 0);
    }

    #[tokio::test]
    async fn ping_updates_last_state() {
        let addr = spawn_peer_server(
            Router::new().route("/status", get(|| async { Json(StatusResponse { last_state: 99 }) })),
        )
        .await;
        let peer = peer(addr, fast_config());
        peer.update_status(false).await;

        peer.ping().await;
        assert_eq!(peer.last_state().await, 99);
        assert_eq!(peer.attempts().await, 0);
    }

    #[tokio::test]
    async fn send_reaches_peer_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_peer_server(counting_router(hits.clone(), StatusCode::OK)).await;
        let peer = peer(addr, fast_config());

        peer.send(&State::new(1, "x")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(peer.attempts().await, 0);
    }

    #[tokio::test]
    async fn failed_send_retries_but_counts_one_attempt() {
        let config = fast_config();
        let hits = Arc::new(AtomicUsize::new(0));
        let addr =
            spawn_peer_server(counting_router(hits.clone(), StatusCode::INTERNAL_SERVER_ERROR))
                .await;
        let peer = peer(addr, config.clone());

        peer.send(&State::new(1, "x")).await;
        assert_eq!(
            hits.load(Ordering::SeqCst),
            config.peer.max_retries as usize + 1
        );
        assert_eq!(peer.attempts().await, 1);
    }

    #[tokio::test]
    async fn unreachable_peer_is_skipped_without_io() {
        let config = fast_config();
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_peer_server(counting_router(hits.clone(), StatusCode::OK)).await;
        let peer = peer(addr, config.clone());

        for _ in 0..config.peer.max_attempts {
            peer.update_status(false).await;
        }
        assert!(peer.is_unreachable().await);

        peer.send(&State::new(1, "x")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_ping_resurrects_unreachable_peer() {
        let config = fast_config();
        let hits = Arc::new(AtomicUsize::new(0));
        let shared = hits.clone();
        let router = counting_router(shared, StatusCode::OK)
            .route("/status", get(|| async { Json(StatusResponse { last_state: 7 }) }));
        let addr = spawn_peer_server(router).await;
        let peer = peer(addr, config.clone());

        for _ in 0..config.peer.max_attempts {
            peer.update_status(false).await;
        }
        peer.send(&State::new(1, "x")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        peer.ping().await;
        assert_eq!(peer.attempts().await, 0);
        assert!(!peer.is_unreachable().await);

        peer.send(&State::new(2, "y")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peering_request_success_updates_status() {
        let addr = spawn_peer_server(Router::new().route(
            "/peers",
            post(|Json(addr): Json<Addr>| async move {
                assert_eq!(addr, Addr::new("127.0.0.1", 9000));
                Json(MessageResponse::new("Peering request received"))
            }),
        ))
        .await;
        let peer = peer(addr, fast_config());
        peer.update_status(false).await;

        peer.send_peering_request(Addr::new("127.0.0.1", 9000)).await;
        assert_eq!(peer.attempts().await, 0);
    }

    #[tokio::test]
    async fn unreachability_threshold() {
        let config = fast_config();
        let peer = peer(Addr::new("127.0.0.1", 1), config.clone());

        for _ in 0..config.peer.max_attempts - 1 {
            peer.update_status(false).await;
        }
        assert!(!peer.is_unreachable().await);
        peer.update_status(false).await;
        assert!(peer.is_unreachable().await);

        peer.update_status(true).await;
        assert!(!peer.is_unreachable().await);
        assert_eq!(peer.attempts().await, 0);
    }

    #[tokio::test]
    async fn irrecoverability_windows() {
        let mut config = Config::default();
        config.node.max_ping_delay = Duration::from_millis(20);
        config.controller.max_scan_delay = Duration::from_millis(300);
        let peer = peer(Addr::new("127.0.0.1", 1), Arc::new(config));

        assert!(!peer.is_irrecoverable().await);
        assert!(!peer.is_ctrl_irrecoverable().await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(peer.is_irrecoverable().await);
        assert!(!peer.is_ctrl_irrecoverable().await);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(peer.is_ctrl_irrecoverable().await);
    }

    #[tokio::test]
    async fn last_success_advances_on_success() {
        let peer = peer(Addr::new("127.0.0.1", 1), fast_config());
        let before = peer.last_success().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        peer.update_status(true).await;
        assert!(peer.last_success().await > before);
    }

    #[tokio::test]
    async fn can_peer_rules() {
        let config = fast_config();
        let a = peer(Addr::new("127.0.0.1", 8081), config.clone());
        let b = peer(Addr::new("127.0.0.1", 8082), config.clone());
        let same = peer(Addr::new("127.0.0.1", 8081), config.clone());

        assert!(a.can_peer(&b).await);
        assert!(!a.can_peer(&same).await);

        a.add_known_peer(b.addr.clone()).await;
        assert!(!a.can_peer(&b).await);
    }
}
