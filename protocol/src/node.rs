use std::cmp::Ordering;
use std::fmt;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::config::Config;
use crate::peer::Peer;
use crate::routes;
use crate::types::{Addr, State};

/// Size of the bounded queues feeding each worker. Producers block when a
/// queue is full, which pushes back all the way to the HTTP handlers.
const CHANNEL_CAPACITY: usize = 8;

/// Window granted to in-flight HTTP requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Receiver ends of the worker queues, consumed once by [`Node::run`].
struct Channels {
    add_peer_rx: mpsc::Receiver<Addr>,
    delete_peer_rx: mpsc::Receiver<Addr>,
    state_rx: mpsc::Receiver<State>,
    fanout_rx: mpsc::Receiver<State>,
    pull_rx: mpsc::Receiver<Arc<Peer>>,
}

/// A gossip node: one replicated datum, a list of peers, and the worker set
/// that reconciles and disseminates state.
///
/// Each queue is drained by exactly one long-lived worker; in particular all
/// state transitions go through the state worker, which makes them totally
/// ordered without any further coordination.
pub struct Node {
    pub addr: Addr,
    pub config: Arc<Config>,
    peers: RwLock<Vec<Arc<Peer>>>,
    state: RwLock<State>,

    add_peer_tx: mpsc::Sender<Addr>,
    delete_peer_tx: mpsc::Sender<Addr>,
    state_tx: mpsc::Sender<State>,
    fanout_tx: mpsc::Sender<State>,
    pull_tx: mpsc::Sender<Arc<Peer>>,
    channels: Mutex<Option<Channels>>,

    http: reqwest::Client,
}

impl Node {
    pub fn new(addr: Addr, config: Arc<Config>) -> Arc<Self> {
        let (add_peer_tx, add_peer_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (delete_peer_tx, delete_peer_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (state_tx, state_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (fanout_tx, fanout_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (pull_tx, pull_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let node = Arc::new(Self {
            addr,
            config,
            peers: RwLock::new(Vec::new()),
            state: RwLock::new(State::default()),
            add_peer_tx,
            delete_peer_tx,
            state_tx,
            fanout_tx,
            pull_tx,
            channels: Mutex::new(Some(Channels {
                add_peer_rx,
                delete_peer_rx,
                state_rx,
                fanout_rx,
                pull_rx,
            })),
            http: reqwest::Client::new(),
        });

        tracing::info!(node = %node, "Initializing node");
        node
    }

    /// Offer a state for reconciliation. Blocks when the state queue is
    /// full, back-pressuring the caller.
    pub async fn submit_state(&self, state: State) {
        if self.state_tx.send(state).await.is_err() {
            tracing::warn!(node = %self, "State worker is gone, dropping state");
        }
    }

    /// Enqueue a peering request.
    pub async fn request_peering(&self, addr: Addr) {
        if self.add_peer_tx.send(addr).await.is_err() {
            tracing::warn!(node = %self, "Peer worker is gone, dropping peering request");
        }
    }

    /// Enqueue a peer-removal request.
    pub async fn request_peer_removal(&self, addr: Addr) {
        if self.delete_peer_tx.send(addr).await.is_err() {
            tracing::warn!(node = %self, "Peer worker is gone, dropping removal request");
        }
    }

    /// Current state.
    pub async fn query(&self) -> State {
        self.state.read().await.clone()
    }

    /// Timestamp of the current state.
    pub async fn status(&self) -> i64 {
        self.state.read().await.timestamp
    }

    /// Addresses of the current peer records.
    pub async fn list_peers(&self) -> Vec<Addr> {
        self.peers.read().await.iter().map(|p| p.addr.clone()).collect()
    }

    /// Add a peer unless it is this node itself or already known, then send
    /// it a peering request carrying our own address.
    ///
    /// The receiving side runs the same idempotence check, so when A adds B,
    /// B merely records A instead of answering with yet another request.
    /// That keeps two nodes from ping-ponging peering requests forever while
    /// letting the controller peer any two nodes with a single call.
    pub async fn add_peer(self: &Arc<Self>, addr: Addr) {
        tracing::info!(node = %self, addr = %addr, "Received peering request");

        if addr == self.addr {
            tracing::info!(node = %self, addr = %addr, "Skip self-peering request");
            return;
        }

        let mut peers = self.peers.write().await;
        if peers.iter().any(|peer| peer.addr == addr) {
            tracing::info!(node = %self, addr = %addr, "Skip known peer");
            return;
        }

        let peer = Arc::new(Peer::new(addr, self.http.clone(), self.config.clone()));
        peers.push(peer.clone());
        drop(peers);

        let own_addr = self.addr.clone();
        tokio::spawn(async move {
            peer.send_peering_request(own_addr).await;
        });
    }

    /// Remove the peer record matching `addr`, if any.
    pub async fn delete_peer(&self, addr: Addr) {
        tracing::info!(node = %self, addr = %addr, "Received peer deletion request");

        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|peer| peer.addr != addr);
        if peers.len() == before {
            tracing::info!(node = %self, addr = %addr, "Skip unknown peer");
        }
    }

    /// Position of the peer record matching `addr`.
    pub async fn find_peer(&self, addr: &Addr) -> Option<usize> {
        self.peers.read().await.iter().position(|peer| &peer.addr == addr)
    }

    /// Apply the acceptance rule to an offered state.
    ///
    /// A zero timestamp marks fresh end-user input and is stamped with the
    /// current clock. Anything not strictly newer than the local state is
    /// dropped. Returns the (possibly stamped) state and whether it was
    /// accepted.
    pub async fn update_state(&self, mut state: State) -> (State, bool) {
        if state.timestamp == 0 {
            state.timestamp = now_nanos();
        }

        let mut current = self.state.write().await;
        match state.timestamp.cmp(&current.timestamp) {
            Ordering::Less => {
                tracing::info!(node = %self, state = %state, "Received obsolete state");
                (state, false)
            }
            Ordering::Equal => {
                tracing::info!(node = %self, state = %state, "Received known state");
                (state, false)
            }
            Ordering::Greater => {
                tracing::info!(node = %self, state = %state, "Received new state");
                *current = state.clone();
                (state, true)
            }
        }
    }

    /// Fan an accepted state out to at most `max_recipients` peers, drawn
    /// uniformly without replacement. Each send runs as its own best-effort
    /// task. Returns the number of recipients.
    pub async fn peer_send_state(&self, state: &State) -> usize {
        let mut recipients = self.peers.read().await.clone();
        let total = recipients.len();
        if total > self.config.node.max_recipients {
            let mut rng = rand::thread_rng();
            recipients.shuffle(&mut rng);
            recipients.truncate(self.config.node.max_recipients);
        }

        tracing::info!(
            node = %self,
            state = %state,
            recipients = recipients.len(),
            total,
            "Sending state update to peers"
        );

        for peer in &recipients {
            let peer = peer.clone();
            let state = state.clone();
            tokio::spawn(async move {
                peer.send(&state).await;
            });
        }

        recipients.len()
    }

    /// One liveness pass over all peers.
    ///
    /// Irrecoverable peers are collected first and removed at the end of the
    /// pass; everyone else gets a concurrent ping, and a peer advertising a
    /// newer state than ours is queued for a pull. The pings have no effect
    /// on the removal list, so the pass does not wait on them.
    pub async fn ping_peers(self: &Arc<Self>) {
        let peers = self.peers.read().await.clone();
        let mut to_remove = Vec::new();

        for peer in peers {
            if peer.is_irrecoverable().await {
                to_remove.push(peer.addr.clone());
                continue;
            }

            let node = self.clone();
            tokio::spawn(async move {
                peer.ping().await;
                if peer.last_state().await > node.status().await {
                    if node.pull_tx.send(peer).await.is_err() {
                        tracing::warn!(node = %node, "Pull worker is gone");
                    }
                }
            });
        }

        if !to_remove.is_empty() {
            let mut peers = self.peers.write().await;
            peers.retain(|peer| {
                if to_remove.contains(&peer.addr) {
                    tracing::info!(node = %self, peer = %peer, "Removing irrecoverable peer");
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Start the worker set. Callable once; [`Node::run`] does this before
    /// serving HTTP.
    pub async fn spawn_workers(self: &Arc<Self>) -> Result<()> {
        let channels = self
            .channels
            .lock()
            .await
            .take()
            .context("node workers already started")?;

        tokio::spawn(self.clone().add_peer_worker(channels.add_peer_rx));
        tokio::spawn(self.clone().delete_peer_worker(channels.delete_peer_rx));
        tokio::spawn(self.clone().state_worker(channels.state_rx));
        tokio::spawn(self.clone().fanout_worker(channels.fanout_rx));
        tokio::spawn(self.clone().pull_worker(channels.pull_rx));
        tokio::spawn(self.clone().ping_worker());
        Ok(())
    }

    /// Start the workers and serve the HTTP surface until a termination
    /// signal arrives, then drain connections within the grace window and
    /// tell every peer to forget this node.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.spawn_workers().await?;

        let app = routes::node_router(self.clone());
        let listener = tokio::net::TcpListener::bind(self.addr.to_string())
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        tracing::info!(node = %self, "Starting node");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });

        let mut drain_rx = shutdown_rx.clone();
        let mut server = pin!(axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = drain_rx.changed().await;
        })
        .into_future());

        tokio::select! {
            res = &mut server => res.context("node http server failed")?,
            _ = shutdown_rx.changed() => {
                match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                    Ok(res) => res.context("node http server failed")?,
                    Err(_) => tracing::warn!(node = %self, "Graceful shutdown window expired"),
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Broadcast a peer-deletion request so peers prune this node eagerly
    /// instead of waiting out their ping timeouts.
    pub async fn shutdown(&self) {
        tracing::info!(node = %self, "Shutting down node");
        let peers = self.peers.read().await.clone();
        for peer in peers {
            tracing::info!(node = %self, peer = %peer, "Removing peer");
            peer.send_peer_deletion_request(self.addr.clone()).await;
        }
    }

    async fn add_peer_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Addr>) {
        while let Some(addr) = rx.recv().await {
            self.add_peer(addr).await;
        }
    }

    async fn delete_peer_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Addr>) {
        while let Some(addr) = rx.recv().await {
            self.delete_peer(addr).await;
        }
    }

    /// Reconcile offered states and publish accepted ones for fan-out.
    async fn state_worker(self: Arc<Self>, mut rx: mpsc::Receiver<State>) {
        while let Some(state) = rx.recv().await {
            let (state, updated) = self.update_state(state).await;
            if updated && self.fanout_tx.send(state).await.is_err() {
                tracing::warn!(node = %self, "Fan-out worker is gone");
            }
        }
    }

    async fn fanout_worker(self: Arc<Self>, mut rx: mpsc::Receiver<State>) {
        while let Some(state) = rx.recv().await {
            self.peer_send_state(&state).await;
        }
    }

    /// Pull states from peers that advertised a newer timestamp during a
    /// ping pass.
    async fn pull_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Arc<Peer>>) {
        while let Some(peer) = rx.recv().await {
            tracing::info!(node = %self, peer = %peer, "Fetching latest state");

            // Another path may have advanced the local state since the ping;
            // skip the GET instead of fetching a state we already hold.
            if peer.last_state().await <= self.status().await {
                tracing::info!(node = %self, peer = %peer, "Skip fetching state");
                continue;
            }

            if let Ok(state) = peer.get().await {
                if self.state_tx.send(state).await.is_err() {
                    tracing::warn!(node = %self, "State worker is gone");
                }
            }
        }
    }

    async fn ping_worker(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.node.ping_interval).await;
            self.ping_peers().await;
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Current wall clock in nanoseconds, the timestamp domain of [`State`].
pub(crate) fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Completes on SIGINT or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
