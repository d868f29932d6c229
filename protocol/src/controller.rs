use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::node::shutdown_signal;
use crate::peer::Peer;
use crate::routes;
use crate::types::Addr;

const CHANNEL_CAPACITY: usize = 8;

/// The topology manager: a registry of every node in the fleet and a
/// periodic scan that keeps the peering graph one connected component with
/// every node at a minimum degree.
///
/// The registry maps addresses to peer records and is insertion-unique;
/// every other collection in this module holds addresses, never records, so
/// the cyclic peering graph is represented without cyclic ownership.
pub struct Controller {
    pub addr: Addr,
    pub config: Arc<Config>,
    peers: RwLock<HashMap<Addr, Arc<Peer>>>,

    add_peer_tx: mpsc::Sender<Addr>,
    add_peer_rx: Mutex<Option<mpsc::Receiver<Addr>>>,

    http: reqwest::Client,
}

impl Controller {
    pub fn new(addr: Addr, config: Arc<Config>) -> Arc<Self> {
        let (add_peer_tx, add_peer_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let controller = Arc::new(Self {
            addr,
            config,
            peers: RwLock::new(HashMap::new()),
            add_peer_tx,
            add_peer_rx: Mutex::new(Some(add_peer_rx)),
            http: reqwest::Client::new(),
        });

        tracing::info!(controller = %controller, "Initializing controller");
        controller
    }

    /// Enqueue an address for registration. Blocks when the queue is full.
    pub async fn request_registration(&self, addr: Addr) {
        if self.add_peer_tx.send(addr).await.is_err() {
            tracing::warn!(controller = %self, "Registration worker is gone, dropping address");
        }
    }

    /// Add a peer record for `addr` if absent, returning the record either
    /// way.
    pub async fn register_peer(&self, addr: Addr) -> Arc<Peer> {
        let mut peers = self.peers.write().await;
        peers
            .entry(addr.clone())
            .or_insert_with(|| {
                tracing::info!(controller = %self, addr = %addr, "Discovered new peer");
                Arc::new(Peer::new(addr, self.http.clone(), self.config.clone()))
            })
            .clone()
    }

    /// The peer record for `addr`, if known.
    pub async fn peer(&self, addr: &Addr) -> Option<Arc<Peer>> {
        self.peers.read().await.get(addr).cloned()
    }

    /// Snapshot of the graph: every known node with its advertised peers.
    pub async fn list_peers(&self) -> Vec<(Addr, Vec<Addr>)> {
        let registry = self.peers.read().await.clone();
        let mut nodes = Vec::with_capacity(registry.len());
        for (addr, peer) in registry {
            nodes.push((addr, peer.known_peers().await));
        }
        nodes
    }

    /// Discovery phase of a scan: walk the graph from every registered
    /// address, refreshing each peer's advertised peer list.
    ///
    /// Peers silent for longer than the controller window are funneled to a
    /// removal worker scoped to this pass instead of being scanned. A fetch
    /// failure keeps the previous projection, and newly learned addresses
    /// join both the registry and the traversal. Each peer is fetched at
    /// most once per pass; fetches for independent peers run concurrently.
    pub async fn scan_peers(self: &Arc<Self>) {
        let (remove_tx, remove_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let removal_worker = tokio::spawn(self.clone().remove_peer_worker(remove_rx));

        let seeds: Vec<Arc<Peer>> = self.peers.read().await.values().cloned().collect();
        let mut queue: VecDeque<Arc<Peer>> = VecDeque::new();
        for peer in seeds {
            if peer.is_ctrl_irrecoverable().await {
                tracing::info!(controller = %self, peer = %peer, "Removing irrecoverable peer");
                if remove_tx.send(peer.addr.clone()).await.is_err() {
                    tracing::warn!(controller = %self, "Peer removal worker is gone");
                }
                continue;
            }
            queue.push_back(peer);
        }

        let mut scanned: HashSet<Addr> = HashSet::new();
        let mut fetches = JoinSet::new();
        loop {
            while let Some(peer) = queue.pop_front() {
                if !scanned.insert(peer.addr.clone()) {
                    tracing::debug!(controller = %self, peer = %peer, "Skipping scanned peer");
                    continue;
                }
                tracing::info!(controller = %self, peer = %peer, "Scanning peer");
                fetches.spawn(async move {
                    let result = peer.get_peers().await;
                    (peer, result)
                });
            }

            let Some(joined) = fetches.join_next().await else {
                break;
            };
            let (peer, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(controller = %self, error = %e, "Scan task failed");
                    continue;
                }
            };

            match result {
                Ok(addrs) => {
                    let mut projection = Vec::with_capacity(addrs.len());
                    for addr in addrs {
                        let sub_peer = self.register_peer(addr.clone()).await;
                        projection.push(addr.clone());
                        if !scanned.contains(&addr) {
                            tracing::debug!(controller = %self, peer = %peer, sub_peer = %addr, "Adding peer for scanning");
                            queue.push_back(sub_peer);
                        }
                    }
                    peer.set_known_peers(projection).await;
                }
                // The previous projection stands until the peer answers again.
                Err(_) => {
                    tracing::info!(controller = %self, peer = %peer, "Failed to scan peer");
                }
            }
        }

        drop(remove_tx);
        if let Err(e) = removal_worker.await {
            tracing::warn!(controller = %self, error = %e, "Peer removal worker failed");
        }
    }

    /// Partition the registry into connected components of the peering
    /// graph. One component means the fleet is healthy.
    pub async fn find_clusters(&self) -> Vec<Vec<Arc<Peer>>> {
        let registry = self.peers.read().await.clone();
        let mut unvisited: HashSet<Addr> = registry.keys().cloned().collect();
        let mut clusters = Vec::new();

        tracing::debug!(controller = %self, "Start cluster discovery");
        while let Some(start) = unvisited.iter().next().cloned() {
            unvisited.remove(&start);
            let mut seen = HashSet::from([start.clone()]);
            let mut to_visit = VecDeque::from([start]);
            let mut cluster = Vec::new();

            while let Some(addr) = to_visit.pop_front() {
                // Edges can point at peers already evicted from the registry.
                let Some(peer) = registry.get(&addr) else {
                    continue;
                };
                cluster.push(peer.clone());

                for sub_addr in peer.known_peers().await {
                    if seen.insert(sub_addr.clone()) {
                        unvisited.remove(&sub_addr);
                        to_visit.push_back(sub_addr);
                    }
                }
            }
            clusters.push(cluster);
        }

        clusters
    }

    /// Peers whose advertised degree is below the configured minimum.
    pub async fn find_low_peers(&self) -> Vec<Arc<Peer>> {
        let registry = self.peers.read().await.clone();
        let mut low = Vec::new();
        for peer in registry.values() {
            if peer.known_peer_count().await < self.config.controller.min_peers {
                low.push(peer.clone());
            }
        }
        low
    }

    /// Merge disconnected clusters by arranging them in a ring and peering
    /// random members of each adjacent pair.
    ///
    /// Each cross-link is recorded on both projections before the remote
    /// peering lands, so the degree-repair phase does not double-count the
    /// same node as under-connected.
    pub async fn merge_clusters(&self, clusters: &[Vec<Arc<Peer>>]) {
        if clusters.len() <= 1 {
            tracing::debug!(controller = %self, "No need to merge clusters");
            return;
        }

        // A cluster cannot contribute more cross-links than it has members.
        let link_count = clusters
            .iter()
            .map(Vec::len)
            .min()
            .unwrap_or(0)
            .min(self.config.controller.min_peers);
        if link_count == 0 {
            tracing::warn!(controller = %self, "Minimum number of peers is zero");
            return;
        }
        tracing::info!(controller = %self, clusters = clusters.len(), link_count, "Merging clusters");

        for (pos, cluster) in clusters.iter().enumerate() {
            // The last cluster wraps around to the first, closing the ring.
            let next = &clusters[(pos + 1) % clusters.len()];
            let origins = random_subset(cluster, link_count);
            let destinations = random_subset(next, link_count);

            for (origin, destination) in origins.iter().zip(&destinations) {
                tracing::info!(controller = %self, origin = %origin, destination = %destination, "Connecting peers");
                let requester = origin.clone();
                let target = destination.addr.clone();
                tokio::spawn(async move {
                    requester.send_peering_request(target).await;
                });
                origin.add_known_peer(destination.addr.clone()).await;
                destination.add_known_peer(origin.addr.clone()).await;
            }
        }
    }

    /// Degree repair: pair up under-connected peers, one pool slot per
    /// missing edge, and peer each pair. Slots that cannot pair (odd pool,
    /// self-match, already peered) fall back to one uniformly random
    /// registry peer; a collision there is tolerated and repaired on a
    /// later pass.
    pub async fn connect_low_peers(&self) {
        let min_peers = self.config.controller.min_peers;

        let mut pool: Vec<Arc<Peer>> = Vec::new();
        for peer in self.find_low_peers().await {
            for _ in peer.known_peer_count().await..min_peers {
                pool.push(peer.clone());
            }
        }
        tracing::info!(controller = %self, slots = pool.len(), "Found peers with not enough peers");

        {
            let mut rng = rand::thread_rng();
            pool.shuffle(&mut rng);
        }

        let mut leftovers: Vec<Arc<Peer>> = Vec::new();
        if pool.len() % 2 == 1 {
            leftovers.push(pool.remove(0));
        }

        for pair in pool.chunks_exact(2) {
            let (left, right) = (&pair[0], &pair[1]);
            if !left.can_peer(right).await {
                tracing::info!(controller = %self, left = %left, right = %right, "Pair cannot be peered");
                leftovers.push(left.clone());
                leftovers.push(right.clone());
                continue;
            }

            tracing::info!(controller = %self, left = %left, right = %right, "Connecting peers");
            let requester = left.clone();
            let target = right.addr.clone();
            tokio::spawn(async move {
                requester.send_peering_request(target).await;
            });
            left.add_known_peer(right.addr.clone()).await;
            right.add_known_peer(left.addr.clone()).await;
        }

        if leftovers.is_empty() {
            return;
        }

        let registry: Vec<Arc<Peer>> = self.peers.read().await.values().cloned().collect();
        if registry.is_empty() {
            return;
        }
        for peer in leftovers {
            let candidate = registry[rand::thread_rng().gen_range(0..registry.len())].clone();
            if peer.can_peer(&candidate).await {
                tracing::info!(controller = %self, left = %peer, right = %candidate, "Connecting leftover peer");
                let requester = peer.clone();
                let target = candidate.addr.clone();
                tokio::spawn(async move {
                    requester.send_peering_request(target).await;
                });
                peer.add_known_peer(candidate.addr.clone()).await;
                candidate.add_known_peer(peer.addr.clone()).await;
            } else {
                tracing::info!(controller = %self, peer = %peer, "Failed to find a random match");
            }
        }
    }

    /// Start the workers and serve the HTTP surface until a termination
    /// signal arrives.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let add_peer_rx = self
            .take_registration_queue()
            .await
            .context("controller already running")?;
        tokio::spawn(self.clone().add_peer_worker(add_peer_rx));
        tokio::spawn(self.clone().scan_worker());

        let app = routes::controller_router(self.clone());
        let listener = tokio::net::TcpListener::bind(self.addr.to_string())
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        tracing::info!(controller = %self, "Starting controller");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("controller http server failed")
    }

    pub(crate) async fn take_registration_queue(&self) -> Option<mpsc::Receiver<Addr>> {
        self.add_peer_rx.lock().await.take()
    }

    pub(crate) async fn add_peer_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Addr>) {
        while let Some(addr) = rx.recv().await {
            tracing::info!(controller = %self, addr = %addr, "Received peering info");
            if self.peers.read().await.contains_key(&addr) {
                tracing::debug!(controller = %self, addr = %addr, "Skip known peer");
                continue;
            }
            self.register_peer(addr).await;
        }
    }

    /// Drains eviction requests for one scan pass; duplicates are ignored.
    async fn remove_peer_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Addr>) {
        while let Some(addr) = rx.recv().await {
            if self.peers.write().await.remove(&addr).is_some() {
                tracing::info!(controller = %self, addr = %addr, "Removing peer");
            } else {
                tracing::debug!(controller = %self, addr = %addr, "Ignore duplicate peer removal message");
            }
        }
    }

    /// One scan pass per interval, measured from the end of the previous
    /// pass; the phases never interleave.
    async fn scan_worker(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.controller.scan_interval).await;
            tracing::info!(controller = %self, "Start scan");

            self.scan_peers().await;

            let clusters = self.find_clusters().await;
            if clusters.len() <= 1 {
                tracing::info!(controller = %self, clusters = clusters.len(), "Cluster detection complete");
            } else {
                tracing::warn!(controller = %self, clusters = clusters.len(), "Graph is partitioned");
            }

            self.merge_clusters(&clusters).await;
            self.connect_low_peers().await;
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Uniform subset without replacement: shuffle a copy, keep a prefix.
fn random_subset(peers: &[Arc<Peer>], count: usize) -> Vec<Arc<Peer>> {
    let mut subset = peers.to_vec();
    let mut rng = rand::thread_rng();
    subset.shuffle(&mut rng);
    subset.truncate(count);
    subset
}
