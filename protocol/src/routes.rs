use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::CorsConfig;
use crate::controller::Controller;
use crate::node::Node;
use crate::types::{
    self, Addr, MessageResponse, NodeEntry, NodesResponse, PeersResponse, StatusResponse,
};

/// HTTP surface of a gossip node.
///
/// Admission happens through the node's bounded queues: a handler blocks
/// when the matching worker falls behind, back-pressuring the caller
/// instead of shedding. Errors are returned only for the caller's own
/// malformed input.
pub fn node_router(node: Arc<Node>) -> Router {
    let cors = cors_layer(
        &node.config.cors,
        &[Method::GET, Method::POST, Method::DELETE],
    );
    Router::new()
        .route("/", get(query_state).post(submit_state))
        .route("/status", get(node_status))
        .route(
            "/peers",
            get(list_node_peers).post(add_node_peer).delete(remove_node_peer),
        )
        .method_not_allowed_fallback(method_not_allowed)
        .layer(cors)
        .with_state(node)
}

/// HTTP surface of the controller.
pub fn controller_router(controller: Arc<Controller>) -> Router {
    let cors = cors_layer(&controller.config.cors, &[Method::GET, Method::POST]);
    Router::new()
        .route("/peers", get(list_graph).post(register_node))
        .method_not_allowed_fallback(method_not_allowed)
        .layer(cors)
        .with_state(controller)
}

async fn query_state(State(node): State<Arc<Node>>) -> Json<types::State> {
    tracing::info!(node = %node, "Received GET /");
    Json(node.query().await)
}

async fn submit_state(
    State(node): State<Arc<Node>>,
    Json(state): Json<types::State>,
) -> Json<MessageResponse> {
    tracing::info!(node = %node, "Received POST /");
    node.submit_state(state).await;
    Json(MessageResponse::new("State received"))
}

async fn node_status(State(node): State<Arc<Node>>) -> Json<StatusResponse> {
    tracing::debug!(node = %node, "Received GET /status");
    Json(StatusResponse {
        last_state: node.status().await,
    })
}

async fn list_node_peers(State(node): State<Arc<Node>>) -> Json<PeersResponse> {
    tracing::info!(node = %node, "Received GET /peers");
    Json(PeersResponse {
        peers: node.list_peers().await,
    })
}

async fn add_node_peer(
    State(node): State<Arc<Node>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(addr): Json<Addr>,
) -> Json<MessageResponse> {
    tracing::info!(node = %node, "Received POST /peers");
    node.request_peering(fill_remote_ip(addr, remote)).await;
    Json(MessageResponse::new("Peering request received"))
}

async fn remove_node_peer(
    State(node): State<Arc<Node>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(addr): Json<Addr>,
) -> Json<MessageResponse> {
    tracing::info!(node = %node, "Received DELETE /peers");
    node.request_peer_removal(fill_remote_ip(addr, remote)).await;
    Json(MessageResponse::new("Peer deletion request received"))
}

async fn list_graph(State(controller): State<Arc<Controller>>) -> Json<NodesResponse> {
    tracing::info!(controller = %controller, "Received GET /peers");
    let nodes = controller
        .list_peers()
        .await
        .into_iter()
        .map(|(address, peers)| NodeEntry { address, peers })
        .collect();
    Json(NodesResponse { nodes })
}

async fn register_node(
    State(controller): State<Arc<Controller>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(addr): Json<Addr>,
) -> (StatusCode, Json<MessageResponse>) {
    tracing::info!(controller = %controller, "Received POST /peers");
    if addr.port == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(MessageResponse::new(
                "Required property 'port' is 0 or not present",
            )),
        );
    }
    controller
        .request_registration(fill_remote_ip(addr, remote))
        .await;
    (
        StatusCode::OK,
        Json(MessageResponse::new("Peer address received")),
    )
}

/// A node behind NAT or a default-bound socket may not know its own
/// address; an empty `ip` means "use the one this request came from".
fn fill_remote_ip(mut addr: Addr, remote: SocketAddr) -> Addr {
    if addr.ip.is_empty() {
        tracing::info!(remote = %remote.ip(), "Auto-detecting IP address for peer");
        addr.ip = remote.ip().to_string();
    }
    addr
}

async fn method_not_allowed() -> (StatusCode, Json<MessageResponse>) {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(MessageResponse::new("Method Not Allowed")),
    )
}

fn cors_layer(cors: &CorsConfig, methods: &[Method]) -> CorsLayer {
    let origin = if cors.allow_origin == "*" {
        AllowOrigin::any()
    } else {
        match cors.allow_origin.parse::<HeaderValue>() {
            Ok(value) => AllowOrigin::exact(value),
            Err(e) => {
                tracing::warn!(origin = %cors.allow_origin, error = %e, "Invalid CORS origin, allowing any");
                AllowOrigin::any()
            }
        }
    };
    let headers: Vec<HeaderName> = cors
        .allow_headers
        .split(',')
        .filter_map(|header| header.trim().parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origin)
        .allow_headers(headers)
        .allow_methods(methods.to_vec())
}
