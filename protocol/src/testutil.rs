//! Shared helpers for unit tests: loopback peer servers standing in for
//! remote nodes, and fast-turnaround configurations.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::types::Addr;

/// Bind a router on an ephemeral loopback port, acting as a remote peer.
/// The server lives until the test runtime shuts down.
pub(crate) async fn spawn_peer_server(router: Router) -> Addr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Addr::new("127.0.0.1", port)
}

/// An address nothing listens on: bind an ephemeral port, then release it.
pub(crate) async fn dead_addr() -> Addr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Addr::new("127.0.0.1", port)
}

/// Poll an asynchronous condition until it holds or the deadline passes.
pub(crate) async fn wait_until<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check().await
}

/// Configuration with millisecond-scale delays so retry and ping paths run
/// in test time.
pub(crate) fn fast_config() -> Arc<Config> {
    let mut config = Config::default();
    config.node.ping_interval = Duration::from_millis(100);
    config.peer.backoff_duration = Duration::from_millis(1);
    Arc::new(config)
}
