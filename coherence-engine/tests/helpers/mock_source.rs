//! Local HTTP source backed by an axum router

use axum::Router;
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral loopback port and return its base URL
///
/// The server task lives until the test runtime shuts down.
pub async fn spawn_source(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
