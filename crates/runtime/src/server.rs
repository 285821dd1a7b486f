//! The WebSocket server: standalone listener or embeddable router.

use std::time::Duration;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

pub struct ConvoyServer {
    state: AppState,
}

impl ConvoyServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// A router serving the WebSocket endpoint at `path`.
    pub fn router_at(&self, path: &str) -> Router {
        Router::new()
            .route(path, get(ws::upgrade))
            .with_state(self.state.clone())
    }

    /// Embed the endpoint into an existing HTTP application.
    pub fn attach(&self, router: Router, path: &str) -> Router {
        router.merge(self.router_at(path))
    }

    /// Bind and serve until shutdown is signalled.
    pub async fn listen(&self) -> anyhow::Result<()> {
        let server = &self.state.config.server;
        let addr = format!("{}:{}", server.host, server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, path = %server.ws_path, "convoy listening");

        let app = self.router_at(&server.ws_path);
        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await?;
        Ok(())
    }

    /// Stop accepting, wait for outstanding reliable sends (up to their
    /// timeout), then close every connection.
    pub async fn close(&self) {
        self.state.shutdown.notify_waiters();

        let drain = Duration::from_millis(self.state.config.server.reliable_timeout_ms);
        for connection in self.state.connections.list() {
            connection.drain_pending(drain).await;
            connection.request_close();
        }
        tracing::info!("convoy server closed");
    }
}
