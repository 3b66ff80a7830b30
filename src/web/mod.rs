mod pages;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::service::Service;

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub service: Service,
    pub config: Arc<Config>,
}

impl AppState {
    #[must_use]
    pub fn new(service: Service, config: Arc<Config>) -> Self {
        Self { service, config }
    }
}

/// Serve the HTTP ingress until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the address is invalid or the listener cannot bind.
pub async fn serve(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.web_host, state.config.web_port)
        .parse()
        .context("Invalid web server address")?;

    let app = create_app(state);

    info!(addr = %addr, "Starting HTTP web server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind web server")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("Web server error")?;

    info!("Web server stopped");
    Ok(())
}

/// Create the application router.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
