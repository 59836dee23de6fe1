//! Monitor HTTP server

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::handlers;
use crate::config::MonitorConfig;
use crate::error::{NetworkError, Result};
use crate::session::Session;

/// Shared state behind every handler
pub struct AppState {
    pub session: Arc<Session>,
    /// "sender" or "receiver"
    pub mode: String,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(session: Arc<Session>, mode: impl Into<String>) -> Self {
        Self {
            session,
            mode: mode.into(),
            started_at: Instant::now(),
        }
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/diagnostics", get(handlers::get_diagnostics))
        .route("/api/devices", get(handlers::get_devices))
        .route("/api/profiles", get(handlers::get_profiles))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Diagnostics web server
pub struct MonitorServer {
    config: MonitorConfig,
    state: Arc<AppState>,
}

impl MonitorServer {
    pub fn new(config: MonitorConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    fn addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.http_port);
        addr.parse()
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)).into())
    }

    /// Serve until `cancel` fires
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

        tracing::info!("Monitor available at http://{}", addr);

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }

    /// Start the server on its own task
    pub fn start_background(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.serve(cancel).await {
                tracing::error!("Monitor server error: {}", e);
            }
        })
    }
}
