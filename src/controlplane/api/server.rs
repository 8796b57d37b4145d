//! API Server
//!
//! Runs the REST API and the bootstrap endpoint on separate listeners. The
//! bootstrap listener records peer addresses for the handshake.

use crate::bootstrap::{BootstrapRouter, BootstrapService};
use crate::controlplane::Orchestrator;
use crate::error::{Error, Result};
use axum::{extract::DefaultBodyLimit, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};

use super::rest::RestRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Max request body size
    pub max_body_size: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            request_timeout_secs: 30,
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

/// REST router with tracing, deadline and body limit applied
pub fn rest_app(orchestrator: Arc<Orchestrator>, config: &ApiServerConfig) -> Router {
    RestRouter::new(orchestrator)
        .build()
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )))
        .layer(TraceLayer::new_for_http())
}

/// Bootstrap router; must be served with connect info
pub fn bootstrap_app(service: Arc<BootstrapService>, config: &ApiServerConfig) -> Router {
    BootstrapRouter::new(service)
        .build()
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )))
        .layer(TraceLayer::new_for_http())
}

// =============================================================================
// API Server
// =============================================================================

/// Runs the REST and bootstrap listeners until shutdown
pub struct ApiServer {
    config: ApiServerConfig,
    orchestrator: Arc<Orchestrator>,
    bootstrap: Arc<BootstrapService>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(
        config: ApiServerConfig,
        orchestrator: Arc<Orchestrator>,
        bootstrap: Arc<BootstrapService>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            orchestrator,
            bootstrap,
            shutdown_tx,
        }
    }

    /// Run both servers; returns when either stops
    pub async fn run(&self) -> Result<()> {
        info!("Starting API server");
        info!("  REST API: {}", self.config.rest_addr);
        info!("  Bootstrap: {}", self.bootstrap.config().bind_addr);

        let rest_handle = self.spawn_rest_server();
        let bootstrap_handle = self.spawn_bootstrap_server();

        let (name, result) = tokio::select! {
            result = rest_handle => ("REST", result),
            result = bootstrap_handle => ("Bootstrap", result),
        };

        // Bring the other listener down too
        self.shutdown();

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("{} server error: {}", name, e);
                Err(e)
            }
            Err(e) => {
                error!("{} server task failed: {:?}", name, e);
                Err(Error::Internal(format!("{} server task failed: {}", name, e)))
            }
        }
    }

    fn spawn_rest_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let addr = self.config.rest_addr;
        let app = rest_app(self.orchestrator.clone(), &self.config);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let listener = bind(addr, "REST").await?;
            info!("REST API listening on {}", addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                    info!("REST server shutting down");
                })
                .await
                .map_err(|e| Error::Internal(format!("REST server error: {}", e)))
        })
    }

    fn spawn_bootstrap_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let addr = self.bootstrap.config().bind_addr;
        let app = bootstrap_app(self.bootstrap.clone(), &self.config);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let listener = bind(addr, "bootstrap").await?;
            info!("Bootstrap endpoint listening on {}", addr);

            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Bootstrap server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("Bootstrap server error: {}", e)))
        })
    }

    /// Handle that triggers shutdown from another task
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn bind(addr: SocketAddr, name: &str) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Configuration(format!("Failed to bind {} server on {}: {}", name, addr, e)))
}
