//! HTTP server lifecycle.

use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::router;
use crate::error::{Result, WardenError};
use crate::gateway::RateLimitGateway;

/// HTTP server for the rate limit API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Router serving the API
    app: Router,
}

impl HttpServer {
    /// Create a server exposing the API for `gateway`.
    pub fn new(addr: SocketAddr, gateway: RateLimitGateway) -> Self {
        Self {
            addr,
            app: router(gateway),
        }
    }

    /// Bind the configured address. Port 0 picks a free port.
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            WardenError::Io(e)
        })
    }

    /// Start the server. Blocks until the server fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Start the server, draining in-flight requests once `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind().await?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr().unwrap_or(self.addr);
        info!(addr = %local_addr, "Starting HTTP server for rate limit API");

        axum::serve(listener, self.app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                WardenError::Server(e.to_string())
            })
    }
}
