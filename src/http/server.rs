//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::middleware::{rate_limit, GateState};
use crate::config::ServerConfig;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{Clock, RateLimiter, SystemClock};

/// HTTP server that gates every route behind the rate limiter.
pub struct HttpServer<C: Clock = SystemClock> {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter<C>>,
    /// Whether proxy headers identify the client
    trust_forwarded_headers: bool,
    /// How often idle buckets are swept, if at all
    sweep_interval: Option<Duration>,
}

impl<C: Clock + 'static> HttpServer<C> {
    /// Create a new HTTP server around a rate limiter.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter<C>>) -> Self {
        Self {
            addr,
            rate_limiter,
            trust_forwarded_headers: false,
            sweep_interval: None,
        }
    }

    /// Create a server from its configuration section.
    pub fn from_config(config: &ServerConfig, rate_limiter: Arc<RateLimiter<C>>) -> Self {
        Self::new(config.listen_addr, rate_limiter)
            .trust_forwarded_headers(config.trust_forwarded_headers)
    }

    /// Identify clients by `X-Forwarded-For` / `X-Real-IP` when present.
    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Sweep idle buckets every `interval`. A zero interval disables sweeping.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Build the router with the rate limiting layer applied.
    pub fn router(&self) -> Router {
        let gate = GateState {
            limiter: self.rate_limiter.clone(),
            trust_forwarded_headers: self.trust_forwarded_headers,
        };

        Router::new()
            .route("/", get(root))
            .route("/health", get(health))
            .layer(from_fn_with_state(gate, rate_limit::<C>))
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(
            addr = %listener.local_addr()?,
            capacity = self.rate_limiter.capacity(),
            refill_rate = self.rate_limiter.refill_rate(),
            trust_forwarded_headers = self.trust_forwarded_headers,
            "Starting HTTP server"
        );

        let app = self.router();
        let sweeper = self.spawn_sweeper();

        let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await;

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        result.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }

    /// Periodically evict buckets that have been full for a whole interval.
    fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let interval = self.sweep_interval?;
        let limiter = self.rate_limiter.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = limiter.evict_idle(interval);
                debug!(evicted, tracked = limiter.bucket_count(), "Idle bucket sweep finished");
            }
        }))
    }
}

impl<C: Clock> std::fmt::Debug for HttpServer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("addr", &self.addr)
            .field("rate_limiter", &self.rate_limiter)
            .field("trust_forwarded_headers", &self.trust_forwarded_headers)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

async fn root() -> &'static str {
    "ok"
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
