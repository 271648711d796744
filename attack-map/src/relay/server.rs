//! Viewer-facing HTTP/WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, header};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{Span, info, warn};

use super::connection::{ConnectionConfig, run_connection};
use super::registry::ClientRegistry;
use crate::error::{Error, Result};

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub connection: ConnectionConfig,
    /// How long open viewers get to receive their close frame on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8083,
            connection: ConnectionConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
struct RelayState {
    registry: Arc<ClientRegistry>,
    connection: ConnectionConfig,
    started: Instant,
    shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    viewers: usize,
}

pub struct RelayServer {
    config: RelayServerConfig,
    registry: Arc<ClientRegistry>,
    token: CancellationToken,
}

impl RelayServer {
    pub fn new(
        config: RelayServerConfig,
        registry: Arc<ClientRegistry>,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            token,
        }
    }

    pub fn router(&self) -> Router {
        let state = RelayState {
            registry: self.registry.clone(),
            connection: self.config.connection.clone(),
            started: Instant::now(),
            shutdown: self.token.clone(),
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);

        Router::new()
            .route("/websocket", get(websocket_handler))
            .route("/health", get(health))
            .with_state(state)
            .layer(cors)
            .layer(SetResponseHeaderLayer::overriding(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::X_FRAME_OPTIONS,
                HeaderValue::from_static("DENY"),
            ))
            .layer(TraceLayer::new_for_http().make_span_with(|req: &Request| {
                if req.uri().path() == "/health" {
                    Span::none()
                } else {
                    tracing::info_span!("http", method = %req.method(), path = %req.uri().path())
                }
            }))
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid relay bind address: {e}")))?;
        Ok(TcpListener::bind(addr).await?)
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve until the token is cancelled, then give viewers up to the
    /// shutdown timeout to be closed.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Relay listening on ws://{}/websocket", addr);

        let token = self.token.clone();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            info!("Relay server shutting down");
        })
        .await?;

        // Upgraded sockets outlive the HTTP server; wait for them to drain.
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while !self.registry.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.registry.len(), "Viewers still open after shutdown timeout");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| {
        run_connection(
            socket,
            Some(addr),
            state.registry,
            state.connection,
            state.shutdown,
        )
    })
}

async fn health(State(state): State<RelayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started.elapsed().as_secs(),
        viewers: state.registry.len(),
    })
}
