//! `GqlwsServer`: Axum HTTP + WebSocket server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use gqlws_core::SUBPROTOCOL;
use gqlws_core::auth::{AllowAll, Authorizer};
use gqlws_core::execution::Executor;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::engine::EngineOptions;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{SessionContext, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Per-connection session wiring.
    pub session: SessionContext,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// One permit per allowed connection.
    pub connections: Arc<Semaphore>,
    /// Connection limit the semaphore was sized with.
    pub max_connections: usize,
    /// Max inbound WebSocket message size.
    pub max_message_size: usize,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, if a recorder was installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The gqlws server.
pub struct GqlwsServer {
    config: ServerConfig,
    executor: Arc<dyn Executor>,
    authorizer: Arc<dyn Authorizer>,
    connections: Arc<Semaphore>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl GqlwsServer {
    /// Create a server executing operations with `executor`.
    pub fn new(config: ServerConfig, executor: Arc<dyn Executor>) -> Self {
        Self {
            connections: Arc::new(Semaphore::new(config.max_connections)),
            config,
            executor,
            authorizer: Arc::new(AllowAll),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Check `connection_init` payloads with `authorizer`.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            session: SessionContext {
                executor: Arc::clone(&self.executor),
                authorizer: Arc::clone(&self.authorizer),
                options: EngineOptions::from(&self.config),
                outbound_buffer: self.config.outbound_buffer,
                shutdown: self.shutdown.token(),
            },
            shutdown: Arc::clone(&self.shutdown),
            connections: Arc::clone(&self.connections),
            max_connections: self.config.max_connections,
            max_message_size: self.config.max_message_size,
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.config.endpoint_path(), get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and start serving in the background.
    pub async fn listen(self) -> Result<ServerHandle, std::io::Error> {
        let router = self.router();
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let path = self.config.endpoint_path();
        info!(%addr, path, "gqlws server listening");

        let token = self.shutdown.token();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });

        Ok(ServerHandle {
            addr,
            path,
            shutdown: self.shutdown,
            timeout: self.config.shutdown_timeout(),
            task,
        })
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    path: String,
    shutdown: Arc<ShutdownCoordinator>,
    timeout: Duration,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL of the GraphQL endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, self.path)
    }

    /// Get the shutdown coordinator.
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Stop accepting, tear down every session and wait for them.
    pub async fn shutdown(self) {
        info!("shutting down gqlws server");
        self.shutdown
            .graceful_shutdown(self.task, self.timeout)
            .await;
        info!("gqlws server stopped");
    }

    /// Serve until `signal` resolves, then shut down gracefully.
    pub async fn run_until(self, signal: impl Future<Output = ()>) {
        signal.await;
        self.shutdown().await;
    }
}

/// GET on the GraphQL path: `graphql-ws` WebSocket upgrade.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    let Ok(permit) = Arc::clone(&state.connections).try_acquire_owned() else {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(max = state.max_connections, "connection limit reached, rejecting upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let ws = ws
        .protocols([SUBPROTOCOL])
        .max_message_size(state.max_message_size);
    if ws.selected_protocol().is_none() {
        debug!("client did not offer the {SUBPROTOCOL} subprotocol");
    }

    let connection_id = uuid::Uuid::now_v7().to_string();
    let shutdown = Arc::clone(&state.shutdown);
    let session = state.session;
    ws.on_upgrade(move |socket| async move {
        let _permit = permit;
        shutdown
            .track_session(run_ws_session(socket, connection_id, session))
            .await;
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let open = state
        .max_connections
        .saturating_sub(state.connections.available_permits());
    Json(health::health_check(
        state.start_time,
        open,
        state.max_connections,
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
