//! `RelayServer` — Axum HTTP + WebSocket server on one listening socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::connect_info::Connected;
use axum::http::{StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::serve::{IncomingStream, Listener};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tower_http::trace::TraceLayer;
use tracing::info;
use wsrelay_settings::RelaySettings;

use crate::acceptor::{self, ConnectionCounter};
use crate::channel::transport::tune_socket;
use crate::errors::{RelayError, Result};
use crate::health::{self, HEALTH_BODY, StatsResponse};
use crate::session::SessionConfig;
use crate::shutdown::ShutdownCoordinator;
use crate::static_files::StaticFiles;
use crate::upstream::{TungsteniteConnector, UpstreamConnector};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Effective settings.
    pub settings: Arc<RelaySettings>,
    /// Per-session limits derived from settings.
    pub session_config: Arc<SessionConfig>,
    /// Opens upstream connections.
    pub connector: Arc<dyn UpstreamConnector>,
    /// Static file collaborator.
    pub static_files: Arc<StaticFiles>,
    /// Live session counter.
    pub connections: Arc<ConnectionCounter>,
    /// Shutdown coordinator.
    pub shutdown: ShutdownCoordinator,
    /// Prometheus handle, when metrics are enabled.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// Remote address of an accepted TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, TunedListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TunedListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

/// TCP listener that applies socket tuning to every accepted connection.
#[derive(Debug)]
pub struct TunedListener {
    inner: TcpListener,
}

impl TunedListener {
    /// Wrap a bound listener.
    pub fn new(inner: TcpListener) -> Self {
        Self { inner }
    }
}

impl Listener for TunedListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let (stream, addr) = Listener::accept(&mut self.inner).await;
        tune_socket(&stream);
        (stream, addr)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// The relay server.
pub struct RelayServer {
    state: AppState,
}

impl RelayServer {
    /// Server that connects upstream with the production connector.
    pub fn new(settings: RelaySettings, metrics: Option<PrometheusHandle>) -> Self {
        let connector = TungsteniteConnector::new(
            settings.upstream.clone(),
            settings.server.max_message_bytes as usize,
        );
        Self::with_connector(settings, Arc::new(connector), metrics)
    }

    /// Server with a caller-provided upstream connector.
    pub fn with_connector(
        settings: RelaySettings,
        connector: Arc<dyn UpstreamConnector>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let static_files = StaticFiles::new(
            &settings.server.public_dir,
            settings.server.default_document.clone(),
            settings.preview.clone(),
        );
        let state = AppState {
            session_config: Arc::new(SessionConfig::from(&settings)),
            settings: Arc::new(settings),
            connector,
            static_files: Arc::new(static_files),
            connections: Arc::new(ConnectionCounter::new()),
            shutdown: ShutdownCoordinator::new(),
            metrics,
            start_time: Instant::now(),
        };
        Self { state }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let server = &self.state.settings.server;
        let mut router = Router::new()
            .route(&server.health_path, get(health_handler))
            .route(&server.stats_path, get(stats_handler));
        if self.state.metrics.is_some() {
            router = router.route(&server.metrics_path, get(metrics_handler));
        }
        router
            .route_layer(middleware::from_fn(acceptor::reject_upgrades))
            .route(&server.ws_path, any(acceptor::relay_handler))
            .fallback(acceptor::fallback_handler)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Live session counter.
    pub fn connections(&self) -> &Arc<ConnectionCounter> {
        &self.state.connections
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.state.shutdown
    }

    /// Refuse to start with settings that would fail every session.
    fn check_settings(&self) -> Result<()> {
        let settings = &self.state.settings;
        settings.validate()?;
        let _request = settings
            .upstream
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::InvalidUpstream(e.to_string()))?;
        Ok(())
    }

    /// Bind the configured address and start serving.
    pub async fn listen(self) -> Result<ServerHandle> {
        let server = &self.state.settings.server;
        let addr = format!("{}:{}", server.host, server.port);
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener)
    }

    /// Serve on an already-bound listener.
    pub fn serve(self, listener: TcpListener) -> Result<ServerHandle> {
        self.check_settings()?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let shutdown = self.state.shutdown.clone();
        let token = shutdown.token();

        info!(
            %local_addr,
            ws_path = %self.state.settings.server.ws_path,
            upstream = %self.state.settings.upstream.url,
            "relay server started"
        );

        let task = tokio::spawn(async move {
            axum::serve(
                TunedListener::new(listener),
                router.into_make_service_with_connect_info::<PeerAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        });

        Ok(ServerHandle {
            local_addr,
            shutdown,
            connections: Arc::clone(&self.state.connections),
            task,
        })
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: ShutdownCoordinator,
    connections: Arc<ConnectionCounter>,
    task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions currently open.
    pub fn open_connections(&self) -> usize {
        self.connections.open()
    }

    /// Stop accepting, close every session with "server shutting down" and
    /// wait up to `drain_timeout` for them to finish.
    pub async fn shutdown(self, drain_timeout: Option<Duration>) -> Result<()> {
        let _ = self.shutdown.drain(drain_timeout).await;
        match self.task.await {
            Ok(result) => result.map_err(RelayError::from),
            Err(join) => Err(RelayError::Io(io::Error::other(join))),
        }
    }
}

/// GET health path.
async fn health_handler() -> &'static str {
    HEALTH_BODY
}

/// GET stats path.
async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(health::stats(
        state.start_time,
        state.connections.open(),
        state.connections.total(),
    ))
}

/// GET metrics path.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
