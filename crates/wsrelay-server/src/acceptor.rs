//! Connection acceptor: turns upgrade requests into sessions.
//!
//! The designated WebSocket path answers upgrades by starting a
//! [`Session`]; plain requests on it, and on every other unrouted path, go
//! to the static file collaborator. An upgrade aimed at any other path,
//! the HTTP endpoints included, is answered 404.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use crate::channel::Transport;
use crate::metrics;
use crate::server::{AppState, PeerAddr};
use crate::session::Session;
use crate::static_files::StaticFiles;
use crate::upstream::ClientIdentity;

/// Live and lifetime session counts. The only state shared across sessions.
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    open: AtomicUsize,
    total: AtomicU64,
}

impl ConnectionCounter {
    /// Empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot, unless `max` (non-zero) slots are already taken.
    pub fn try_acquire(self: &Arc<Self>, max: usize) -> Option<ConnectionGuard> {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (max == 0 || open < max).then_some(open + 1)
            })
            .ok()?;
        let _ = self.total.fetch_add(1, Ordering::Relaxed);
        Some(ConnectionGuard {
            counter: Arc::clone(self),
        })
    }

    /// Sessions currently holding a slot.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Slots ever handed out.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Releases its slot when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<ConnectionCounter>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let _ = self.counter.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Whether the request asks for a WebSocket upgrade.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn peer_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<PeerAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |ConnectInfo(PeerAddr(addr))| addr.ip())
}

/// Handler for the designated WebSocket path.
pub async fn relay_handler(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    request: Request,
) -> Response {
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) if is_upgrade_request(request.headers()) => {
            debug!(%rejection, "rejected websocket handshake");
            return rejection.into_response();
        }
        Err(_) => {
            let (files, method, path) = static_request(&state, &request);
            return serve_static(files, method, path).await;
        }
    };

    let server = &state.settings.server;
    let identity =
        ClientIdentity::from_request(peer_ip(&request), request.headers(), server.trust_forwarded_for);

    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting Down").into_response();
    }
    let Some(guard) = state.connections.try_acquire(server.max_connections) else {
        metrics::connection_rejected();
        warn!(client_ip = %identity.ip, max = server.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Server Full").into_response();
    };

    let max_message = server.max_message_bytes as usize;
    let mut ws = ws.max_message_size(max_message).max_frame_size(max_message);
    if let Some(first) = identity.protocols.first() {
        ws = ws.protocols([first.clone()]);
    }

    let session = Session::new(
        Arc::clone(&state.session_config),
        identity,
        Arc::clone(&state.connector),
        state.shutdown.token(),
    );
    info!(session_id = %session.id(), open = state.connections.open(), "client accepted");
    let tracker = state.shutdown.tracker().clone();

    ws.on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let _slot = guard;
            let _report = tracker.track_future(session.run(Transport::from_axum(socket))).await;
        })
}

fn stray_upgrade(request: &Request) -> Option<Response> {
    if !is_upgrade_request(request.headers()) {
        return None;
    }
    debug!(path = request.uri().path(), "upgrade on non-relay path");
    Some((StatusCode::NOT_FOUND, "Not Found").into_response())
}

/// Route layer for the plain HTTP endpoints: upgrades there are refused.
pub async fn reject_upgrades(request: Request, next: Next) -> Response {
    match stray_upgrade(&request) {
        Some(response) => response,
        None => next.run(request).await,
    }
}

/// Handler for everything not otherwise routed.
pub async fn fallback_handler(State(state): State<AppState>, request: Request) -> Response {
    if let Some(response) = stray_upgrade(&request) {
        return response;
    }
    let (files, method, path) = static_request(&state, &request);
    serve_static(files, method, path).await
}

/// Owned copies only: a borrowed request would make the handler future `!Send`.
async fn serve_static(files: Arc<StaticFiles>, method: Method, path: String) -> Response {
    files.serve(&method, &path).await
}

fn static_request(state: &AppState, request: &Request) -> (Arc<StaticFiles>, Method, String) {
    (
        Arc::clone(&state.static_files),
        request.method().clone(),
        request.uri().path().to_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderValue;

    #[test]
    fn counter_tracks_open_and_total() {
        let counter = Arc::new(ConnectionCounter::new());
        let a = counter.try_acquire(0).unwrap();
        let b = counter.try_acquire(0).unwrap();
        assert_eq!(counter.open(), 2);
        drop(a);
        assert_eq!(counter.open(), 1);
        drop(b);
        assert_eq!(counter.open(), 0);
        assert_eq!(counter.total(), 2);
    }

    #[test]
    fn counter_enforces_limit() {
        let counter = Arc::new(ConnectionCounter::new());
        let first = counter.try_acquire(1).unwrap();
        assert!(counter.try_acquire(1).is_none());
        assert_eq!(counter.total(), 1);
        drop(first);
        assert!(counter.try_acquire(1).is_some());
    }

    #[test]
    fn upgrade_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));
        let _ = headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_upgrade_request(&headers));
        let _ = headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_upgrade_request(&headers));
    }
}
