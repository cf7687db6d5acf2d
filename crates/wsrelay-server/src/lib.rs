//! # wsrelay-server
//!
//! Axum HTTP + `WebSocket` relay server.
//!
//! - Frame channels over the inbound (axum) and outbound (tungstenite) sockets
//! - Per-client sessions: pre-open queue, backpressure governor, liveness
//! - Upstream handshake with mirrored or fixed `Origin`/`User-Agent`/`Host`
//! - HTTP endpoints: health, stats, Prometheus metrics, static files
//! - Graceful shutdown via `CancellationToken` + `TaskTracker`

#![deny(unsafe_code)]

pub mod acceptor;
pub mod channel;
pub mod close;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod static_files;
pub mod upstream;

pub use close::CloseReason;
pub use errors::{ChannelError, RelayError, Result};
pub use server::{RelayServer, ServerHandle};
pub use session::{Session, SessionConfig, SessionReport};
pub use shutdown::ShutdownCoordinator;
pub use upstream::{ClientIdentity, TungsteniteConnector, UpstreamConnector};
