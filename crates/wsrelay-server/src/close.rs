//! Why a session ended, and what each peer is told.
//!
//! Every teardown carries exactly one [`CloseReason`]. The reason decides the
//! close code and reason text sent to both peers, the level of the teardown
//! log line and the label on the `wsrelay_session_closes_total` counter.

use std::fmt;

use crate::channel::{CloseInfo, Side};

/// Normal closure.
pub const NORMAL: u16 = 1000;
/// Endpoint going away (idle, pong timeout, shutdown).
pub const GOING_AWAY: u16 = 1001;
/// Close frame without a status code. Never sent on the wire.
pub const NO_STATUS: u16 = 1005;
/// Transport dropped without a close frame. Never sent on the wire.
pub const ABNORMAL: u16 = 1006;
/// Message too big (pre-open queue overflow).
pub const MESSAGE_TOO_BIG: u16 = 1009;
/// Internal or upstream error.
pub const INTERNAL_ERROR: u16 = 1011;
/// Try again later (open timeout, buffer overflow).
pub const TRY_AGAIN_LATER: u16 = 1013;

/// Longest reason text that fits a control frame next to the status code.
const MAX_REASON_BYTES: usize = 123;

/// Whether `code` may appear in a close frame sent by an endpoint.
pub fn is_sendable(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Log level for the teardown line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Expected end of a session.
    Info,
    /// Shedding, timeouts and failures.
    Warn,
}

/// The closed set of ways a session can end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// One peer sent a close frame or its transport ended.
    PeerClosed {
        /// The peer that closed.
        side: Side,
        /// What it sent.
        info: CloseInfo,
    },
    /// A transport failed on an established channel.
    TransportError {
        /// The failing side.
        side: Side,
        /// Error text.
        message: String,
    },
    /// The upstream handshake failed.
    ConnectFailed(String),
    /// The upstream did not open within the deadline.
    OpenTimeout,
    /// No traffic within the idle ceiling.
    IdleTimeout,
    /// A ping went unanswered.
    PongTimeout(Side),
    /// The pre-open queue exceeded its byte ceiling.
    QueueOverflow,
    /// A sink buffered more than the kill threshold.
    BufferOverflow(Side),
    /// The server is draining.
    Shutdown,
}

impl CloseReason {
    /// Close frame sent to both peers.
    pub fn close_info(&self) -> CloseInfo {
        match self {
            Self::PeerClosed { side, info } => relayed(*side, info),
            Self::TransportError { side: Side::Upstream, .. } => {
                CloseInfo::new(INTERNAL_ERROR, "upstream error")
            }
            Self::TransportError { side: Side::Client, .. } => {
                CloseInfo::new(INTERNAL_ERROR, "client error")
            }
            Self::ConnectFailed(_) => CloseInfo::new(INTERNAL_ERROR, "upstream connect failed"),
            Self::OpenTimeout => CloseInfo::new(TRY_AGAIN_LATER, "upstream open timeout"),
            Self::IdleTimeout => CloseInfo::new(GOING_AWAY, "idle timeout"),
            Self::PongTimeout(_) => CloseInfo::new(GOING_AWAY, "pong timeout"),
            Self::QueueOverflow => CloseInfo::new(MESSAGE_TOO_BIG, "queue overflow"),
            Self::BufferOverflow(_) => CloseInfo::new(TRY_AGAIN_LATER, "buffer overflow"),
            Self::Shutdown => CloseInfo::new(GOING_AWAY, "server shutting down"),
        }
    }

    /// Level of the teardown log line.
    pub fn severity(&self) -> Severity {
        match self {
            Self::PeerClosed { .. } | Self::Shutdown => Severity::Info,
            _ => Severity::Warn,
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PeerClosed { side: Side::Client, .. } => "client_closed",
            Self::PeerClosed { side: Side::Upstream, .. } => "upstream_closed",
            Self::TransportError { side: Side::Client, .. } => "client_error",
            Self::TransportError { side: Side::Upstream, .. } => "upstream_error",
            Self::ConnectFailed(_) => "connect_failed",
            Self::OpenTimeout => "open_timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::PongTimeout(_) => "pong_timeout",
            Self::QueueOverflow => "queue_overflow",
            Self::BufferOverflow(_) => "buffer_overflow",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the upstream ended in a way that qualifies for one reconnect.
    pub fn is_abnormal_upstream_end(&self) -> bool {
        match self {
            Self::PeerClosed { side: Side::Upstream, info } => info.code != NORMAL,
            Self::TransportError { side: Side::Upstream, .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed { side, info } => {
                write!(f, "{side} closed with {} {:?}", info.code, info.reason)
            }
            Self::TransportError { side, message } => write!(f, "{side} transport error: {message}"),
            Self::ConnectFailed(message) => write!(f, "upstream connect failed: {message}"),
            Self::PongTimeout(side) => write!(f, "{side} pong timeout"),
            Self::BufferOverflow(side) => write!(f, "{side} buffer overflow"),
            other => f.write_str(&other.close_info().reason),
        }
    }
}

/// What to send the surviving peer when the other one closed.
fn relayed(side: Side, info: &CloseInfo) -> CloseInfo {
    if is_sendable(info.code) {
        return CloseInfo::new(info.code, truncate_reason(&info.reason));
    }
    if info.code == NO_STATUS {
        CloseInfo::new(NORMAL, "")
    } else {
        CloseInfo::new(INTERNAL_ERROR, format!("{side} error"))
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
