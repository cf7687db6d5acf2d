//! Outbound side: who the client is, what the upstream is told, and how the
//! upstream connection gets made.

use std::net::IpAddr;

use async_trait::async_trait;
use axum::http::HeaderMap;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{self, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;
use wsrelay_settings::UpstreamSettings;

use crate::channel::Transport;
use crate::channel::transport::tune_upstream;
use crate::errors::ChannelError;

const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_ORIGIN: HeaderName = HeaderName::from_static("x-forwarded-origin");

/// What the acceptor learned about a client at upgrade time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Client address (peer address, or forwarded address when trusted).
    pub ip: IpAddr,
    /// The client's `Origin`, if sent.
    pub origin: Option<String>,
    /// The client's `User-Agent`, if sent.
    pub user_agent: Option<String>,
    /// Requested subprotocols, in request order.
    pub protocols: Vec<String>,
}

impl ClientIdentity {
    /// Extract identity from the upgrade request.
    pub fn from_request(peer: IpAddr, headers: &HeaderMap, trust_forwarded_for: bool) -> Self {
        let ip = if trust_forwarded_for {
            forwarded_ip(headers).unwrap_or(peer)
        } else {
            peer
        };
        let text = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let protocols = headers
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_protocols)
            .collect();
        Self {
            ip,
            origin: text(header::ORIGIN),
            user_agent: text(header::USER_AGENT),
            protocols,
        }
    }
}

/// Split a `Sec-WebSocket-Protocol` value into its tokens.
pub fn parse_protocols(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(X_FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Build the upstream handshake request for one client.
pub fn build_request(
    settings: &UpstreamSettings,
    identity: &ClientIdentity,
) -> Result<Request, ChannelError> {
    let mut request = settings.url.as_str().into_client_request()?;
    let headers = request.headers_mut();

    let value = |v: &str| {
        HeaderValue::from_str(v).map_err(|e| ChannelError::InvalidRequest(format!("{v:?}: {e}")))
    };

    if let Some(origin) = settings.origin.resolve(identity.origin.as_deref()) {
        let _ = headers.insert(header::ORIGIN, value(origin)?);
    }
    if let Some(agent) = settings.user_agent.resolve(identity.user_agent.as_deref()) {
        let _ = headers.insert(header::USER_AGENT, value(agent)?);
    }
    if let Some(host) = &settings.host_override {
        let _ = headers.insert(header::HOST, value(host)?);
    }
    if settings.forward_client_ip {
        let ip = identity.ip.to_string();
        let _ = headers.insert(X_REAL_IP, value(&ip)?);
        let _ = headers.insert(X_FORWARDED_FOR, value(&ip)?);
        if let Some(origin) = &identity.origin {
            let _ = headers.insert(X_FORWARDED_ORIGIN, value(origin)?);
        }
    }
    let _ = headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    let _ = headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    if !identity.protocols.is_empty() {
        let _ = headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value(&identity.protocols.join(", "))?);
    }
    Ok(request)
}

/// Opens the upstream connection for a session.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connect on behalf of `identity`. Resolves once the upstream is OPEN.
    async fn connect(&self, identity: &ClientIdentity) -> Result<Transport, ChannelError>;
}

/// Production connector over `tokio-tungstenite` with rustls.
#[derive(Debug)]
pub struct TungsteniteConnector {
    settings: UpstreamSettings,
    config: WebSocketConfig,
}

impl TungsteniteConnector {
    /// Connector for the configured upstream; `max_message_bytes` bounds
    /// inbound messages and frames.
    pub fn new(settings: UpstreamSettings, max_message_bytes: usize) -> Self {
        let config = WebSocketConfig::default()
            .max_message_size(Some(max_message_bytes))
            .max_frame_size(Some(max_message_bytes));
        Self { settings, config }
    }
}

#[async_trait]
impl UpstreamConnector for TungsteniteConnector {
    async fn connect(&self, identity: &ClientIdentity) -> Result<Transport, ChannelError> {
        let request = build_request(&self.settings, identity)?;
        let (stream, response) =
            tokio_tungstenite::connect_async_with_config(request, Some(self.config), true).await?;
        tune_upstream(stream.get_ref());
        debug!(status = %response.status(), url = %self.settings.url, "upstream handshake complete");
        Ok(Transport::from_tungstenite(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use wsrelay_settings::HeaderPolicy;

    fn identity() -> ClientIdentity {
        ClientIdentity {
            ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
            origin: Some("https://play.example".into()),
            user_agent: Some("GameClient/1.0".into()),
            protocols: vec!["motd".into(), "v2".into()],
        }
    }

    fn settings() -> UpstreamSettings {
        UpstreamSettings {
            url: "wss://upstream.example:9443/socket".into(),
            ..UpstreamSettings::default()
        }
    }

    fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
        request.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn identity_from_headers() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(header::ORIGIN, HeaderValue::from_static("https://a.example"));
        let _ = headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("one, two"));
        let _ = headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.4, 10.0.0.1"));
        let peer = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let untrusted = ClientIdentity::from_request(peer, &headers, false);
        assert_eq!(untrusted.ip, peer);
        assert_eq!(untrusted.origin.as_deref(), Some("https://a.example"));
        assert_eq!(untrusted.user_agent, None);
        assert_eq!(untrusted.protocols, vec!["one", "two"]);

        let trusted = ClientIdentity::from_request(peer, &headers, true);
        assert_eq!(trusted.ip, "198.51.100.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn mirror_policy_copies_client_headers() {
        let request = build_request(&settings(), &identity()).unwrap();
        assert_eq!(header(&request, "origin"), Some("https://play.example"));
        assert_eq!(header(&request, "user-agent"), Some("GameClient/1.0"));
        assert_eq!(header(&request, "host"), Some("upstream.example:9443"));
        assert_eq!(header(&request, "sec-websocket-protocol"), Some("motd, v2"));
        assert_eq!(header(&request, "cache-control"), Some("no-cache"));
        assert_eq!(header(&request, "pragma"), Some("no-cache"));
        assert_eq!(header(&request, "x-real-ip"), Some("203.0.113.7"));
        assert_eq!(header(&request, "x-forwarded-for"), Some("203.0.113.7"));
        assert_eq!(header(&request, "x-forwarded-origin"), Some("https://play.example"));
    }

    #[test]
    fn mirror_policy_omits_missing_origin() {
        let anonymous = ClientIdentity {
            origin: None,
            user_agent: None,
            protocols: Vec::new(),
            ..identity()
        };
        let request = build_request(&settings(), &anonymous).unwrap();
        assert_eq!(header(&request, "origin"), None);
        assert_eq!(header(&request, "sec-websocket-protocol"), None);
        assert_eq!(header(&request, "x-forwarded-origin"), None);
    }

    #[test]
    fn fixed_and_hybrid_policies() {
        let upstream = UpstreamSettings {
            origin: HeaderPolicy::Fixed { value: "https://upstream.example".into() },
            user_agent: HeaderPolicy::Hybrid { value: "Mozilla/5.0".into() },
            host_override: Some("game.example".into()),
            forward_client_ip: false,
            ..settings()
        };
        let anonymous = ClientIdentity {
            user_agent: None,
            ..identity()
        };
        let request = build_request(&upstream, &anonymous).unwrap();
        assert_eq!(header(&request, "origin"), Some("https://upstream.example"));
        assert_eq!(header(&request, "user-agent"), Some("Mozilla/5.0"));
        assert_eq!(header(&request, "host"), Some("game.example"));
        assert_eq!(header(&request, "x-real-ip"), None);
    }

    #[test]
    fn bad_header_value_is_invalid_request() {
        let upstream = UpstreamSettings {
            origin: HeaderPolicy::Fixed { value: "bad\nvalue".into() },
            ..settings()
        };
        let err = build_request(&upstream, &identity()).unwrap_err();
        assert_eq!(err.error_kind(), "invalid_request");
    }
}
