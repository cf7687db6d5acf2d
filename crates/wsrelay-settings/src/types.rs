//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file only needs the keys it wants to change. Each type implements
//! [`Default`] with production values.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

const MIB: u64 = 1024 * 1024;

/// Root settings type for the relay.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Listener, routing and HTTP endpoint settings.
    pub server: ServerSettings,
    /// Upstream target and handshake header policy.
    pub upstream: UpstreamSettings,
    /// Queue and backpressure byte thresholds.
    pub limits: LimitSettings,
    /// Session timers.
    pub timeouts: TimeoutSettings,
    /// Social preview meta tags injected into served HTML.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<PreviewSettings>,
    /// Logging output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let url = self.upstream.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "upstream.url must be a ws:// or wss:// URL, got {url:?}"
            )));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.wsPath must start with '/', got {:?}",
                self.server.ws_path
            )));
        }
        let limits = &self.limits;
        if limits.resume_bytes >= limits.pause_bytes {
            return Err(SettingsError::InvalidValue(
                "limits.resumeBytes must be below limits.pauseBytes".into(),
            ));
        }
        if limits.kill_bytes <= limits.pause_bytes {
            return Err(SettingsError::InvalidValue(
                "limits.killBytes must be above limits.pauseBytes".into(),
            ));
        }
        if self.server.max_message_bytes > limits.kill_bytes {
            return Err(SettingsError::InvalidValue(
                "server.maxMessageBytes must not exceed limits.killBytes".into(),
            ));
        }
        if limits.queue_max_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "limits.queueMaxBytes must be positive".into(),
            ));
        }
        let t = &self.timeouts;
        let intervals = [
            ("limits.governorIntervalMs", limits.governor_interval_ms),
            ("timeouts.openTimeoutMs", t.open_timeout_ms),
            ("timeouts.idleTimeoutMs", t.idle_timeout_ms),
            ("timeouts.idleCheckIntervalMs", t.idle_check_interval_ms),
            ("timeouts.pingIntervalMs", t.ping_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(SettingsError::InvalidValue(format!("{name} must be positive")));
        }
        Ok(())
    }
}

/// Listener, routing and HTTP endpoint settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listening port (HTTP and WebSocket share it).
    pub port: u16,
    /// The only path that accepts WebSocket upgrades.
    pub ws_path: String,
    /// Root directory for static files.
    pub public_dir: String,
    /// Document served for `/` and for unknown paths.
    pub default_document: String,
    /// Liveness probe path.
    pub health_path: String,
    /// JSON connection statistics path.
    pub stats_path: String,
    /// Prometheus exposition path.
    pub metrics_path: String,
    /// Whether the Prometheus recorder is installed.
    pub metrics_enabled: bool,
    /// Maximum concurrent sessions (0 = unlimited).
    pub max_connections: usize,
    /// Take the client IP from the first `X-Forwarded-For` entry.
    pub trust_forwarded_for: bool,
    /// Max WebSocket message size in bytes, applied to both sockets.
    pub max_message_bytes: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/".to_string(),
            public_dir: "public".to_string(),
            default_document: "index.html".to_string(),
            health_path: "/health".to_string(),
            stats_path: "/stats".to_string(),
            metrics_path: "/metrics".to_string(),
            metrics_enabled: true,
            max_connections: 0,
            trust_forwarded_for: false,
            max_message_bytes: 64 * MIB,
        }
    }
}

/// How an outbound handshake header is derived from the inbound request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum HeaderPolicy {
    /// Copy the client's value; omit the header when the client sent none.
    #[default]
    Mirror,
    /// Always send the configured value.
    Fixed {
        /// Value sent upstream.
        value: String,
    },
    /// Copy the client's value, falling back to the configured one.
    Hybrid {
        /// Fallback value.
        value: String,
    },
}

impl HeaderPolicy {
    /// Resolve the outbound value given what the client sent.
    pub fn resolve<'a>(&'a self, client_value: Option<&'a str>) -> Option<&'a str> {
        match self {
            Self::Mirror => client_value,
            Self::Fixed { value } => Some(value.as_str()),
            Self::Hybrid { value } => client_value.or(Some(value.as_str())),
        }
    }
}

/// Upstream target and handshake header policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    /// The fixed upstream WebSocket URL.
    pub url: String,
    /// `Origin` header policy.
    pub origin: HeaderPolicy,
    /// `User-Agent` header policy.
    pub user_agent: HeaderPolicy,
    /// Fixed `Host` header; `None` sends the upstream hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_override: Option<String>,
    /// Send `X-Real-IP`, `X-Forwarded-For` and `X-Forwarded-Origin`.
    pub forward_client_ip: bool,
    /// Reconnect once if the upstream closes abnormally within this window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_close_retry_ms: Option<u64>,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: "wss://127.0.0.1:8443/".to_string(),
            origin: HeaderPolicy::Mirror,
            user_agent: HeaderPolicy::Mirror,
            host_override: None,
            forward_client_ip: true,
            early_close_retry_ms: None,
        }
    }
}

/// Queue and backpressure byte thresholds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitSettings {
    /// Pre-open queue ceiling.
    pub queue_max_bytes: u64,
    /// Sink buffer size that pauses the opposite reader.
    pub pause_bytes: u64,
    /// Sink buffer size below which a paused reader resumes.
    pub resume_bytes: u64,
    /// Sink buffer size that aborts the session.
    pub kill_bytes: u64,
    /// Governor sampling period in milliseconds.
    pub governor_interval_ms: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            queue_max_bytes: 16 * MIB,
            pause_bytes: 16 * MIB,
            resume_bytes: 4 * MIB,
            kill_bytes: 64 * MIB,
            governor_interval_ms: 25,
        }
    }
}

/// Session timers, all in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    /// Deadline for the upstream handshake.
    pub open_timeout_ms: u64,
    /// Inactivity ceiling.
    pub idle_timeout_ms: u64,
    /// How often inactivity is checked.
    pub idle_check_interval_ms: u64,
    /// Keepalive ping period.
    pub ping_interval_ms: u64,
    /// Optional deadline for a pong after a ping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pong_timeout_ms: Option<u64>,
    /// Time between graceful close and forced termination.
    pub close_grace_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            open_timeout_ms: 10_000,
            idle_timeout_ms: 300_000,
            idle_check_interval_ms: 10_000,
            ping_interval_ms: 15_000,
            pong_timeout_ms: None,
            close_grace_ms: 250,
        }
    }
}

/// Social preview meta tags.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewSettings {
    /// `og:title` / `twitter:title`.
    pub title: Option<String>,
    /// `og:description` / `description`.
    pub description: Option<String>,
    /// `og:image` / `twitter:image`.
    pub image: Option<String>,
    /// `og:url`.
    pub url: Option<String>,
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable, for terminals.
    Pretty,
}

/// Logging output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter; `RUST_LOG` takes precedence.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = RelaySettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.ws_path, "/");
        assert_eq!(settings.limits.pause_bytes, 16 * MIB);
        assert_eq!(settings.limits.resume_bytes, 4 * MIB);
        assert_eq!(settings.limits.kill_bytes, 64 * MIB);
        assert_eq!(settings.timeouts.close_grace_ms, 250);
        assert!(settings.timeouts.pong_timeout_ms.is_none());
        assert!(settings.upstream.early_close_retry_ms.is_none());
    }

    #[test]
    fn header_policy_resolution() {
        let mirror = HeaderPolicy::Mirror;
        assert_eq!(mirror.resolve(Some("https://a")), Some("https://a"));
        assert_eq!(mirror.resolve(None), None);

        let fixed = HeaderPolicy::Fixed { value: "https://game".into() };
        assert_eq!(fixed.resolve(Some("https://a")), Some("https://game"));
        assert_eq!(fixed.resolve(None), Some("https://game"));

        let hybrid = HeaderPolicy::Hybrid { value: "https://game".into() };
        assert_eq!(hybrid.resolve(Some("https://a")), Some("https://a"));
        assert_eq!(hybrid.resolve(None), Some("https://game"));
    }

    #[test]
    fn header_policy_json_shape() {
        let policy: HeaderPolicy =
            serde_json::from_str(r#"{"mode":"fixed","value":"https://x"}"#).unwrap();
        assert_eq!(policy, HeaderPolicy::Fixed { value: "https://x".into() });
        let mirror: HeaderPolicy = serde_json::from_str(r#"{"mode":"mirror"}"#).unwrap();
        assert_eq!(mirror, HeaderPolicy::Mirror);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: RelaySettings =
            serde_json::from_str(r#"{"server":{"port":9000}}"#).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.limits.queue_max_bytes, 16 * MIB);
    }

    #[test]
    fn rejects_non_websocket_upstream() {
        let mut settings = RelaySettings::default();
        settings.upstream.url = "https://example.com".into();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("upstream.url"));
    }

    #[test]
    fn rejects_inverted_hysteresis() {
        let mut settings = RelaySettings::default();
        settings.limits.resume_bytes = settings.limits.pause_bytes;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_kill_below_pause() {
        let mut settings = RelaySettings::default();
        settings.limits.kill_bytes = settings.limits.pause_bytes;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_message_larger_than_kill_threshold() {
        let mut settings = RelaySettings::default();
        settings.server.max_message_bytes = settings.limits.kill_bytes + 1;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("maxMessageBytes"));

        settings.server.max_message_bytes = settings.limits.kill_bytes;
        settings.validate().unwrap();
    }

    #[test]
    fn rejects_zero_interval() {
        let mut settings = RelaySettings::default();
        settings.timeouts.ping_interval_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("pingIntervalMs"));
    }

    #[test]
    fn rejects_relative_ws_path() {
        let mut settings = RelaySettings::default();
        settings.server.ws_path = "wss".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn log_format_lowercase() {
        let json = serde_json::to_string(&LogFormat::Pretty).unwrap();
        assert_eq!(json, r#""pretty""#);
    }
}
