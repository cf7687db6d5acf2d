//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `WSRELAY_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{HeaderPolicy, LogFormat, RelaySettings};

/// Source of `WSRELAY_*` values, normally the process environment.
pub type EnvLookup = dyn Fn(&str) -> Option<String>;

/// Default settings file, relative to the working directory.
pub fn settings_path() -> PathBuf {
    PathBuf::from("wsrelay.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults (plus env overrides). If the
/// file contains invalid JSON, or the merged result fails validation,
/// returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, &|name| std::env::var(name).ok());
}

/// Apply `WSRELAY_*` overrides read through `lookup`.
pub fn apply_overrides(settings: &mut RelaySettings, lookup: &EnvLookup) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string(lookup, "WSRELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16(lookup, "WSRELAY_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string(lookup, "WSRELAY_WS_PATH") {
        settings.server.ws_path = v;
    }
    if let Some(v) = read_env_string(lookup, "WSRELAY_PUBLIC_DIR") {
        settings.server.public_dir = v;
    }
    if let Some(v) = read_env_usize(lookup, "WSRELAY_MAX_CONNECTIONS", 0, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read_env_bool(lookup, "WSRELAY_METRICS_ENABLED") {
        settings.server.metrics_enabled = v;
    }
    if let Some(v) = read_env_bool(lookup, "WSRELAY_TRUST_FORWARDED_FOR") {
        settings.server.trust_forwarded_for = v;
    }

    // ── Upstream ────────────────────────────────────────────────────
    if let Some(v) = read_env_string(lookup, "WSRELAY_UPSTREAM_URL") {
        settings.upstream.url = v;
    }
    if let Some(v) = read_env_string(lookup, "WSRELAY_ORIGIN") {
        settings.upstream.origin = HeaderPolicy::Fixed { value: v };
    }
    if let Some(v) = read_env_string(lookup, "WSRELAY_USER_AGENT") {
        settings.upstream.user_agent = HeaderPolicy::Fixed { value: v };
    }
    if let Some(v) = read_env_string(lookup, "WSRELAY_HOST_OVERRIDE") {
        settings.upstream.host_override = Some(v);
    }
    if let Some(v) = read_env_u64(lookup, "WSRELAY_EARLY_CLOSE_RETRY_MS", 1, 600_000) {
        settings.upstream.early_close_retry_ms = Some(v);
    }

    // ── Limits and timeouts ─────────────────────────────────────────
    if let Some(v) = read_env_u64(lookup, "WSRELAY_QUEUE_MAX_BYTES", 1, u64::MAX) {
        settings.limits.queue_max_bytes = v;
    }
    if let Some(v) = read_env_u64(lookup, "WSRELAY_PAUSE_BYTES", 1, u64::MAX) {
        settings.limits.pause_bytes = v;
    }
    if let Some(v) = read_env_u64(lookup, "WSRELAY_RESUME_BYTES", 0, u64::MAX) {
        settings.limits.resume_bytes = v;
    }
    if let Some(v) = read_env_u64(lookup, "WSRELAY_KILL_BYTES", 1, u64::MAX) {
        settings.limits.kill_bytes = v;
    }
    if let Some(v) = read_env_u64(lookup, "WSRELAY_OPEN_TIMEOUT_MS", 100, 600_000) {
        settings.timeouts.open_timeout_ms = v;
    }
    if let Some(v) = read_env_u64(lookup, "WSRELAY_IDLE_TIMEOUT_MS", 1_000, 86_400_000) {
        settings.timeouts.idle_timeout_ms = v;
    }
    if let Some(v) = read_env_u64(lookup, "WSRELAY_PING_INTERVAL_MS", 1_000, 600_000) {
        settings.timeouts.ping_interval_ms = v;
    }
    if let Some(v) = read_env_u64(lookup, "WSRELAY_PONG_TIMEOUT_MS", 1_000, 600_000) {
        settings.timeouts.pong_timeout_ms = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string(lookup, "WSRELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_string(lookup, "WSRELAY_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "WSRELAY_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a log format name.
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(lookup: &EnvLookup, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.is_empty())
}

fn read_env_bool(lookup: &EnvLookup, name: &str) -> Option<bool> {
    let val = lookup(name)?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(lookup: &EnvLookup, name: &str, min: u16, max: u16) -> Option<u16> {
    let val = lookup(name)?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(lookup: &EnvLookup, name: &str, min: u64, max: u64) -> Option<u64> {
    let val = lookup(name)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(lookup: &EnvLookup, name: &str, min: usize, max: usize) -> Option<usize> {
    let val = lookup(name)?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn deep_merge_nested_objects() {
        let target = json!({"server": {"port": 8080, "host": "0.0.0.0"}});
        let source = json!({"server": {"port": 9000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9000);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn deep_merge_skips_null() {
        let target = json!({"a": 1});
        let source = json!({"a": null});
        assert_eq!(deep_merge(target, source)["a"], 1);
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let target = json!({"a": [1, 2, 3]});
        let source = json!({"a": [4]});
        assert_eq!(deep_merge(target, source)["a"], json!([4]));
    }

    #[test]
    fn deep_merge_replaces_tagged_policy() {
        let target = json!({"origin": {"mode": "mirror"}});
        let source = json!({"origin": {"mode": "fixed", "value": "https://x"}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["origin"]["mode"], "fixed");
        assert_eq!(merged["origin"]["value"], "https://x");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.limits.governor_interval_ms, 25);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"upstream": {{"url": "wss://game.example/ws", "origin": {{"mode": "fixed", "value": "https://game.example"}}}}, "limits": {{"queueMaxBytes": 1048576}}}}"#
        )
        .unwrap();
        let settings = load_settings_from_path(file.path()).unwrap();
        assert_eq!(settings.upstream.url, "wss://game.example/ws");
        assert_eq!(
            settings.upstream.origin,
            HeaderPolicy::Fixed { value: "https://game.example".into() }
        );
        assert_eq!(settings.limits.queue_max_bytes, 1_048_576);
        assert_eq!(settings.limits.pause_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(load_settings_from_path(file.path()).is_err());
    }

    #[test]
    fn invalid_merged_settings_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"limits": {{"resumeBytes": 99999999999}}}}"#).unwrap();
        assert!(load_settings_from_path(file.path()).is_err());
    }

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn buffer_threshold_overrides() {
        let mut settings = RelaySettings::default();
        let lookup = lookup_from(&[
            ("WSRELAY_PAUSE_BYTES", "2048"),
            ("WSRELAY_RESUME_BYTES", "512"),
            ("WSRELAY_KILL_BYTES", "8192"),
            ("WSRELAY_QUEUE_MAX_BYTES", "4096"),
        ]);
        apply_overrides(&mut settings, &lookup);
        assert_eq!(settings.limits.pause_bytes, 2048);
        assert_eq!(settings.limits.resume_bytes, 512);
        assert_eq!(settings.limits.kill_bytes, 8192);
        assert_eq!(settings.limits.queue_max_bytes, 4096);
    }

    #[test]
    fn invalid_override_keeps_previous_value() {
        let mut settings = RelaySettings::default();
        let lookup = lookup_from(&[("WSRELAY_KILL_BYTES", "lots"), ("WSRELAY_PORT", "0")]);
        apply_overrides(&mut settings, &lookup);
        assert_eq!(settings.limits.kill_bytes, RelaySettings::default().limits.kill_bytes);
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "on"] {
            assert_eq!(parse_bool(v), Some(true));
        }
        for v in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(v), Some(false));
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("500", 1000, 2000), None);
        assert_eq!(parse_usize_range("12", 0, 100), Some(12));
        assert_eq!(parse_usize_range("abc", 0, 100), None);
    }

    #[test]
    fn parse_log_formats() {
        assert_eq!(parse_log_format("JSON"), Some(LogFormat::Json));
        assert_eq!(parse_log_format("text"), Some(LogFormat::Pretty));
        assert_eq!(parse_log_format("xml"), None);
    }
}
