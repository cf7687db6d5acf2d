//! # wsrelay
//!
//! Relay binary: loads settings, starts logging and metrics, serves until
//! Ctrl-C, then drains open sessions.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use wsrelay_server::RelayServer;
use wsrelay_server::shutdown::DEFAULT_DRAIN_TIMEOUT;
use wsrelay_settings::RelaySettings;
use wsrelay_settings::loader::parse_log_format;

/// Bidirectional WebSocket relay.
#[derive(Parser, Debug)]
#[command(name = "wsrelay", version, about = "Bidirectional WebSocket relay")]
struct Cli {
    /// Settings file (defaults to ./wsrelay.json when present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Upstream WebSocket URL (ws:// or wss://).
    #[arg(long)]
    upstream: Option<String>,

    /// Directory served as static files.
    #[arg(long)]
    public_dir: Option<PathBuf>,

    /// Log output format: json or pretty.
    #[arg(long)]
    log_format: Option<String>,

    /// Log level filter, e.g. `info` or `wsrelay_server=debug`.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load(&self) -> Result<RelaySettings> {
        let mut settings = match &self.config {
            Some(path) => wsrelay_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => wsrelay_settings::load_settings().context("Failed to load settings")?,
        };
        self.apply(&mut settings)?;
        settings.validate().context("Invalid settings after CLI overrides")?;
        Ok(settings)
    }

    fn apply(&self, settings: &mut RelaySettings) -> Result<()> {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = &self.upstream {
            settings.upstream.url.clone_from(url);
        }
        if let Some(dir) = &self.public_dir {
            settings.server.public_dir = dir.display().to_string();
        }
        if let Some(format) = &self.log_format {
            let Some(format) = parse_log_format(format) else {
                bail!("Unknown log format {format:?} (expected json or pretty)");
            };
            settings.logging.format = format;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load()?;

    wsrelay_telemetry::init_telemetry(&settings.logging).context("Failed to initialize logging")?;

    // wss:// upstreams need a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let metrics = if settings.server.metrics_enabled {
        Some(wsrelay_server::metrics::install_recorder().context("Failed to install metrics recorder")?)
    } else {
        None
    };

    let handle = RelayServer::new(settings, metrics)
        .listen()
        .await
        .context("Failed to start relay server")?;
    tracing::info!(addr = %handle.local_addr(), "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!(open = handle.open_connections(), "shutting down");
    handle
        .shutdown(Some(DEFAULT_DRAIN_TIMEOUT))
        .await
        .context("Server exited with an error")?;
    tracing::info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_settings() {
        let cli = Cli::parse_from([
            "wsrelay",
            "--host",
            "127.0.0.1",
            "--port",
            "9100",
            "--upstream",
            "ws://game.internal:7000/",
            "--log-format",
            "pretty",
        ]);
        let mut settings = RelaySettings::default();
        cli.apply(&mut settings).unwrap();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.upstream.url, "ws://game.internal:7000/");
        assert_eq!(settings.logging.format, wsrelay_settings::LogFormat::Pretty);
        settings.validate().unwrap();
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let cli = Cli::parse_from(["wsrelay", "--log-format", "xml"]);
        let mut settings = RelaySettings::default();
        assert!(cli.apply(&mut settings).is_err());
    }

    #[test]
    fn no_flags_leave_settings_untouched() {
        let cli = Cli::parse_from(["wsrelay"]);
        let mut settings = RelaySettings::default();
        cli.apply(&mut settings).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.upstream.url, RelaySettings::default().upstream.url);
    }
}
