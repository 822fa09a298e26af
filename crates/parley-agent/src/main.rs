//! # parley-agent
//!
//! Parley broker binary: loads settings, wires the completion provider,
//! plugin registries and state store into a gateway, and serves it until
//! ctrl-c.

#![deny(unsafe_code)]

mod builtins;
mod providers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::logging::{init_json_subscriber, init_subscriber};
use parley_plugins::PluginKind;
use parley_server::{
    DispatchSettings, Gateway, ParleyServer, PluginHost, RecentActivitySnapshot, ServerConfig,
    SessionManager,
};
use parley_settings::{ParleySettings, load_settings, load_settings_from_path};
use tracing::{info, warn};

use crate::providers::{CommandProvider, FileStateStore};

/// Listener log entries included in each snapshot.
const SNAPSHOT_ACTIVITY_LIMIT: usize = 30;

/// Parley session and plugin-event broker.
#[derive(Parser, Debug)]
#[command(name = "parley-agent", about = "Parley session and plugin-event broker")]
struct Cli {
    /// Settings file (defaults to `~/.parley/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Plugin root directory (overrides settings).
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    /// Disable plugin hot reload.
    #[arg(long)]
    no_watch: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<ParleySettings> {
        let mut settings = match &self.settings {
            Some(path) => load_settings_from_path(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => load_settings().context("failed to load settings")?,
        };
        self.apply(&mut settings);
        Ok(settings)
    }

    fn apply(&self, settings: &mut ParleySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(dir) = &self.plugins_dir {
            settings.plugins.root_dir.clone_from(dir);
        }
        if self.no_watch {
            settings.plugins.watch = false;
        }
    }
}

/// Assemble the gateway described by `settings`.
fn build_gateway(settings: &ParleySettings) -> Arc<Gateway> {
    let provider = Arc::new(CommandProvider::from_settings(&settings.provider));
    let sessions =
        SessionManager::new(provider).with_system_prompt(settings.provider.system_prompt.clone());

    let plugins = PluginHost::load(
        &settings.plugins.root_dir,
        &settings.audit.dir,
        &Arc::new(builtins::catalog()),
        Arc::new(FileStateStore::new(&settings.plugins.state_dir)),
        settings.plugins.handler_timeout(),
    );
    let snapshot = RecentActivitySnapshot::new(
        plugins.audit(PluginKind::Listener).clone(),
        SNAPSHOT_ACTIVITY_LIMIT,
    );

    Arc::new(Gateway::new(
        ServerConfig::from(&settings.server),
        sessions,
        plugins,
        DispatchSettings::from(&settings.plugins),
        Arc::new(snapshot),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    if settings.logging.json {
        init_json_subscriber(&settings.logging.level);
    } else {
        init_subscriber(&settings.logging.level);
    }

    let gateway = build_gateway(&settings);
    let mut server = ParleyServer::new(Arc::clone(&gateway));
    match parley_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => warn!(error = %e, "metrics recorder unavailable, /metrics disabled"),
    }
    let shutdown = Arc::clone(server.shutdown());
    let token = shutdown.token();

    if settings.plugins.watch {
        match gateway
            .plugins()
            .spawn_watchers(settings.plugins.reload_debounce(), &token)
        {
            Ok(handles) => shutdown.track_all(handles),
            Err(e) => warn!(error = %e, "plugin hot reload disabled"),
        }
    }
    shutdown.track_all(gateway.plugins().spawn_eviction(
        settings.plugins.instance_ttl(),
        settings.plugins.eviction_interval(),
        &token,
    ));
    shutdown.track_all(gateway.spawn_background(&token));

    let (addr, handle) = server.listen().await.context("failed to bind server")?;
    let templates: usize = gateway.plugins().stats().iter().map(|s| s.total_templates).sum();
    info!(%addr, templates, provider = %settings.provider.command, "parley listening");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    let clean = shutdown.drain(None).await;
    let _ = handle.await;
    info!(clean, "shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["parley-agent"]);
        assert!(cli.settings.is_none());
        assert!(!cli.no_watch);

        let mut settings = ParleySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 3000);
        assert!(settings.plugins.watch);
    }

    #[test]
    fn cli_overrides_settings() {
        let cli = Cli::parse_from([
            "parley-agent",
            "--host",
            "0.0.0.0",
            "--port",
            "8080",
            "--plugins-dir",
            "/srv/plugins",
            "--no-watch",
        ]);
        let mut settings = ParleySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.plugins.root_dir, PathBuf::from("/srv/plugins"));
        assert!(!settings.plugins.watch);
    }

    #[test]
    fn cli_settings_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, json!({"server": {"port": 4100}}).to_string()).unwrap();

        let cli = Cli::parse_from(["parley-agent", "--settings", path.to_str().unwrap()]);
        assert_eq!(cli.load_settings().unwrap().server.port, 4100);
    }

    #[test]
    fn cli_invalid_settings_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{broken").unwrap();

        let cli = Cli::parse_from(["parley-agent", "--settings", path.to_str().unwrap()]);
        assert!(cli.load_settings().is_err());
    }

    #[tokio::test]
    async fn gateway_loads_plugins_with_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let actions = dir.path().join("plugins").join("actions");
        std::fs::create_dir_all(&actions).unwrap();
        let manifest = json!({
            "config": {"id": "shout", "name": "Shout", "parameterSchema": {"type": "object"}},
            "handler": {"builtin": "echo"}
        });
        std::fs::write(actions.join("shout.json"), manifest.to_string()).unwrap();

        let mut settings = ParleySettings::default();
        settings.plugins.root_dir = dir.path().join("plugins");
        settings.plugins.state_dir = dir.path().join("state");
        settings.audit.dir = dir.path().join("logs");

        let gateway = build_gateway(&settings);
        let actions = gateway.plugins().registry(PluginKind::Action);
        assert_eq!(actions.snapshot().len(), 1);
        assert_eq!(gateway.config().port, 3000);
    }
}
