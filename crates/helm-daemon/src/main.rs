//! # helmd
//!
//! Runs the helm broker: loads settings, starts the WebSocket server, logs
//! agent connections and their events, and shuts down on Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use helm_server::config::ServerConfig;
use helm_server::server::HelmServer;
use helm_server::{AgentHandle, Broker};
use helm_settings::HelmSettings;
use tracing::{info, warn};

/// Placeholder substituted by agents with their own id.
const ID_PLACEHOLDER: &str = "{id}";

/// helm connection broker.
#[derive(Parser, Debug)]
#[command(name = "helmd", about = "helm connection broker")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.helm/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level filter, e.g. `info` or `helm_server=debug` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<HelmSettings> {
        let path = self.settings.clone().unwrap_or_else(helm_settings::settings_path);
        let mut settings = helm_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        self.apply(&mut settings);
        Ok(settings)
    }

    fn apply(&self, settings: &mut HelmSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

/// Log every event a newly connected agent reports.
fn watch_agent(handle: &AgentHandle) {
    let id = handle.id().clone();
    info!(connection_id = %id, "agent connected");

    let agent = id.clone();
    handle.on_script_message(move |message| info!(connection_id = %agent, text = message, "script message"));
    let agent = id.clone();
    handle.on_script_end(move || info!(connection_id = %agent, "script ended"));
    let agent = id.clone();
    handle.on_ban(move || warn!(connection_id = %agent, "agent reported a ban"));
    let agent = id.clone();
    handle.on_disconnect(move || info!(connection_id = %agent, "agent went dormant"));
    handle.on_reconnect(move || info!(connection_id = %id, "agent resumed"));
}

fn build_server(settings: &HelmSettings) -> HelmServer {
    let config = ServerConfig::from(settings);
    let broker = Broker::builder()
        .config(config.broker.clone())
        .on_connect(|handle| watch_agent(&handle))
        .build();
    HelmServer::new(config, broker)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;
    helm_core::logging::init_subscriber(&settings.logging.level);

    let server = build_server(&settings);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;

    info!(%addr, local = %server.local_connection_url(ID_PLACEHOLDER), "helm broker listening");
    match server.remote_connection_url(ID_PLACEHOLDER).await {
        Ok(url) => info!(remote = %url, "remote agents connect here"),
        Err(error) => warn!(%error, "remote connection address unavailable"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    server.broker().shutdown();
    let _ = handle.await;
    info!("Shutdown complete");
    Ok(())
}
