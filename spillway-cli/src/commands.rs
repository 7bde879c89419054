//! CLI command implementations

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use spillway_core::capture::{SessionEvent, SessionManager, StaticStreamFinder};
use spillway_core::config::SpillwayConfig;
use spillway_core::tvheadend::M3uRegistrar;
use tracing::{error, info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Capture all enabled sites and serve the relay API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Capture a single site without the web surface
    Capture {
        /// Site id from the configuration file
        site: String,
    },
    /// List the qualities the capture tool can see for a URL
    Probe {
        /// Source page or stream URL
        url: String,
        /// HTTP Referer header to send
        #[arg(long)]
        referer: Option<String>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Serve { host, port } => serve(config_path, &host, port).await,
        Commands::Capture { site } => capture_one(config_path, &site).await,
        Commands::Probe { url, referer } => probe(config_path, &url, referer).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<SpillwayConfig> {
    if path.exists() {
        let config = SpillwayConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    } else {
        warn!("Config file {} not found; using defaults", path.display());
        Ok(SpillwayConfig::default())
    }
}

async fn build_manager(config: SpillwayConfig) -> Arc<SessionManager> {
    let registrar = Arc::new(M3uRegistrar::new(config.tvheadend.clone()));

    if registrar.check_connectivity().await {
        info!("TVHeadend reachable at {}:{}", config.tvheadend.host, config.tvheadend.port);
    } else {
        warn!("TVHeadend not reachable; channel files will still be written");
    }
    let removed = registrar.cleanup_stale(Duration::from_secs(24 * 3600)).await;
    if removed > 0 {
        info!("Removed {removed} stale channel file(s) from a previous run");
    }

    Arc::new(SessionManager::new(
        config,
        Arc::new(StaticStreamFinder),
        registrar,
    ))
}

/// Drains session events into the operator log.
fn spawn_event_logger(manager: &SessionManager) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event log fell behind; dropped {n} event(s)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Started { site_id } => info!("[{site_id}] session started"),
        SessionEvent::StreamFound { site_id, source } => {
            info!("[{site_id}] stream found ({})", source.kind());
        }
        SessionEvent::Restarted { site_id, restart_count } => {
            warn!("[{site_id}] restarted (attempt {restart_count})");
        }
        SessionEvent::SessionError { site_id, reason } => error!("[{site_id}] {reason}"),
        SessionEvent::Ended { site_id } => info!("[{site_id}] session ended"),
        SessionEvent::Suspended { site_id, restarts_in_window } => {
            error!(
                "[{site_id}] SUSPENDED after {restarts_in_window} restarts; manual restart required"
            );
        }
        SessionEvent::StatusUpdate { site_id, status, uptime, restart_count } => {
            info!(
                "[{site_id}] {status}, up {}s, {restart_count} restart(s)",
                uptime.as_secs()
            );
        }
    }
}

async fn serve(config_path: &Path, host: &str, port: u16) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let manager = build_manager(config).await;
    spawn_event_logger(&manager);

    for (site_id, result) in manager.start_enabled().await {
        if let Err(e) = result {
            error!("Failed to start capture for {site_id}: {e}");
        }
    }

    spillway_web::run_server(Arc::clone(&manager), host, port)
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

    manager.stop_all().await;
    info!("Shutdown complete");
    Ok(())
}

async fn capture_one(config_path: &Path, site_id: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let manager = build_manager(config).await;
    spawn_event_logger(&manager);

    manager
        .start_site(site_id)
        .await
        .with_context(|| format!("starting capture for {site_id}"))?;

    info!("Capturing {site_id}; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    manager.stop_all().await;
    Ok(())
}

async fn probe(config_path: &Path, url: &str, referer: Option<String>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    let mut args = Vec::new();
    if let Some(referer) = &referer {
        args.push("--http-header".to_string());
        args.push(format!("Referer={referer}"));
    }
    args.push("--json".to_string());
    args.push(url.to_string());

    info!("Probing {url} with {}", config.capture.program);
    let output = tokio::time::timeout(
        Duration::from_secs(30),
        tokio::process::Command::new(&config.capture.program)
            .args(&args)
            .output(),
    )
    .await
    .context("probe timed out after 30s")?
    .with_context(|| format!("running {}", config.capture.program))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let qualities = parse_qualities(&stdout);
    if qualities.is_empty() {
        anyhow::bail!("no streams found for {url}");
    }

    println!("Available qualities for {url}:");
    for quality in qualities {
        println!("  {quality}");
    }
    Ok(())
}

/// Pulls the stream-quality names out of the capture tool's JSON output.
fn parse_qualities(stdout: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout) else {
        return Vec::new();
    };
    let Some(streams) = value.get("streams").and_then(|s| s.as_object()) else {
        return Vec::new();
    };
    streams.keys().cloned().collect()
}
