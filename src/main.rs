use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

use vidgrab::commands::build_router;
use vidgrab::utils::logging::init_tracing;
use vidgrab::{AppConfig, AppState, NAME, VERSION};

/// `--config <path>` is the only flag
fn config_arg() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args.next().context("--config needs a file path")?;
                path = Some(PathBuf::from(value));
            }
            other => anyhow::bail!("Unknown argument: {other}\nUsage: {NAME} [--config <file>]"),
        }
    }
    Ok(path)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_arg()?;
    let config = AppConfig::load(config_path.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging.level);

    info!("🚀 Starting {} v{}", NAME, VERSION);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let job_ttl = config.registry.job_ttl();
    let sweep_interval = config.registry.sweep_interval();

    let state = AppState::new(config).context("initializing application state")?;
    let orchestrator = state.orchestrator.clone();
    let sweeper = orchestrator.spawn_sweeper(job_ttl, sweep_interval);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("🌐 API server listening on http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    orchestrator.shutdown();
    if let Err(e) = sweeper.await {
        warn!("Registry sweeper ended abnormally: {}", e);
    }
    info!("👋 {} stopped", NAME);
    Ok(())
}
