//! callout - alert escalation dispatcher.
//!
//! Accepts alerts over HTTP and escalates them through voice call, incident
//! and chat channels until somebody acknowledges them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use callout_config::DispatcherConfig;
use callout_escalation::{ChannelRegistry, EngineSettings, EscalationEngine};
use callout_notify::OnCallDirectory;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod server;

use server::AppState;

/// Alert escalation dispatcher.
#[derive(Parser, Debug)]
#[command(name = "callout")]
#[command(about = "Escalate alerts until someone acknowledges them")]
#[command(version)]
struct Cli {
    /// Address to listen on (overrides CALLOUT_BIND_ADDRESS)
    #[arg(long)]
    bind_address: Option<String>,

    /// Port to listen on (overrides CALLOUT_BIND_PORT)
    #[arg(long)]
    bind_port: Option<u16>,

    /// Seconds between sweeps for expired alerts
    #[arg(long, default_value = "60")]
    sweep_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, env = "CALLOUT_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "callout=debug,callout_escalation=debug,callout_notify=debug,callout_config=debug,info"
    } else {
        "callout=info,callout_escalation=info,callout_notify=info,callout_config=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting callout");

    let mut config = DispatcherConfig::from_env().context("Failed to load configuration")?;
    if let Some(address) = cli.bind_address {
        config.bind_address = address;
    }
    if let Some(port) = cli.bind_port {
        config.bind_port = port;
    }
    debug!(?config, "Effective configuration");

    let client = reqwest::Client::builder()
        .user_agent(concat!("callout/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to construct HTTP client")?;

    let registry =
        ChannelRegistry::from_config(&config, &client).context("Failed to build channel registry")?;
    let engine = EscalationEngine::new(Arc::new(registry), EngineSettings::from_config(&config));
    let sweeper = engine.spawn_sweeper(Duration::from_secs(cli.sweep_interval_secs.max(1)));

    let state = AppState {
        engine,
        directory: config
            .incident
            .as_ref()
            .map(|incident| OnCallDirectory::from_config(incident, client.clone())),
        default_schedule: config
            .incident
            .as_ref()
            .and_then(|incident| incident.schedule.clone()),
    };

    let addr = format!("{}:{}", config.bind_address, config.bind_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "callout listening");

    axum::serve(listener, server::build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    sweeper.abort();
    info!("callout stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
