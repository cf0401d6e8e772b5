use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_router::config::NormalizedConfig;
use mcp_router::health::start_health_checker;
use mcp_router::reload;
use mcp_router::server;

#[derive(Parser)]
#[command(name = "mcp-router")]
#[command(about = "MCP request router: one endpoint fronting a fleet of MCP tool servers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the router config file
    #[arg(long, short, env = "MCP_ROUTER_CONFIG", default_value = "router.json")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a single session over stdio
    Serve {
        /// Token binding the stdio session's principal (anonymous if omitted)
        #[arg(long, env = "MCP_ROUTER_TOKEN")]
        token: Option<String>,
    },
    /// Serve the sessioned HTTP front-end
    ServeHttp,
    /// Parse and validate the config, then exit
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate => {
            let cfg = NormalizedConfig::load(&cli.config)?;
            println!(
                "ok: {} upstream(s), {} project(s), {} token(s)",
                cfg.upstreams.len(),
                cfg.projects.len(),
                cfg.auth.tokens.len()
            );
            Ok(())
        }
        Commands::Serve { token } => {
            let deps = server::build_deps(NormalizedConfig::load(&cli.config)?);
            let ct = CancellationToken::new();
            reload::spawn_watcher(
                cli.config.clone(),
                deps.config.clone(),
                deps.manager.clone(),
                ct.clone(),
            )?;
            let health = start_health_checker(
                deps.config.clone(),
                deps.manager.clone(),
                deps.breaker.clone(),
                deps.health.clone(),
            );
            let result = server::stdio::serve(deps, token, health).await;
            ct.cancel();
            result
        }
        Commands::ServeHttp => {
            let deps = server::build_deps(NormalizedConfig::load(&cli.config)?);
            let ct = CancellationToken::new();
            reload::spawn_watcher(
                cli.config.clone(),
                deps.config.clone(),
                deps.manager.clone(),
                ct.clone(),
            )?;
            let health = start_health_checker(
                deps.config.clone(),
                deps.manager.clone(),
                deps.breaker.clone(),
                deps.health.clone(),
            );

            let shutdown = ct.clone();
            tokio::spawn(async move {
                wait_for_signal().await;
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            });

            server::http::serve(deps, health, ct).await
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
