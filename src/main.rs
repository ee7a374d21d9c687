mod app;
mod cli;
mod config;
mod proxy;
mod server;

use app::SidecarApp;
use clap::Parser;
use cli::{Cli, Commands};
use config::AppConfig;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVER_COMMON_NAME: &str = "dumbserver";
const PROXY_COMMON_NAME: &str = "outproxy";

#[tokio::main]
async fn main() {
    // Install default crypto provider for rustls before any TLS operations
    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(e) = run().await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_default();
    init_tracing("info", &format);

    let cli = Cli::parse();

    info!("Loading configuration...");
    let config = AppConfig::load().map_err(|e| {
        error!("Failed to load config: {}", e);
        e
    })?;

    match cli.command {
        Commands::Serve { common_name } => {
            let common_name = common_name.unwrap_or_else(|| config.common_name(SERVER_COMMON_NAME));
            serve(config, common_name).await?;
        }
        Commands::Proxy { common_name } => {
            let common_name = common_name.unwrap_or_else(|| config.common_name(PROXY_COMMON_NAME));
            run_proxy(config, common_name).await?;
        }
        Commands::Check { common_name } => {
            let common_name = common_name.unwrap_or_else(|| config.common_name(SERVER_COMMON_NAME));
            check(config, common_name).await?;
        }
    }

    Ok(())
}

async fn serve(config: AppConfig, common_name: String) -> anyhow::Result<()> {
    let mut app = SidecarApp::new(&config, common_name)?;
    app.start().await?;

    let result = server::run(config.server.listen_port, app.hooks(), shutdown_signal()).await;

    app.shutdown().await;
    result
}

async fn run_proxy(config: AppConfig, common_name: String) -> anyhow::Result<()> {
    let target = config.proxy_target()?;

    let mut app = SidecarApp::new(&config, common_name)?;
    app.start().await?;

    let client = proxy::build_client(app.hooks(), Duration::from_secs(config.vault.timeout_secs))?;
    info!(
        "Forwarding to {}://{} as {}",
        target.scheme,
        target.host,
        app.common_name()
    );

    let result = proxy::run(
        config.proxy.listen_port,
        client,
        target,
        config.proxy.context_root.clone(),
        shutdown_signal(),
    )
    .await;

    app.shutdown().await;
    result
}

async fn check(config: AppConfig, common_name: String) -> anyhow::Result<()> {
    let app = SidecarApp::new(&config, common_name)?;
    let report = app.check().await?;

    println!("\nAuthority Check");
    println!("─────────────────────────────────────");
    println!("  Vault:       {}", config.vault.addr);
    println!("  Identity:    {}", app.common_name());
    println!("  Serial:      {}", report.serial);
    println!("  Expires:     {}", report.not_after);
    println!("  Revoked:     {}", report.revoked_at);
    println!("  Tidy:        ok");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}
