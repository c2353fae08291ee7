mod app;
mod attach;
mod http;
mod persist;

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use anima_core::config::AnimaConfig;

#[derive(Parser, Debug)]
#[command(name = "anima-gateway", about = "Anima conversational memory gateway")]
struct Args {
    /// Path to anima.toml (default: ~/.anima/anima.toml)
    #[arg(long)]
    config: Option<String>,

    /// Override the bind address from config
    #[arg(long)]
    bind: Option<String>,

    /// Override the port from config
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = AnimaConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    let addr = format!("{}:{}", config.gateway.bind, config.gateway.port);
    let state = Arc::new(app::AppState::from_config(config)?);

    let router = http::router(state);

    info!(%addr, "anima gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
