use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// rt-gateway — real-time FaaS admission and invocation control
#[derive(Parser)]
#[command(name = "rt-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gateway.json")]
    config: String,

    /// Override listen address (e.g., 0.0.0.0:8080)
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the orchestrator-facing upstream URL
    #[arg(short, long)]
    upstream: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("rt-gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!(config = cli.config, "loading configuration");
        rt_gateway::config::GatewayConfig::from_file(&cli.config).await?
    } else {
        tracing::warn!("config file not found, using defaults");
        rt_gateway::config::GatewayConfig::default()
    };
    config.apply_env();

    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(upstream) = cli.upstream {
        config.upstream_url = upstream;
    }
    config.validate()?;

    let query = Arc::new(rt_gateway::scaling::HttpServiceQuery::new(
        config.upstream_url.clone(),
    ));
    let state = Arc::new(rt_gateway::AppState::new(config, query));

    let (addr, handle) = rt_gateway::server::serve(state).await?;
    tracing::info!(address = %addr, "gateway ready — press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.abort();

    Ok(())
}
