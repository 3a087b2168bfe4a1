use bytes::Bytes;
use clap::Parser;
use http::Method;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use rt_gateway::workflow::{handle_request, WatchdogConfig};

/// rt-watchdog — workflow executor for declared function task chains
#[derive(Parser)]
#[command(name = "rt-watchdog", version, about)]
struct Cli {
    /// Path to the watchdog configuration file (workflow + process map)
    #[arg(short, long, default_value = "watchdog.json")]
    config: String,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8082")]
    listen: String,

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

    tracing::info!("rt-watchdog v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(WatchdogConfig::from_file(&cli.config).await?);
    tracing::info!(
        workflow = %config.name,
        states = config.workflow.states.len(),
        "workflow loaded"
    );

    let listener = TcpListener::bind(&cli.listen).await?;
    tracing::info!(address = %listener.local_addr()?, "watchdog listening");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "failed to accept connection");
                continue;
            }
        };
        let config = config.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let _ = http1::Builder::new()
                .serve_connection(
                    io,
                    service_fn(move |req| serve_workflow(req, config.clone())),
                )
                .await;
        });
    }
}

/// Run the workflow for any mutating or read method, 405 otherwise
async fn serve_workflow(
    req: hyper::Request<Incoming>,
    config: Arc<WatchdogConfig>,
) -> Result<hyper::Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();

    let allowed = matches!(
        parts.method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE | Method::GET
    );
    if !allowed {
        return Ok(hyper::Response::builder()
            .status(http::StatusCode::METHOD_NOT_ALLOWED)
            .body(Full::new(Bytes::new()))
            .unwrap());
    }

    let input = match http_body_util::BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let (status, output) = handle_request(&config, input).await;
    Ok(hyper::Response::builder()
        .status(status)
        .body(Full::new(output))
        .unwrap())
}
