//! s3proxy -- multi-backend S3-compatible replicating proxy.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

/// Command-line arguments for the s3proxy server.
#[derive(Parser, Debug)]
#[command(name = "s3proxy", version, about = "Multi-backend S3-compatible replicating proxy")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "s3proxy.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("loading configuration from {}", cli.config);
    let config = s3proxy::config::load_config(&cli.config)?;

    let bind_addr = cli.bind.unwrap_or_else(|| config.server.listen_address.clone());

    s3proxy::metrics::init_metrics();
    s3proxy::metrics::describe_metrics();
    info!("prometheus metrics initialized");

    let state = Arc::new(s3proxy::AppState::build(&config));
    info!(backends = config.backend.backends.len(), "backend registry built");

    state.start_background_tasks(&config);
    info!("health supervisor and multipart sweeper started");

    let app = s3proxy::server::app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("s3proxy listening on {}", bind_addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    state.stop_background_tasks().await;
    info!("s3proxy shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        },
    }
}
