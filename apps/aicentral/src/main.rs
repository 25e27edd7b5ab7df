use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aicentral_core::{GatewayConfig, build_pipelines};
use aicentral_endpoint_core::{LogRecorder, SharedRecorder, UpstreamClient};
use aicentral_endpoints::{UpstreamClientConfig, WreqUpstreamClient};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Cli::parse();

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config file {}", args.config))?;
    let config: GatewayConfig =
        serde_json::from_str(&raw).context("parsing gateway configuration")?;

    let client: Arc<dyn UpstreamClient> = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::default())
            .context("building upstream client")?,
    );
    let recorder: SharedRecorder = Arc::new(LogRecorder);
    let pipelines = build_pipelines(&config, client, recorder);
    for pipeline in &pipelines {
        info!(event = "pipeline_loaded", pipeline = pipeline.name());
    }

    let app = aicentral_router::gateway_router(pipelines);
    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(event = "listening", bind = %bind);

    // Graceful drain: stop admitting on signal, then give in-flight
    // requests up to the drain deadline before exiting anyway.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut deadline_rx = shutdown_rx.clone();
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown({
            let mut rx = shutdown_rx;
            async move {
                let _ = rx.wait_for(|signalled| *signalled).await;
            }
        })
        .into_future();

    tokio::select! {
        result = serve => {
            result.context("server error")?;
            info!(event = "drained");
        }
        _ = async {
            let _ = deadline_rx.wait_for(|signalled| *signalled).await;
            tokio::time::sleep(Duration::from_secs(args.drain_seconds)).await;
        } => {
            warn!(event = "drain_deadline_reached");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
