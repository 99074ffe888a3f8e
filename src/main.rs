mod captioner;
mod config;
mod device;
mod error;
mod load_image;
mod routes;

use crate::captioner::BlipCaptioner;
use crate::config::Config;
use crate::routes::{router, AppState};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("blip_caption_server=info,tower_http=info")),
        )
        .init();

    let config = Config::parse();
    let addr = config.addr()?;

    // the hub client and weight loading block, nothing is served until they finish
    let loaded = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || BlipCaptioner::load(&config)).await?
    };
    let captioner = match loaded {
        Ok(captioner) => captioner,
        Err(err) => {
            error!("Error loading model: {err:#}");
            return Err(err);
        }
    };

    let state = AppState {
        device: device::describe(captioner.device()).to_string(),
        captioner: Arc::new(captioner),
    };
    let app = router(state, config.body_limit());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down");
}
