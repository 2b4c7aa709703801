use log::*;
use service::{config::Config, logging::Logger, AppState};
use sse::upstream::HttpUpstream;
use sse::StreamController;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::new();
    Logger::init_logger(&config)?;

    info!("Starting up transit stream relay...");

    if config.upstream_api_key().is_none() {
        error!("UPSTREAM_API_KEY must be set to relay the vehicle stream");
        std::process::exit(1);
    }
    info!("Relaying upstream stream from {}", config.upstream_url());

    let upstream = HttpUpstream::new(&config.http_upstream_config())?;
    let stream_controller = StreamController::new(Arc::new(upstream), config.controller_config());
    let app_state = AppState::new(config, &stream_controller);

    web::init_server(app_state, shutdown_signal(Arc::clone(&stream_controller))).await?;

    stream_controller.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM. Stopping the controller first closes every
/// client stream so the server's graceful shutdown can finish.
async fn shutdown_signal(stream_controller: Arc<StreamController>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
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
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    stream_controller.stop();
}
