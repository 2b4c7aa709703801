//! HTTP surface of the relay: the vehicle stream, its status and a health probe.

use log::*;
use service::AppState;
use std::future::Future;
use tokio::net::TcpListener;

mod controller;
mod error;
mod router;
mod sse;

pub use self::error::{Error, Result};

/// Binds the configured interface and port and serves requests until
/// `shutdown` resolves.
pub async fn init_server(
    app_state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let interface = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_owned());
    let server_url = format!("{}:{}", interface, app_state.config.port);

    let listener = TcpListener::bind(&server_url).await?;
    info!("Server starting... listening for connections on http://{server_url}");

    let router = router::define_routes(app_state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
