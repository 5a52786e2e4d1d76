//! Ping and reload endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{any, get};
use axum::Router;
use claw_ipsec::Reconciler;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Builds the control router.
pub fn create_router(reconciler: Arc<Reconciler>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/v1/reload", any(reload))
        .with_state(reconciler)
}

async fn ping() -> &'static str {
    "OK"
}

async fn reload(State(reconciler): State<Arc<Reconciler>>) -> (StatusCode, String) {
    info!("reload requested");
    let result = tokio::task::spawn_blocking(move || reconciler.reload()).await;

    let failure = match result {
        Ok(Ok(report)) => {
            info!(?report, "reload complete");
            return (StatusCode::OK, "Reloaded Configuration\n".to_string());
        }
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    };
    error!(error = %failure, "reload failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Failed to reload configuration: {failure}\n"),
    )
}

/// Serves the control router until the listener fails.
pub async fn serve(addr: SocketAddr, reconciler: Arc<Reconciler>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "control server listening");
    axum::serve(listener, create_router(reconciler)).await
}
