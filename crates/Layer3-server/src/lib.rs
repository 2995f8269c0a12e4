//! # labterm-server
//!
//! Transport for the session engine:
//! - `GET /ws`: one [`SessionChannel`](labterm_session::SessionChannel) per connection
//! - `GET /health`, `GET /api/sessions`, `POST /api/exec`, `GET /api/jobs/{id}`
//!
//! 소유자(owner) 식별은 상위 프록시가 넣어주는 헤더(`x-owner-id`)만 사용한다.

pub mod api;
pub mod ws;

pub use api::{create_router, ApiError, AppState};

use labterm_session::LabEngine;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Bind `engine.config().server.bind` and serve until `shutdown` resolves.
/// The engine itself is shut down afterwards.
pub async fn serve<F>(engine: Arc<LabEngine>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind = engine.config().server.bind.clone();
    let listener = TcpListener::bind(&bind).await?;
    info!("labterm listening on {}", listener.local_addr()?);

    let reaper = engine.spawn_reaper();
    let app = create_router(AppState::new(engine.clone()));

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    info!("Shutdown signal received, closing sessions...");
    engine.shutdown().await;
    let _ = reaper.await;
    info!("Shutdown complete");
    result
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
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
}
