//! Embedded HTTP adapter.
//!
//! Serves the two endpoints the outside world needs: ACME HTTP-01 challenge
//! responses under the well-known path (fetched by the CA through
//! marathon-lb) and a liveness check.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::challenges::ChallengeMap;

/// Build the router (public for testing).
pub fn router(challenges: ChallengeMap) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(challenge_handler))
        .route("/health", get(health_handler))
        .with_state(challenges)
}

/// Serve on an already-bound listener until cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    challenges: ChallengeMap,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP adapter listening");

    axum::serve(listener, router(challenges))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await?;

    tracing::debug!("HTTP adapter stopped");
    Ok(())
}

async fn challenge_handler(
    State(challenges): State<ChallengeMap>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match challenges.respond(&token) {
        Some(body) => {
            tracing::info!(token = %token, "Served ACME challenge response");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                body,
            )
                .into_response()
        }
        None => {
            tracing::debug!(token = %token, "Unknown ACME challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "OK"
}
