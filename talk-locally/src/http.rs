//! HTTP facade for a browser frontend sitting on top of a [`Node`].

use std::{net::SocketAddr, path::Path, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::node::Node;

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub message: String,
}

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/send", post(send_message))
        .route("/messages", get(messages))
        .route("/available-rooms", get(available_rooms))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

/// The API routes with the static frontend in `frontend_dir` behind them.
pub fn app(node: Arc<Node>, frontend_dir: &Path) -> Router {
    router(node).fallback_service(ServeDir::new(frontend_dir))
}

/// Serves the facade on `addr` until the process is interrupted.
pub async fn serve(node: Arc<Node>, addr: SocketAddr, frontend_dir: &Path) -> anyhow::Result<()> {
    if !frontend_dir.is_dir() {
        warn!(dir = %frontend_dir.display(), "frontend directory missing, only the API is served");
    }
    let listener = TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "http frontend listening");
    axum::serve(listener, app(node, frontend_dir))
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(?error, "ctrl-c handler failed");
            }
        })
        .await?;
    Ok(())
}

async fn send_message(
    State(node): State<Arc<Node>>,
    request: Result<Json<SendRequest>, JsonRejection>,
) -> (StatusCode, String) {
    let message = match request {
        Ok(Json(request)) if !request.message.is_empty() => request.message,
        _ => return (StatusCode::BAD_REQUEST, "failed to decode".to_string()),
    };

    match node.send_message(&message).await {
        Ok(()) => (StatusCode::OK, "Message sent successfully".to_string()),
        Err(error) => {
            warn!(%error, "publishing posted message failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to publish: {error}"),
            )
        }
    }
}

async fn messages(State(node): State<Arc<Node>>) -> Json<Vec<String>> {
    Json(node.messages())
}

async fn available_rooms(State(node): State<Arc<Node>>) -> Json<Vec<String>> {
    Json(node.available_rooms())
}
