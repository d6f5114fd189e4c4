//! HTTP surface: one Backend Interfaces JSON document per POST.
//!
//! Protocol-level failures are answered with a 200 and a `Result` in the
//! body; only an unreadable/malformed body becomes a 400.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tracing::{info, warn};

use crate::joinserver::{DeviceStore, JoinServer};

pub fn router<S: DeviceStore + 'static>(server: Arc<JoinServer<S>>) -> Router {
    Router::new().route("/", post(handle::<S>)).with_state(server)
}

async fn handle<S: DeviceStore + 'static>(
    State(server): State<Arc<JoinServer<S>>>,
    body: Bytes,
) -> Response {
    match server.handle_request(&body) {
        Ok(answer) => Json(answer).into_response(),
        Err(e) => {
            warn!("rejected request: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

/// Bind and serve until the process is stopped.
pub async fn serve<S: DeviceStore + 'static>(
    bind: &str,
    server: Arc<JoinServer<S>>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Join server listening on {}", bind);
    axum::serve(listener, router(server)).await?;
    Ok(())
}
