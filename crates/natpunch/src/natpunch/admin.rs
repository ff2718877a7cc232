use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::natpunch::{
    config::Role,
    telemetry,
    tunnel::{client::Status, table::SessionTable},
};

#[derive(Clone)]
pub struct AdminState {
    pub role: Role,
    pub prom: telemetry::SharedPrometheusHandle,
    /// Server role only.
    pub sessions: Option<Arc<SessionTable>>,
    /// Client role only.
    pub status: Option<watch::Receiver<Status>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .route("/status", get(status))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    role: &'static str,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            role: st.role.as_str(),
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, st.prom.render())
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    match &st.sessions {
        Some(t) => (StatusCode::OK, Json(t.snapshot().await)).into_response(),
        None => (StatusCode::NOT_FOUND, "sessions are tracked by the server role").into_response(),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: Status,
}

async fn status(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    match &st.status {
        Some(rx) => {
            let status = *rx.borrow();
            (StatusCode::OK, Json(StatusResponse { status })).into_response()
        }
        None => (StatusCode::NOT_FOUND, "status is reported by the client role").into_response(),
    }
}
