//! Health and scheduler status HTTP routes.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::scheduler::{StatusBoard, StatusSnapshot};

pub const STATUS_ROUTE: &str = "/api/ml/status";
pub const HEALTH_ROUTE: &str = "/health";

pub trait StatusSource: Send + Sync + 'static {
    fn snapshot(&self) -> StatusSnapshot;
}

impl StatusSource for StatusBoard {
    fn snapshot(&self) -> StatusSnapshot {
        StatusBoard::snapshot(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub scheduler_running: bool,
}

pub fn status_router(source: Arc<dyn StatusSource>) -> Router {
    Router::new()
        .route(HEALTH_ROUTE, get(get_health))
        .route(STATUS_ROUTE, get(get_status))
        .with_state(StatusAppState { source })
}

#[derive(Clone)]
struct StatusAppState {
    source: Arc<dyn StatusSource>,
}

async fn get_health(State(state): State<StatusAppState>) -> impl IntoResponse {
    let snapshot = state.source.snapshot();
    debug!(
        component = "server",
        event = "http.health.request",
        scheduler_running = snapshot.scheduler_running
    );
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        scheduler_running: snapshot.scheduler_running,
    })
}

async fn get_status(State(state): State<StatusAppState>) -> impl IntoResponse {
    let snapshot = state.source.snapshot();
    info!(
        component = "server",
        event = "http.status.request",
        phase = snapshot.phase.as_str(),
        last_outcome = snapshot.last_outcome.unwrap_or("-")
    );
    Json(snapshot)
}
