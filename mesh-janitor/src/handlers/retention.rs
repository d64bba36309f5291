use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use serde::Deserialize;
use tracing::{error, info};

use crate::retention::RetentionSweeper;

#[derive(Debug, Default, Deserialize)]
pub struct RunParams {
    #[serde(default)]
    pub dry_run: bool,
}

/// Mount `POST /retention/run` on a router.
pub fn add_retention_routes(router: Router, sweeper: Arc<RetentionSweeper>) -> Router {
    router.route("/retention/run", routing::post(run).with_state(sweeper))
}

/// Run a retention pass now, waiting for a scheduled one to finish first if it is running.
pub async fn run(
    State(sweeper): State<Arc<RetentionSweeper>>,
    Query(params): Query<RunParams>,
) -> Response {
    info!(dry_run = params.dry_run, "manual retention run requested");

    match sweeper.run(params.dry_run).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!("manual retention run failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
