use std::sync::Arc;

use axum::{routing, Router};

use super::retention::add_retention_routes;
use crate::retention::RetentionSweeper;

pub fn app(sweeper: Arc<RetentionSweeper>) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index));

    add_retention_routes(router, sweeper)
}

pub async fn index() -> &'static str {
    "mesh janitor"
}
