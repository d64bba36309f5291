use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use tower_http::trace::TraceLayer;

use mesh_janitor::handlers::add_retention_routes;
use mesh_janitor::retention::RetentionSweeper;

use crate::live::{ws_handler, LiveHub};

async fn index() -> &'static str {
    "mesh ingest"
}

/// Ready once the broker subscription is live.
async fn readiness(State(connected): State<Arc<AtomicBool>>) -> (StatusCode, &'static str) {
    if connected.load(Ordering::Relaxed) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "broker not connected")
    }
}

pub fn router(
    live: LiveHub,
    broker_connected: Arc<AtomicBool>,
    sweeper: Option<Arc<RetentionSweeper>>,
) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(index))
        .route("/_readiness", get(readiness).with_state(broker_connected))
        .route("/ws", get(ws_handler).with_state(live));

    let router = match sweeper {
        Some(sweeper) => add_retention_routes(router, sweeper),
        None => router,
    };

    router.layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Method, Request},
    };
    use chrono::Utc;
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use super::*;
    use mesh_common::store::MemoryStore;
    use mesh_common::time::ManualClock;
    use mesh_janitor::retention::RetentionPolicy;

    async fn get_status(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn index() {
        let app = router(LiveHub::new(1), Arc::new(AtomicBool::new(false)), None);

        assert_eq!(
            get_status(app, "/").await,
            (StatusCode::OK, "mesh ingest".to_owned())
        );
    }

    #[tokio::test]
    async fn readiness_follows_broker() {
        let connected = Arc::new(AtomicBool::new(false));
        let app = router(LiveHub::new(1), connected.clone(), None);

        let (status, _) = get_status(app.clone(), "/_readiness").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = get_status(app.clone(), "/_liveness").await;
        assert_eq!(status, StatusCode::OK);

        connected.store(true, Ordering::Relaxed);
        let (status, _) = get_status(app, "/_readiness").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn retention_routes_are_optional() {
        let request = || {
            Request::builder()
                .method(Method::POST)
                .uri("/retention/run?dry_run=true")
                .body(Body::empty())
                .unwrap()
        };

        let without = router(LiveHub::new(1), Arc::new(AtomicBool::new(true)), None);
        let response = without.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::new(MemoryStore::new()),
            RetentionPolicy::default(),
            Arc::new(ManualClock::new(Utc::now())),
        ));
        let with = router(LiveHub::new(1), Arc::new(AtomicBool::new(true)), Some(sweeper));
        let response = with.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
