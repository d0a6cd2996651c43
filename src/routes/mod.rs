pub mod health;
pub mod pipeline;
pub mod status;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(pipeline::router())
                .merge(status::router())
                .merge(crate::openapi::router()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::OnceLock;
    use tower::ServiceExt;

    static STATE: OnceLock<AppState> = OnceLock::new();

    fn state() -> AppState {
        STATE.get_or_init(crate::test_support::test_state).clone()
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_rejects_unknown_job_kind() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/pipeline/trigger")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"job_kind":"defragment"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trigger_rejects_half_open_range() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/pipeline/trigger")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"job_kind":"realtime_sync","start_ts":"2024-01-01T00:00:00Z"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trigger_rejects_inverted_range() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/pipeline/trigger")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"job_kind":"realtime_sync","start_ts":"2024-01-02T00:00:00Z","end_ts":"2024-01-01T00:00:00Z"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
