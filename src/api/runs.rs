use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error_response;
use crate::{
    app::AppState,
    config::ConfigOverrides,
    pipeline::{RunRequest, RunSummary},
    source::SourceQuery,
};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TriggerRunRequest {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    max_items: Option<usize>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    classify_only: bool,
}

#[derive(Debug, Serialize)]
struct TriggerRunResponse {
    status: &'static str,
    strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<String>,
    classify_only: bool,
}

/// POST /v1/runs
/// 実行をバックグラウンドで開始する。実行中なら 409。
pub(crate) async fn trigger(
    State(state): State<AppState>,
    Json(payload): Json<TriggerRunRequest>,
) -> Response {
    let overrides = ConfigOverrides {
        query: payload.query,
        max_items: payload.max_items,
        strategy: payload.strategy,
    };
    let config = match state.config().with_overrides(&overrides) {
        Ok(config) => config,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, format!("{error:#}")),
    };

    let request = if payload.classify_only {
        RunRequest::classify_only(config.strategy())
    } else {
        RunRequest::ingest(
            SourceQuery::new(config.query(), config.max_items().get()),
            config.strategy(),
        )
    };

    let registry = state.registry();
    let Some(permit) = registry.try_begin_run() else {
        return error_response(StatusCode::CONFLICT, "a run is already in progress");
    };

    let response = TriggerRunResponse {
        status: "accepted",
        strategy: request.strategy.clone(),
        query: request.source_query.as_ref().map(|query| query.query.clone()),
        classify_only: payload.classify_only,
    };
    let cancel = state.shutdown_token();
    tokio::spawn(async move {
        let summary = registry.execute_with(permit, &request, &cancel).await;
        info!(
            sentiment.run_id = %summary.run_id,
            state = ?summary.state,
            "triggered run finished"
        );
    });

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

/// GET /v1/runs
/// 直近の実行集計を新しい順に返す
pub(crate) async fn recent(State(state): State<AppState>) -> Json<Vec<RunSummary>> {
    Json(state.registry().recent_runs())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::app::{AppState, build_router, tests::test_registry};

    fn post_json(body: &str) -> Request<Body> {
        Request::post("/v1/runs")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn recent_runs(router: axum::Router) -> Value {
        let response = router
            .oneshot(Request::get("/v1/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn trigger_accepts_and_records_summary() {
        let (registry, _file) = test_registry(&[
            r#"{"id": "1", "text": "I love this!"}"#,
            r#"{"id": "2", "text": "terrible, worst ever"}"#,
        ])
        .await;
        let router = build_router(AppState::new(registry, CancellationToken::new()));

        let response = router
            .clone()
            .oneshot(post_json(r#"{"strategy": "lexicon"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let mut runs = Value::Null;
        for _ in 0..50 {
            runs = recent_runs(router.clone()).await;
            if runs.as_array().is_some_and(|runs| !runs.is_empty()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(runs[0]["inserted"], 2);
        assert_eq!(runs[0]["state"]["state"], "done");
    }

    #[tokio::test]
    async fn concurrent_triggers_accept_exactly_one() {
        let (registry, _file) = test_registry(&[
            r#"{"id": "1", "text": "good morning"}"#,
            r#"{"id": "2", "text": "bad traffic today"}"#,
        ])
        .await;
        let router = build_router(AppState::new(registry, CancellationToken::new()));

        let (first, second) = tokio::join!(
            router.clone().oneshot(post_json("{}")),
            router.clone().oneshot(post_json("{}")),
        );
        let mut statuses = [first.unwrap().status(), second.unwrap().status()];
        statuses.sort();
        assert_eq!(statuses, [StatusCode::ACCEPTED, StatusCode::CONFLICT]);

        let mut runs = Value::Null;
        for _ in 0..50 {
            runs = recent_runs(router.clone()).await;
            if runs.as_array().is_some_and(|runs| !runs.is_empty()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(runs.as_array().map(Vec::len), Some(1));
        assert_eq!(runs[0]["state"]["state"], "done");

        let response = router.oneshot(post_json("{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn trigger_rejects_invalid_overrides() {
        let (registry, _file) = test_registry(&[]).await;
        let router = build_router(AppState::new(registry, CancellationToken::new()));

        let response = router
            .oneshot(post_json(r#"{"strategy": "transformer"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
