use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::error_response;
use crate::{app::AppState, pipeline::RunSummary, store::RecordWithResults};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RecordPage {
    total: u64,
    limit: usize,
    offset: usize,
    records: Vec<RecordWithResults>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ClassifyParams {
    #[serde(default)]
    strategy: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClassifyResponse {
    summary: RunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<RecordWithResults>,
}

/// GET /v1/records
/// 取り込み順にレコードと分類結果を返す
pub(crate) async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0);
    let store = state.store();

    let total = match store.record_count().await {
        Ok(total) => total,
        Err(error) => {
            error!(%error, "failed to count records");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to count records");
        }
    };
    match store.list_records(limit, offset).await {
        Ok(records) => Json(RecordPage {
            total,
            limit,
            offset,
            records,
        })
        .into_response(),
        Err(error) => {
            error!(%error, limit, offset, "failed to list records");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to list records")
        }
    }
}

/// GET /v1/records/{key}
pub(crate) async fn get_one(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.store().get_record(&key).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("record {key} not found")),
        Err(error) => {
            error!(sentiment.record_key = %key, %error, "failed to load record");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load record")
        }
    }
}

/// POST /v1/records/{key}/classify?strategy=
/// 状態に関係なく 1 件を再分類する
pub(crate) async fn classify(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<ClassifyParams>,
) -> Response {
    let strategy = params
        .strategy
        .unwrap_or_else(|| state.config().strategy().to_string());
    let pipeline = state.pipeline();

    if let Err(error) = pipeline.strategies().resolve(&strategy) {
        return error_response(StatusCode::BAD_REQUEST, error.to_string());
    }
    match state.store().get_record(&key).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, format!("record {key} not found"));
        }
        Err(error) => {
            error!(sentiment.record_key = %key, %error, "failed to load record");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load record");
        }
    }

    info!(sentiment.record_key = %key, sentiment.strategy = %strategy, "manual reclassification requested");
    let summary = pipeline.reclassify(&key, &strategy).await;
    let status = if summary.is_failed() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    let record = state.store().get_record(&key).await.ok().flatten();

    (status, Json(ClassifyResponse { summary, record })).into_response()
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::app::{AppState, build_router, tests::test_registry};

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn seeded_state() -> (AppState, tempfile::NamedTempFile) {
        let (registry, file) = test_registry(&[
            r#"{"id": "1", "text": "I love this!"}"#,
            r#"{"id": "2", "text": "terrible, worst ever"}"#,
            r#"{"id": "3", "text": "the train leaves at noon"}"#,
        ])
        .await;
        let request = registry.default_request(false);
        registry
            .try_execute(&request, &CancellationToken::new())
            .await
            .expect("run executes");
        (AppState::new(registry, CancellationToken::new()), file)
    }

    #[tokio::test]
    async fn list_returns_page_with_total() {
        let (state, _file) = seeded_state().await;
        let response = build_router(state)
            .oneshot(
                Request::get("/v1/records?limit=2&offset=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["limit"], 2);
        assert_eq!(body["records"].as_array().unwrap().len(), 2);
        assert_eq!(body["records"][0]["record_key"], "src:2");
    }

    #[tokio::test]
    async fn get_one_returns_results_or_404() {
        let (state, _file) = seeded_state().await;
        let router = build_router(state);

        let found = router
            .clone()
            .oneshot(Request::get("/v1/records/src:1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        let body = body_json(found).await;
        assert_eq!(body["results"][0]["label"], "positive");

        let missing = router
            .oneshot(Request::get("/v1/records/src:404").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn classify_adds_model_result() {
        let (state, _file) = seeded_state().await;
        let response = build_router(state)
            .oneshot(
                Request::post("/v1/records/src:2/classify?strategy=model")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["summary"]["classified"], 1);
        let strategies: Vec<&str> = body["record"]["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|result| result["strategy"].as_str().unwrap())
            .collect();
        assert!(strategies.contains(&"lexicon"));
        assert!(strategies.contains(&"model"));
    }

    #[tokio::test]
    async fn classify_rejects_unknown_strategy() {
        let (state, _file) = seeded_state().await;
        let response = build_router(state)
            .oneshot(
                Request::post("/v1/records/src:1/classify?strategy=transformer")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
