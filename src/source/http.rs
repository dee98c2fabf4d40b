/// 検索エンドポイントからの取り込みクライアント。
///
/// `GET {base}/v1/search?q=..&max=..` を呼び、`next_cursor` があれば続きのページを取得する。
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use super::{IngestionSource, RawItem, SourceError, SourceQuery};

#[derive(Debug, Clone)]
pub struct HttpSearchSource {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpSearchSource {
    /// # Errors
    /// URL のパースまたは HTTP クライアントの構築に失敗した場合。
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| SourceError::Invalid(format!("failed to build HTTP client: {error}")))?;

        let mut base_url = Url::parse(base_url)
            .map_err(|error| SourceError::Invalid(format!("invalid source base URL: {error}")))?;
        // join() が最後のパス要素を置き換えないように末尾スラッシュを揃える
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    fn map_transport_error(&self, error: &reqwest::Error) -> SourceError {
        if error.is_timeout() {
            SourceError::Timeout(self.timeout)
        } else if error.is_decode() {
            SourceError::Invalid(format!("failed to decode search response: {error}"))
        } else {
            SourceError::Unavailable(format!("search request failed: {error}"))
        }
    }

    async fn fetch_page(
        &self,
        query: &str,
        max: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<RawItem>, Option<String>), SourceError> {
        let mut url = self
            .base_url
            .join("v1/search")
            .map_err(|error| SourceError::Invalid(format!("failed to build search URL: {error}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            pairs.append_pair("max", &max.to_string());
            if let Some(cursor) = cursor {
                pairs.append_pair("cursor", cursor);
            }
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| self.map_transport_error(&error))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::Unavailable(format!(
                "search endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Invalid(format!(
                "search endpoint returned {status}: {body}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| self.map_transport_error(&error))?;
        parse_page(body)
    }
}

/// `{"data": [...], "next_cursor": ..}` もしくは配列そのものを受け付ける。
fn parse_page(body: Value) -> Result<(Vec<RawItem>, Option<String>), SourceError> {
    match body {
        Value::Array(items) => Ok((items.into_iter().map(RawItem).collect(), None)),
        Value::Object(mut object) => {
            let next_cursor = object
                .get("next_cursor")
                .and_then(Value::as_str)
                .filter(|cursor| !cursor.is_empty())
                .map(str::to_string);
            match object.remove("data") {
                Some(Value::Array(items)) => {
                    Ok((items.into_iter().map(RawItem).collect(), next_cursor))
                }
                Some(other) => Err(SourceError::Invalid(format!(
                    "expected data to be an array, got {other}"
                ))),
                None => Err(SourceError::Invalid(
                    "search response has no data field".to_string(),
                )),
            }
        }
        other => Err(SourceError::Invalid(format!(
            "unexpected search response: {other}"
        ))),
    }
}

#[async_trait]
impl IngestionSource for HttpSearchSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawItem>, SourceError> {
        let mut items: Vec<RawItem> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page_count = 0_usize;

        loop {
            page_count += 1;
            let remaining = query.max_items.saturating_sub(items.len());
            let (page, next_cursor) = self
                .fetch_page(&query.query, remaining, cursor.as_deref())
                .await?;
            let page_len = page.len();
            items.extend(page);

            debug!(
                page = page_count,
                items = page_len,
                total = items.len(),
                "fetched search page"
            );

            if items.len() >= query.max_items || page_len == 0 {
                break;
            }
            match next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        items.truncate(query.max_items);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(server: &MockServer) -> HttpSearchSource {
        HttpSearchSource::new(&server.uri(), Duration::from_secs(5)).expect("source should build")
    }

    #[tokio::test]
    async fn fetch_returns_data_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("q", "rust"))
            .and(query_param("max", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "1", "text": "I love this!"},
                    {"id": "2", "text": "terrible, worst ever"}
                ],
                "next_cursor": null
            })))
            .mount(&server)
            .await;

        let items = source(&server)
            .fetch(&SourceQuery::new("rust", 10))
            .await
            .expect("fetch should succeed");

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0["id"], "1");
    }

    #[tokio::test]
    async fn fetch_accepts_bare_array_and_truncates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "text": "a"},
                {"id": 2, "text": "b"},
                {"id": 3, "text": "c"}
            ])))
            .mount(&server)
            .await;

        let items = source(&server)
            .fetch(&SourceQuery::new("any", 2))
            .await
            .expect("fetch should succeed");

        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn fetch_follows_next_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("cursor", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "3", "text": "third"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("max", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "1", "text": "first"}, {"id": "2", "text": "second"}],
                "next_cursor": "page-2"
            })))
            .mount(&server)
            .await;

        let items = source(&server)
            .fetch(&SourceQuery::new("rust", 10))
            .await
            .expect("fetch should succeed");

        let ids: Vec<_> = items.iter().map(|item| item.0["id"].clone()).collect();
        assert_eq!(ids, vec![json!("1"), json!("2"), json!("3")]);
    }

    #[tokio::test]
    async fn server_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let error = source(&server)
            .fetch(&SourceQuery::new("rust", 10))
            .await
            .expect_err("503 should fail");
        assert!(matches!(error, SourceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn rate_limit_is_unavailable_and_bad_request_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("q", "limited"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("q", "bad"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad query"))
            .mount(&server)
            .await;

        let source = source(&server);
        assert!(matches!(
            source.fetch(&SourceQuery::new("limited", 5)).await,
            Err(SourceError::Unavailable(_))
        ));
        assert!(matches!(
            source.fetch(&SourceQuery::new("bad", 5)).await,
            Err(SourceError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([]))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let source = HttpSearchSource::new(&server.uri(), Duration::from_millis(50))
            .expect("source should build");
        let error = source
            .fetch(&SourceQuery::new("rust", 5))
            .await
            .expect_err("should time out");
        assert_eq!(error, SourceError::Timeout(Duration::from_millis(50)));
    }

    #[test]
    fn parse_page_rejects_non_array_data() {
        assert!(matches!(
            parse_page(json!({"data": {"id": 1}})),
            Err(SourceError::Invalid(_))
        ));
        assert!(matches!(parse_page(json!("nope")), Err(SourceError::Invalid(_))));
    }
}
