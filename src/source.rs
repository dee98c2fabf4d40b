//! 取り込み元（外部ソース）の抽象。
//!
//! ソースは有限で重複を含み得る [`RawItem`] の列を返す。重複排除はストア側の責務。
pub mod http;
pub mod jsonl;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SourceSettings;

pub use http::HttpSearchSource;
pub use jsonl::JsonLinesSource;

/// 外部から取得した未加工の項目。形は保証されない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawItem(pub serde_json::Value);

impl From<serde_json::Value> for RawItem {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub query: String,
    pub max_items: usize,
}

impl SourceQuery {
    #[must_use]
    pub fn new(query: impl Into<String>, max_items: usize) -> Self {
        Self {
            query: query.into(),
            max_items,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// 一時的に到達できない（接続失敗, 5xx, 429）。再試行対象。
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source timed out after {0:?}")]
    Timeout(Duration),
    /// 応答やファイルが不正。再試行しない。
    #[error("invalid source response: {0}")]
    Invalid(String),
}

impl SourceError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_) | SourceError::Timeout(_))
    }
}

#[async_trait]
pub trait IngestionSource: Send + Sync {
    fn name(&self) -> &str;

    /// 最大 `query.max_items` 件の項目を取得する。
    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawItem>, SourceError>;
}

/// 設定から取り込み元を組み立てる。
///
/// # Errors
/// ベース URL が不正、または HTTP クライアントを構築できない場合。
pub fn build_source(
    settings: &SourceSettings,
    timeout: Duration,
) -> Result<Arc<dyn IngestionSource>, SourceError> {
    match settings {
        SourceSettings::Http { base_url } => {
            Ok(Arc::new(HttpSearchSource::new(base_url, timeout)?))
        }
        SourceSettings::JsonLines { path } => Ok(Arc::new(JsonLinesSource::new(path.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SourceError::Unavailable("503".into()).is_retryable());
        assert!(SourceError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!SourceError::Invalid("bad json".into()).is_retryable());
    }

    #[test]
    fn build_source_rejects_bad_url() {
        let settings = SourceSettings::Http {
            base_url: "not a url".to_string(),
        };
        assert!(matches!(
            build_source(&settings, Duration::from_secs(1)),
            Err(SourceError::Invalid(_))
        ));
    }

    #[test]
    fn build_source_for_jsonl() {
        let settings = SourceSettings::JsonLines {
            path: "/tmp/tweets.jsonl".into(),
        };
        let source = build_source(&settings, Duration::from_secs(1)).expect("source");
        assert_eq!(source.name(), "jsonl");
    }
}
