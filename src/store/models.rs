use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classification::SentimentLabel;

/// レコード単位の分類状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationStatus {
    Unclassified,
    Classified,
    ClassificationFailed,
}

impl ClassificationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ClassificationStatus::Unclassified => "unclassified",
            ClassificationStatus::Classified => "classified",
            ClassificationStatus::ClassificationFailed => "classification_failed",
        }
    }
}

impl fmt::Display for ClassificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassificationStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "unclassified" => Ok(Self::Unclassified),
            "classified" => Ok(Self::Classified),
            "classification_failed" => Ok(Self::ClassificationFailed),
            other => Err(format!("unknown classification status: {other}")),
        }
    }
}

/// 投稿のエンゲージメント指標。ソースが返さなければ `None`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementMetrics {
    pub retweet_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub like_count: Option<i64>,
    pub quote_count: Option<i64>,
}

/// 正規化済みのレコード。`record_key` がストア全体で一意。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub record_key: String,
    pub source_id: Option<String>,
    pub text: String,
    pub author: Option<String>,
    pub lang: Option<String>,
    pub metrics: EngagementMetrics,
    pub created_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub status: ClassificationStatus,
}

/// (record_key, strategy) ごとの最新の分類結果。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub record_key: String,
    pub strategy: String,
    pub score: f64,
    pub confidence: f64,
    pub label: SentimentLabel,
    pub strategy_version: String,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// `(ingested_at, record_key)` のキーセットカーソル。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCursor {
    pub ingested_at: DateTime<Utc>,
    pub record_key: String,
}

impl BatchCursor {
    #[must_use]
    pub fn from_record(record: &CanonicalRecord) -> Self {
        Self {
            ingested_at: record.ingested_at,
            record_key: record.record_key.clone(),
        }
    }

    /// このカーソルより後ろに並ぶレコードかどうか。
    #[must_use]
    pub fn precedes(&self, record: &CanonicalRecord) -> bool {
        (record.ingested_at, record.record_key.as_str())
            > (self.ingested_at, self.record_key.as_str())
    }
}

/// ダッシュボード向けの読み取りビュー。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordWithResults {
    #[serde(flatten)]
    pub record: CanonicalRecord,
    pub results: Vec<ClassificationResult>,
}
