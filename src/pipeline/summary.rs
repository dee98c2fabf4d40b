use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classification::SentimentLabel;

/// 実行のステージ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Normalizing,
    Storing,
    SelectingBatch,
    Classifying,
    PersistingResults,
}

impl RunStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunStage::Fetching => "fetching",
            RunStage::Normalizing => "normalizing",
            RunStage::Storing => "storing",
            RunStage::SelectingBatch => "selecting_batch",
            RunStage::Classifying => "classifying",
            RunStage::PersistingResults => "persisting_results",
        }
    }
}

/// 実行の状態。`Failed` は失敗したステージを持つ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunState {
    InProgress(RunStage),
    Done,
    Failed(RunStage),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCounts {
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

impl LabelCounts {
    pub fn record(&mut self, label: SentimentLabel) {
        match label {
            SentimentLabel::Positive => self.positive += 1,
            SentimentLabel::Neutral => self.neutral += 1,
            SentimentLabel::Negative => self.negative += 1,
        }
    }
}

/// 1 回の実行の観測結果。失敗時も途中までの集計を保持する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub strategy_requested: String,
    /// フォールバック後に実際に使ったストラテジー。スキップ時は `None`。
    pub strategy_used: Option<String>,
    pub query: Option<String>,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub normalization_failures: usize,
    pub storage_failures: usize,
    pub classified: usize,
    pub failed: usize,
    pub labels: LabelCounts,
    pub skipped: usize,
    pub cancelled: bool,
    pub state: RunState,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl RunSummary {
    #[must_use]
    pub fn new(
        strategy_requested: impl Into<String>,
        query: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            strategy_requested: strategy_requested.into(),
            strategy_used: None,
            query,
            fetched: 0,
            inserted: 0,
            duplicates: 0,
            normalization_failures: 0,
            storage_failures: 0,
            classified: 0,
            failed: 0,
            labels: LabelCounts::default(),
            skipped: 0,
            cancelled: false,
            state: RunState::InProgress(RunStage::SelectingBatch),
            error: None,
            started_at,
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn advance(&mut self, stage: RunStage) {
        if !self.is_terminal() {
            self.state = RunState::InProgress(stage);
        }
    }

    pub fn fail(&mut self, stage: RunStage, error: impl Into<String>) {
        self.state = RunState::Failed(stage);
        self.error = Some(error.into());
    }

    /// 終了時刻を記録し、失敗していなければ `Done` にする。
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        if !matches!(self.state, RunState::Failed(_)) {
            self.state = RunState::Done;
        }
        let elapsed = (finished_at - self.started_at).num_milliseconds().max(0);
        self.finished_at = Some(finished_at);
        self.duration_ms = Some(u64::try_from(elapsed).unwrap_or(0));
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RunState::Done | RunState::Failed(_))
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.state, RunState::Failed(_))
    }
}
