//! TF-IDF + 多クラスロジスティック回帰による学習済み感情モデル。
//!
//! 重みは JSON で配布する。既定の重みはバイナリに埋め込まれており、
//! `SENTIMENT_MODEL_WEIGHTS` で別ファイルに差し替えられる。
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rayon::prelude::*;
use serde::Deserialize;
use tracing::debug;

use super::features::TfidfVectorizer;
use super::{ClassificationError, RawScore, SentimentLabel, SentimentStrategy};

const EMBEDDED_WEIGHTS: &str = include_str!("../../resources/sentiment_model_weights.json");

#[derive(Debug, Deserialize)]
struct ModelWeights {
    version: String,
    classes: Vec<String>,
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    coefficients: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
}

/// クラス確率（negative, neutral, positive の順）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassProbabilities {
    pub negative: f64,
    pub neutral: f64,
    pub positive: f64,
}

impl ClassProbabilities {
    #[must_use]
    pub fn argmax(&self) -> SentimentLabel {
        if self.positive >= self.negative && self.positive >= self.neutral {
            SentimentLabel::Positive
        } else if self.negative >= self.neutral {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinearSentimentModel {
    version: String,
    vectorizer: TfidfVectorizer,
    coefficients: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
    /// negative, neutral, positive の行インデックス。
    class_rows: [usize; 3],
}

impl LinearSentimentModel {
    /// 埋め込み済みの既定重みを読み込む。
    ///
    /// # Errors
    /// 重みが壊れている場合は [`ClassificationError::ModelUnavailable`]。
    pub fn embedded() -> Result<Self, ClassificationError> {
        Self::from_json(EMBEDDED_WEIGHTS)
    }

    /// # Errors
    /// ファイルが読めない、または形式が不正な場合。
    pub fn from_path(path: &Path) -> Result<Self, ClassificationError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            ClassificationError::ModelUnavailable(format!(
                "failed to read model weights {}: {error}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }

    /// # Errors
    /// JSON が不正、または次元が一致しない場合。
    pub fn from_json(raw: &str) -> Result<Self, ClassificationError> {
        let weights: ModelWeights = serde_json::from_str(raw).map_err(|error| {
            ClassificationError::ModelUnavailable(format!("invalid model weights: {error}"))
        })?;
        Self::from_weights(weights)
    }

    fn from_weights(weights: ModelWeights) -> Result<Self, ClassificationError> {
        let invalid = |reason: String| ClassificationError::ModelUnavailable(reason);

        let class_row = |label: SentimentLabel| {
            weights
                .classes
                .iter()
                .position(|class| class == label.as_str())
                .ok_or_else(|| invalid(format!("model weights lack class {label}")))
        };
        let class_rows = [
            class_row(SentimentLabel::Negative)?,
            class_row(SentimentLabel::Neutral)?,
            class_row(SentimentLabel::Positive)?,
        ];

        let dimension = weights.idf.len();
        if weights.coefficients.len() != weights.classes.len()
            || weights.intercepts.len() != weights.classes.len()
        {
            return Err(invalid(format!(
                "expected {} coefficient rows and intercepts, got {} and {}",
                weights.classes.len(),
                weights.coefficients.len(),
                weights.intercepts.len()
            )));
        }
        if let Some(row) = weights.coefficients.iter().find(|row| row.len() != dimension) {
            return Err(invalid(format!(
                "coefficient row has {} columns, expected {dimension}",
                row.len()
            )));
        }
        if let Some((term, index)) = weights
            .vocabulary
            .iter()
            .find(|(_, index)| **index >= dimension)
        {
            return Err(invalid(format!(
                "vocabulary term {term:?} points at column {index} beyond {dimension}"
            )));
        }

        Ok(Self {
            version: weights.version,
            vectorizer: TfidfVectorizer::new(weights.vocabulary, weights.idf),
            coefficients: weights.coefficients,
            intercepts: weights.intercepts,
            class_rows,
        })
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.vectorizer.dimension()
    }

    #[must_use]
    pub fn predict_proba(&self, text: &str) -> ClassProbabilities {
        let features = self.vectorizer.transform(text);
        let logits: Vec<f64> = self
            .coefficients
            .iter()
            .zip(&self.intercepts)
            .map(|(row, intercept)| {
                intercept
                    + features
                        .iter()
                        .map(|(index, weight)| row[*index] * weight)
                        .sum::<f64>()
            })
            .collect();

        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|logit| (logit - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        let [negative, neutral, positive] = self.class_rows.map(|row| exps[row] / total);

        ClassProbabilities {
            negative,
            neutral,
            positive,
        }
    }
}

/// 学習済みモデルを [`SentimentStrategy`] として公開する。
#[derive(Debug, Clone)]
pub struct ModelStrategy {
    model: LinearSentimentModel,
}

impl ModelStrategy {
    pub const NAME: &'static str = "model";

    #[must_use]
    pub fn new(model: LinearSentimentModel) -> Self {
        Self { model }
    }

    /// 重みをブロッキングスレッドで読み込む。`path` が `None` なら埋め込み重み。
    ///
    /// # Errors
    /// 読み込み失敗は [`ClassificationError::ModelUnavailable`]、
    /// 制限時間超過は [`ClassificationError::Timeout`]。
    pub async fn load(
        path: Option<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, ClassificationError> {
        Self::load_with(timeout, move || match path {
            Some(path) => {
                debug!(path = %path.display(), "loading sentiment model weights");
                LinearSentimentModel::from_path(&path)
            }
            None => LinearSentimentModel::embedded(),
        })
        .await
    }

    /// 任意の読み込み処理をブロッキングスレッドで `timeout` まで待つ。
    pub(crate) async fn load_with<F>(
        timeout: Duration,
        loader: F,
    ) -> Result<Self, ClassificationError>
    where
        F: FnOnce() -> Result<LinearSentimentModel, ClassificationError> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(loader);

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(model)) => model.map(Self::new),
            Ok(Err(join_error)) => Err(ClassificationError::ModelUnavailable(format!(
                "model loading task failed: {join_error}"
            ))),
            Err(_) => Err(ClassificationError::Timeout(timeout)),
        }
    }

    #[must_use]
    pub fn model(&self) -> &LinearSentimentModel {
        &self.model
    }
}

impl SentimentStrategy for ModelStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        self.model.version()
    }

    fn score(&self, text: &str) -> Result<RawScore, ClassificationError> {
        let proba = self.model.predict_proba(text);
        let confidence = proba.negative.max(proba.neutral).max(proba.positive);
        Ok(RawScore::new(proba.positive - proba.negative, confidence))
    }

    fn score_batch(&self, texts: &[String]) -> Vec<Result<RawScore, ClassificationError>> {
        texts.par_iter().map(|text| self.score(text)).collect()
    }
}
