//! 感情分類ストラテジーの高水準API。
//!
//! ストラテジーは [`SentimentStrategy`] を実装し、名前で [`StrategyRegistry`] に登録する。
//! スコアからラベルへの変換はストラテジーに依存せず、共通の [`LabelThresholds`] を通す。
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

mod features;
mod lexicon;
mod model;
mod vocabulary;

pub use lexicon::LexiconStrategy;
pub use model::{LinearSentimentModel, ModelStrategy};

/// 離散ラベル。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "positive" => Ok(Self::Positive),
            "neutral" => Ok(Self::Neutral),
            "negative" => Ok(Self::Negative),
            other => Err(format!("unknown sentiment label: {other}")),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid label thresholds: positive={positive}, negative={negative}")]
pub struct InvalidThresholds {
    pub positive: f64,
    pub negative: f64,
}

/// スコアからラベルへの境界。
///
/// `score > positive` で Positive、`score < negative` で Negative、それ以外は Neutral。
/// 境界値ちょうどは Neutral になる。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelThresholds {
    positive: f64,
    negative: f64,
}

impl Default for LabelThresholds {
    fn default() -> Self {
        Self {
            positive: 0.05,
            negative: -0.05,
        }
    }
}

impl LabelThresholds {
    /// # Errors
    /// 値が有限でない、`[-1, 1]` の外にある、または `negative >= positive` の場合。
    pub fn new(positive: f64, negative: f64) -> Result<Self, InvalidThresholds> {
        let in_range = |v: f64| v.is_finite() && (-1.0..=1.0).contains(&v);
        if !in_range(positive) || !in_range(negative) || negative >= positive {
            return Err(InvalidThresholds { positive, negative });
        }
        Ok(Self { positive, negative })
    }

    #[must_use]
    pub fn positive(&self) -> f64 {
        self.positive
    }

    #[must_use]
    pub fn negative(&self) -> f64 {
        self.negative
    }

    #[must_use]
    pub fn label_for(&self, score: f64) -> SentimentLabel {
        if score > self.positive {
            SentimentLabel::Positive
        } else if score < self.negative {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        }
    }
}

/// ストラテジーが返す生スコア。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawScore {
    /// `[-1, 1]` に収まる極性スコア。
    pub score: f64,
    /// `[0, 1]` の確信度。
    pub confidence: f64,
}

impl RawScore {
    #[must_use]
    pub fn new(score: f64, confidence: f64) -> Self {
        Self {
            score: score.clamp(-1.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClassificationError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("classification failed: {0}")]
    Failed(String),
}

/// 感情スコアリングの共通インターフェース。
pub trait SentimentStrategy: Send + Sync + fmt::Debug {
    /// 登録名。結果テーブルのキーにもなる。
    fn name(&self) -> &str;

    /// 結果に記録するバージョンタグ。
    fn version(&self) -> &str;

    /// # Errors
    /// スコアリングに失敗した場合は [`ClassificationError`] を返す。
    fn score(&self, text: &str) -> Result<RawScore, ClassificationError>;

    /// 複数テキストをまとめてスコアリングする。結果は入力と同じ順序・件数。
    fn score_batch(&self, texts: &[String]) -> Vec<Result<RawScore, ClassificationError>> {
        texts.iter().map(|text| self.score(text)).collect()
    }
}

/// 要求されたストラテジーが使えないときの方針。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// lexicon ストラテジーで代替する。
    #[default]
    Lexicon,
    /// そのバッチの分類をスキップする。
    Skip,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "lexicon" => Ok(Self::Lexicon),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown fallback policy: {other}")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown strategy: {0}")]
pub struct UnknownStrategy(pub String);

/// [`StrategyRegistry::resolve`] の結果。
#[derive(Debug, Clone)]
pub enum StrategyResolution {
    Ready(Arc<dyn SentimentStrategy>),
    Fallback {
        requested: String,
        reason: String,
        strategy: Arc<dyn SentimentStrategy>,
    },
    Skip {
        requested: String,
        reason: String,
    },
}

/// 名前でストラテジーを引くレジストリ。
#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn SentimentStrategy>>,
    unavailable: HashMap<String, String>,
    fallback: FallbackPolicy,
}

impl StrategyRegistry {
    #[must_use]
    pub fn new(fallback: FallbackPolicy) -> Self {
        Self {
            strategies: HashMap::new(),
            unavailable: HashMap::new(),
            fallback,
        }
    }

    /// lexicon のみを登録したレジストリ。
    #[must_use]
    pub fn with_lexicon(fallback: FallbackPolicy) -> Self {
        let mut registry = Self::new(fallback);
        registry.register(Arc::new(LexiconStrategy::new()));
        registry
    }

    /// lexicon と学習済みモデルを登録する。
    ///
    /// モデルのロードはタイムアウト付きで一度だけ行う。失敗してもエラーにはせず、
    /// `model` を利用不可として記録し、解決時にフォールバック方針を適用する。
    pub async fn load(
        fallback: FallbackPolicy,
        model_path: Option<&std::path::Path>,
        load_timeout: Duration,
    ) -> Self {
        let loaded =
            ModelStrategy::load(model_path.map(std::path::Path::to_path_buf), load_timeout).await;
        Self::with_loaded_model(fallback, loaded)
    }

    /// モデル読み込みの結果からレジストリを組み立てる。失敗時は利用不可として登録する。
    pub(crate) fn with_loaded_model(
        fallback: FallbackPolicy,
        loaded: Result<ModelStrategy, ClassificationError>,
    ) -> Self {
        let mut registry = Self::with_lexicon(fallback);
        match loaded {
            Ok(strategy) => {
                info!(
                    strategy = strategy.name(),
                    version = strategy.version(),
                    "learned sentiment model loaded"
                );
                registry.register(Arc::new(strategy));
            }
            Err(error) => {
                warn!(%error, ?fallback, "learned sentiment model unavailable");
                registry.mark_unavailable(ModelStrategy::NAME, error.to_string());
            }
        }
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn SentimentStrategy>) {
        let name = strategy.name().to_string();
        self.unavailable.remove(&name);
        self.strategies.insert(name, strategy);
    }

    pub fn mark_unavailable(&mut self, name: &str, reason: impl Into<String>) {
        self.strategies.remove(name);
        self.unavailable.insert(name.to_string(), reason.into());
    }

    #[must_use]
    pub fn fallback_policy(&self) -> FallbackPolicy {
        self.fallback
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .strategies
            .keys()
            .chain(self.unavailable.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// 名前からストラテジーを解決する。
    ///
    /// # Errors
    /// 登録も利用不可記録もされていない名前なら [`UnknownStrategy`]。
    pub fn resolve(&self, name: &str) -> Result<StrategyResolution, UnknownStrategy> {
        if let Some(strategy) = self.strategies.get(name) {
            return Ok(StrategyResolution::Ready(Arc::clone(strategy)));
        }

        let Some(reason) = self.unavailable.get(name) else {
            return Err(UnknownStrategy(name.to_string()));
        };

        let lexicon = self.strategies.get(LexiconStrategy::NAME);
        match (self.fallback, lexicon) {
            (FallbackPolicy::Lexicon, Some(lexicon)) => Ok(StrategyResolution::Fallback {
                requested: name.to_string(),
                reason: reason.clone(),
                strategy: Arc::clone(lexicon),
            }),
            _ => Ok(StrategyResolution::Skip {
                requested: name.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.050_001, SentimentLabel::Positive)]
    #[case(0.05, SentimentLabel::Neutral)]
    #[case(0.049_999, SentimentLabel::Neutral)]
    #[case(0.0, SentimentLabel::Neutral)]
    #[case(-0.05, SentimentLabel::Neutral)]
    #[case(-0.050_001, SentimentLabel::Negative)]
    fn default_thresholds_have_exclusive_boundaries(
        #[case] score: f64,
        #[case] expected: SentimentLabel,
    ) {
        assert_eq!(LabelThresholds::default().label_for(score), expected);
    }

    #[test]
    fn thresholds_reject_inverted_bounds() {
        assert!(LabelThresholds::new(-0.1, 0.1).is_err());
        assert!(LabelThresholds::new(0.1, 0.1).is_err());
        assert!(LabelThresholds::new(1.5, 0.0).is_err());
        assert!(LabelThresholds::new(f64::NAN, 0.0).is_err());
        assert!(LabelThresholds::new(0.2, -0.3).is_ok());
    }

    #[test]
    fn label_round_trips_through_str() {
        for label in [
            SentimentLabel::Positive,
            SentimentLabel::Neutral,
            SentimentLabel::Negative,
        ] {
            assert_eq!(label.as_str().parse::<SentimentLabel>(), Ok(label));
        }
        assert!("mixed".parse::<SentimentLabel>().is_err());
    }

    #[test]
    fn resolve_ready_strategy() {
        let registry = StrategyRegistry::with_lexicon(FallbackPolicy::Skip);
        let resolution = registry.resolve("lexicon").expect("lexicon registered");
        assert!(matches!(resolution, StrategyResolution::Ready(s) if s.name() == "lexicon"));
    }

    #[test]
    fn resolve_unavailable_model_falls_back_to_lexicon() {
        let mut registry = StrategyRegistry::with_lexicon(FallbackPolicy::Lexicon);
        registry.mark_unavailable("model", "weights missing");

        match registry.resolve("model").expect("known name") {
            StrategyResolution::Fallback {
                requested,
                reason,
                strategy,
            } => {
                assert_eq!(requested, "model");
                assert_eq!(reason, "weights missing");
                assert_eq!(strategy.name(), "lexicon");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn resolve_unavailable_model_skips_under_skip_policy() {
        let mut registry = StrategyRegistry::with_lexicon(FallbackPolicy::Skip);
        registry.mark_unavailable("model", "weights missing");

        assert!(matches!(
            registry.resolve("model"),
            Ok(StrategyResolution::Skip { .. })
        ));
    }

    #[test]
    fn resolve_unknown_name_is_an_error() {
        let registry = StrategyRegistry::with_lexicon(FallbackPolicy::Lexicon);
        assert_eq!(
            registry.resolve("transformer").unwrap_err(),
            UnknownStrategy("transformer".to_string())
        );
    }

    #[test]
    fn fallback_policy_parses_case_insensitively() {
        assert_eq!("Lexicon".parse::<FallbackPolicy>(), Ok(FallbackPolicy::Lexicon));
        assert_eq!(" skip ".parse::<FallbackPolicy>(), Ok(FallbackPolicy::Skip));
        assert!("retry".parse::<FallbackPolicy>().is_err());
    }

    #[tokio::test]
    async fn load_registers_embedded_model() {
        let registry =
            StrategyRegistry::load(FallbackPolicy::Lexicon, None, Duration::from_secs(5)).await;
        assert!(matches!(
            registry.resolve("model"),
            Ok(StrategyResolution::Ready(_))
        ));
        assert_eq!(registry.names(), vec!["lexicon", "model"]);
    }

    #[tokio::test]
    async fn load_marks_model_unavailable_for_missing_weights() {
        let registry = StrategyRegistry::load(
            FallbackPolicy::Lexicon,
            Some(std::path::Path::new("/nonexistent/weights.json")),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(
            registry.resolve("model"),
            Ok(StrategyResolution::Fallback { .. })
        ));
    }

    #[tokio::test]
    async fn model_load_timeout_falls_back_to_lexicon() {
        let limit = Duration::from_millis(1);
        let (release, wait) = std::sync::mpsc::channel::<()>();
        let loaded = ModelStrategy::load_with(limit, move || {
            let _ = wait.recv();
            LinearSentimentModel::embedded()
        })
        .await;
        release.send(()).expect("loader still waiting");
        assert!(matches!(loaded, Err(ClassificationError::Timeout(_))));

        let registry = StrategyRegistry::with_loaded_model(FallbackPolicy::Lexicon, loaded);
        match registry.resolve("model").expect("known name") {
            StrategyResolution::Fallback {
                reason, strategy, ..
            } => {
                assert_eq!(reason, ClassificationError::Timeout(limit).to_string());
                assert_eq!(strategy.name(), "lexicon");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }
}
