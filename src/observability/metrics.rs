/// Prometheusメトリクス定義。
use prometheus::{
    Counter, Gauge, Histogram, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // 取り込み
    pub records_fetched: Counter,
    pub records_inserted: Counter,
    pub records_duplicate: Counter,
    pub normalization_failures: Counter,
    pub storage_failures: Counter,

    // 分類
    pub records_classified: Counter,
    pub classification_failures: Counter,
    pub strategy_fallbacks: Counter,
    pub batches_skipped: Counter,

    // 実行
    pub runs_completed: Counter,
    pub runs_failed: Counter,
    pub retries_total: Counter,

    // ヒストグラム
    pub fetch_duration: Histogram,
    pub classification_batch_duration: Histogram,
    pub run_duration: Histogram,

    // ゲージ
    pub active_runs: Gauge,
}

impl Metrics {
    /// 指定したレジストリにメトリクスを登録する。
    ///
    /// # Errors
    /// 同じ名前のメトリクスが既に登録されている場合。
    #[allow(clippy::too_many_lines)]
    pub fn new(registry: &Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            records_fetched: register_counter_with_registry!(
                "sentiment_records_fetched_total",
                "Total number of raw items fetched from the ingestion source",
                registry
            )?,
            records_inserted: register_counter_with_registry!(
                "sentiment_records_inserted_total",
                "Total number of new records stored",
                registry
            )?,
            records_duplicate: register_counter_with_registry!(
                "sentiment_records_duplicate_total",
                "Total number of fetched items that were already stored",
                registry
            )?,
            normalization_failures: register_counter_with_registry!(
                "sentiment_normalization_failures_total",
                "Total number of raw items rejected by the normalizer",
                registry
            )?,
            storage_failures: register_counter_with_registry!(
                "sentiment_storage_failures_total",
                "Total number of records that could not be stored",
                registry
            )?,
            records_classified: register_counter_with_registry!(
                "sentiment_records_classified_total",
                "Total number of classification results persisted",
                registry
            )?,
            classification_failures: register_counter_with_registry!(
                "sentiment_classification_failures_total",
                "Total number of records whose classification failed",
                registry
            )?,
            strategy_fallbacks: register_counter_with_registry!(
                "sentiment_strategy_fallbacks_total",
                "Number of runs that fell back to the lexicon strategy",
                registry
            )?,
            batches_skipped: register_counter_with_registry!(
                "sentiment_batches_skipped_total",
                "Number of classification passes skipped because the strategy was unavailable",
                registry
            )?,
            runs_completed: register_counter_with_registry!(
                "sentiment_runs_completed_total",
                "Total number of runs that reached Done",
                registry
            )?,
            runs_failed: register_counter_with_registry!(
                "sentiment_runs_failed_total",
                "Total number of runs that ended in a failed stage",
                registry
            )?,
            retries_total: register_counter_with_registry!(
                "sentiment_retries_total",
                "Total number of store and source retries",
                registry
            )?,
            fetch_duration: register_histogram_with_registry!(
                "sentiment_fetch_duration_seconds",
                "Duration of fetch operations",
                registry
            )?,
            classification_batch_duration: register_histogram_with_registry!(
                "sentiment_classification_batch_duration_seconds",
                "Duration of scoring one classification batch",
                registry
            )?,
            run_duration: register_histogram_with_registry!(
                "sentiment_run_duration_seconds",
                "Duration of a whole pipeline run",
                registry
            )?,
            active_runs: register_gauge_with_registry!(
                "sentiment_active_runs",
                "Number of pipeline runs in progress",
                registry
            )?,
        })
    }
}
