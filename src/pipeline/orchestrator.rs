//! Pipeline orchestrator and builder for the sentiment pipeline.

use std::{future::Future, num::NonZeroUsize, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use prometheus::Registry;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    classification::{
        ClassificationError, LabelThresholds, RawScore, SentimentLabel, SentimentStrategy,
        StrategyRegistry, StrategyResolution,
    },
    config::Config,
    observability::metrics::Metrics,
    source::{IngestionSource, RawItem, SourceError, SourceQuery},
    store::{
        BatchCursor, CanonicalRecord, ClassificationResult, RecordStore, StoreError, UpsertOutcome,
    },
    util::{retry::RetryConfig, text::preview},
};

use super::normalize::normalize;
use super::summary::{RunStage, RunSummary};

/// 実行時のチューニング値。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub batch_size: NonZeroUsize,
    pub concurrency: NonZeroUsize,
    pub fetch_timeout: Duration,
    pub store_retry: RetryConfig,
    pub source_retry: RetryConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN),
            concurrency: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            fetch_timeout: Duration::from_secs(30),
            store_retry: RetryConfig::new(3, 100, 2_000),
            source_retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size(),
            concurrency: config.classify_concurrency(),
            fetch_timeout: config.fetch_timeout(),
            store_retry: config.store_retry(),
            source_retry: config.source_retry(),
        }
    }
}

/// 1 回の実行要求。`source_query` が無ければ分類のみを行う。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub source_query: Option<SourceQuery>,
    pub strategy: String,
}

impl RunRequest {
    #[must_use]
    pub fn ingest(query: SourceQuery, strategy: impl Into<String>) -> Self {
        Self {
            source_query: Some(query),
            strategy: strategy.into(),
        }
    }

    #[must_use]
    pub fn classify_only(strategy: impl Into<String>) -> Self {
        Self {
            source_query: None,
            strategy: strategy.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0} must be configured before build")]
    Missing(&'static str),
    #[error("failed to register pipeline metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// レコード 1 件の分類結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Classified(SentimentLabel),
    Failed,
}

/// Core pipeline orchestrator that coordinates all stages.
pub struct PipelineOrchestrator {
    store: Arc<dyn RecordStore>,
    source: Option<Arc<dyn IngestionSource>>,
    strategies: Arc<StrategyRegistry>,
    thresholds: LabelThresholds,
    settings: OrchestratorSettings,
    metrics: Arc<Metrics>,
}

/// Builder pattern for constructing `PipelineOrchestrator`.
#[derive(Default)]
pub struct PipelineBuilder {
    store: Option<Arc<dyn RecordStore>>,
    source: Option<Arc<dyn IngestionSource>>,
    strategies: Option<Arc<StrategyRegistry>>,
    thresholds: Option<LabelThresholds>,
    settings: Option<OrchestratorSettings>,
    metrics: Option<Arc<Metrics>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn IngestionSource>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_strategies(mut self, strategies: Arc<StrategyRegistry>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: LabelThresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// # Errors
    /// ストアかストラテジーが未設定、または既定メトリクスの登録に失敗した場合。
    pub fn build(self) -> Result<PipelineOrchestrator, BuildError> {
        let store = self.store.ok_or(BuildError::Missing("record store"))?;
        let strategies = self
            .strategies
            .ok_or(BuildError::Missing("strategy registry"))?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::new(&Arc::new(Registry::new()))?),
        };

        Ok(PipelineOrchestrator {
            store,
            source: self.source,
            strategies,
            thresholds: self.thresholds.unwrap_or_default(),
            settings: self.settings.unwrap_or_default(),
            metrics,
        })
    }
}

impl PipelineOrchestrator {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    #[must_use]
    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    #[must_use]
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 実行全体を駆動する。失敗してもエラーは返さず、集計を [`RunSummary`] に載せて返す。
    pub async fn execute(&self, request: &RunRequest, cancel: &CancellationToken) -> RunSummary {
        let query_text = request.source_query.as_ref().map(|q| q.query.clone());
        let mut summary = RunSummary::new(&request.strategy, query_text, Utc::now());
        let span = info_span!("sentiment_run", run_id = %summary.run_id, strategy = %request.strategy);

        async move {
            info!(
                sentiment.run_id = %summary.run_id,
                sentiment.strategy = %request.strategy,
                classify_only = request.source_query.is_none(),
                "sentiment run started"
            );
            self.metrics.active_runs.inc();

            let ingested_ok = match &request.source_query {
                Some(query) => self.ingest(query, cancel, &mut summary).await,
                None => true,
            };
            if ingested_ok {
                self.classify_into(&request.strategy, cancel, &mut summary)
                    .await;
            }

            self.metrics.active_runs.dec();
            self.finish(summary)
        }
        .instrument(span)
        .await
    }

    /// 取り込みを伴わない分類のみの実行。
    pub async fn classify_pending(&self, strategy: &str, cancel: &CancellationToken) -> RunSummary {
        self.execute(&RunRequest::classify_only(strategy), cancel).await
    }

    /// 1 件のレコードを状態に関係なく再分類する。`SelectingBatch` から入る。
    ///
    /// レコードが存在しなければ `Failed(SelectingBatch)` の集計を返す。
    pub async fn reclassify(&self, record_key: &str, strategy: &str) -> RunSummary {
        let mut summary = RunSummary::new(strategy, None, Utc::now());
        summary.advance(RunStage::SelectingBatch);

        let store = &self.store;
        let record = match self
            .store_call("get_record", move || store.get_record(record_key))
            .await
        {
            Ok(Some(view)) => view.record,
            Ok(None) => {
                summary.fail(
                    RunStage::SelectingBatch,
                    format!("record {record_key} not found"),
                );
                return self.finish(summary);
            }
            Err(error) => {
                summary.fail(RunStage::SelectingBatch, error.to_string());
                return self.finish(summary);
            }
        };

        let Some(strategy) = self.resolve_strategy(strategy, &mut summary) else {
            if !summary.is_failed() {
                summary.skipped = 1;
            }
            return self.finish(summary);
        };

        info!(
            sentiment.run_id = %summary.run_id,
            sentiment.record_key = %record_key,
            sentiment.strategy = strategy.name(),
            "reclassifying record"
        );
        self.classify_batch(&strategy, vec![record], &mut summary)
            .await;
        self.finish(summary)
    }

    /// fetch → normalize → store。fetch が失敗したら `false`。
    async fn ingest(
        &self,
        query: &SourceQuery,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) -> bool {
        summary.advance(RunStage::Fetching);
        let Some(source) = &self.source else {
            summary.fail(RunStage::Fetching, "no ingestion source configured");
            return false;
        };

        let items = tokio::select! {
            () = cancel.cancelled() => {
                summary.cancelled = true;
                info!(sentiment.run_id = %summary.run_id, "run cancelled during fetch");
                return false;
            }
            result = self.fetch_with_retry(source.as_ref(), query) => match result {
                Ok(items) => items,
                Err(error) => {
                    warn!(
                        sentiment.run_id = %summary.run_id,
                        source = source.name(),
                        %error,
                        "fetch failed after retries"
                    );
                    summary.fail(RunStage::Fetching, error.to_string());
                    return false;
                }
            }
        };
        summary.fetched = items.len();
        self.metrics.records_fetched.inc_by(count_f64(items.len()));

        summary.advance(RunStage::Normalizing);
        let records = self.normalize_items(&items, Utc::now(), summary);

        summary.advance(RunStage::Storing);
        self.store_records(&records, summary).await;

        info!(
            sentiment.run_id = %summary.run_id,
            sentiment.fetched = summary.fetched,
            sentiment.inserted = summary.inserted,
            sentiment.duplicates = summary.duplicates,
            sentiment.normalization_failures = summary.normalization_failures,
            sentiment.storage_failures = summary.storage_failures,
            "ingestion finished"
        );
        true
    }

    async fn fetch_with_retry(
        &self,
        source: &dyn IngestionSource,
        query: &SourceQuery,
    ) -> Result<Vec<RawItem>, SourceError> {
        let retry = self.settings.source_retry;
        let timeout = self.settings.fetch_timeout;
        let mut attempt = 0;

        loop {
            let timer = self.metrics.fetch_duration.start_timer();
            let result = match tokio::time::timeout(timeout, source.fetch(query)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(timeout)),
            };
            timer.observe_duration();

            match result {
                Ok(items) => {
                    if attempt > 0 {
                        info!(attempt, "fetch succeeded after retry");
                    }
                    return Ok(items);
                }
                Err(error) => {
                    attempt += 1;
                    if !error.is_retryable() {
                        warn!(%error, "fetch error is not retryable");
                        return Err(error);
                    }
                    if !retry.can_retry(attempt) {
                        warn!(
                            attempt,
                            max_attempts = retry.max_attempts,
                            "fetch failed after all retries"
                        );
                        return Err(error);
                    }

                    let delay = retry.delay_for_attempt(attempt);
                    self.metrics.retries_total.inc();
                    warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %error,
                        "fetch failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn normalize_items(
        &self,
        items: &[RawItem],
        ingested_at: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Vec<CanonicalRecord> {
        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match normalize(item, ingested_at) {
                Ok(record) => records.push(record),
                Err(error) => {
                    summary.normalization_failures += 1;
                    self.metrics.normalization_failures.inc();
                    warn!(
                        sentiment.run_id = %summary.run_id,
                        item_index = index,
                        %error,
                        "skipping malformed item"
                    );
                }
            }
        }
        records
    }

    async fn store_records(&self, records: &[CanonicalRecord], summary: &mut RunSummary) {
        let store = &self.store;
        for record in records {
            match self
                .store_call("upsert_if_absent", move || store.upsert_if_absent(record))
                .await
            {
                Ok(UpsertOutcome::Inserted) => {
                    summary.inserted += 1;
                    self.metrics.records_inserted.inc();
                }
                Ok(UpsertOutcome::AlreadyPresent) => {
                    summary.duplicates += 1;
                    self.metrics.records_duplicate.inc();
                    debug!(sentiment.record_key = %record.record_key, "record already stored");
                }
                Err(error) => {
                    summary.storage_failures += 1;
                    self.metrics.storage_failures.inc();
                    warn!(
                        sentiment.run_id = %summary.run_id,
                        sentiment.record_key = %record.record_key,
                        %error,
                        "failed to store record"
                    );
                }
            }
        }
    }

    /// 名前を解決し、フォールバック・スキップを集計に反映する。
    fn resolve_strategy(
        &self,
        name: &str,
        summary: &mut RunSummary,
    ) -> Option<Arc<dyn SentimentStrategy>> {
        match self.strategies.resolve(name) {
            Ok(StrategyResolution::Ready(strategy)) => {
                summary.strategy_used = Some(strategy.name().to_string());
                Some(strategy)
            }
            Ok(StrategyResolution::Fallback {
                requested,
                reason,
                strategy,
            }) => {
                self.metrics.strategy_fallbacks.inc();
                warn!(
                    sentiment.run_id = %summary.run_id,
                    requested = %requested,
                    fallback = strategy.name(),
                    %reason,
                    "requested strategy unavailable, falling back"
                );
                summary.strategy_used = Some(strategy.name().to_string());
                Some(strategy)
            }
            Ok(StrategyResolution::Skip { requested, reason }) => {
                self.metrics.batches_skipped.inc();
                warn!(
                    sentiment.run_id = %summary.run_id,
                    requested = %requested,
                    %reason,
                    "requested strategy unavailable, skipping classification"
                );
                None
            }
            Err(error) => {
                summary.fail(RunStage::SelectingBatch, error.to_string());
                None
            }
        }
    }

    /// 未分類レコードをバッチ単位で分類する。
    async fn classify_into(
        &self,
        strategy_name: &str,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) {
        summary.advance(RunStage::SelectingBatch);
        let strategy = self.resolve_strategy(strategy_name, summary);
        if summary.is_failed() {
            return;
        }

        // スキップ時は未分類件数だけ数える
        let select_name = strategy
            .as_ref()
            .map_or(strategy_name, |strategy| strategy.name())
            .to_string();
        let batch_size = self.settings.batch_size.get();
        let store = &self.store;
        let mut cursor: Option<BatchCursor> = None;

        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                info!(sentiment.run_id = %summary.run_id, "run cancelled between batches");
                break;
            }

            summary.advance(RunStage::SelectingBatch);
            let after = cursor.as_ref();
            let name = select_name.as_str();
            let batch = match self
                .store_call("select_unclassified", move || {
                    store.select_unclassified_after(name, after, batch_size)
                })
                .await
            {
                Ok(batch) => batch,
                Err(error) => {
                    summary.fail(RunStage::SelectingBatch, error.to_string());
                    return;
                }
            };
            if batch.is_empty() {
                break;
            }
            let exhausted = batch.len() < batch_size;
            cursor = batch.last().map(BatchCursor::from_record);

            match &strategy {
                Some(strategy) => self.classify_batch(strategy, batch, summary).await,
                None => summary.skipped += batch.len(),
            }

            if exhausted {
                break;
            }
        }
    }

    async fn classify_batch(
        &self,
        strategy: &Arc<dyn SentimentStrategy>,
        batch: Vec<CanonicalRecord>,
        summary: &mut RunSummary,
    ) {
        summary.advance(RunStage::Classifying);
        let scores = self.score_batch(strategy, &batch).await;

        summary.advance(RunStage::PersistingResults);
        let computed_at = Utc::now();
        let outcomes: Vec<RecordOutcome> = stream::iter(batch.into_iter().zip(scores))
            .map(|(record, score)| self.persist_one(strategy.as_ref(), record, score, computed_at))
            .buffer_unordered(self.settings.concurrency.get())
            .collect()
            .await;

        let before = summary.classified;
        for outcome in outcomes {
            match outcome {
                RecordOutcome::Classified(label) => {
                    summary.classified += 1;
                    summary.labels.record(label);
                }
                RecordOutcome::Failed => summary.failed += 1,
            }
        }
        debug!(
            sentiment.run_id = %summary.run_id,
            sentiment.strategy = strategy.name(),
            classified = summary.classified - before,
            "classification batch persisted"
        );
    }

    /// スコアリングはブロッキングスレッドで行う。結果は入力と同じ件数に揃える。
    async fn score_batch(
        &self,
        strategy: &Arc<dyn SentimentStrategy>,
        batch: &[CanonicalRecord],
    ) -> Vec<Result<RawScore, ClassificationError>> {
        let texts: Vec<String> = batch.iter().map(|record| record.text.clone()).collect();
        let expected = texts.len();
        let worker = Arc::clone(strategy);

        let timer = self.metrics.classification_batch_duration.start_timer();
        let scores = tokio::task::spawn_blocking(move || worker.score_batch(&texts))
            .await
            .unwrap_or_else(|error| {
                vec![Err(ClassificationError::Failed(format!("scoring task failed: {error}"))); expected]
            });
        timer.observe_duration();

        scores
            .into_iter()
            .chain(std::iter::repeat_with(|| {
                Err(ClassificationError::Failed(
                    "strategy returned fewer scores than inputs".to_string(),
                ))
            }))
            .take(expected)
            .collect()
    }

    async fn persist_one(
        &self,
        strategy: &dyn SentimentStrategy,
        record: CanonicalRecord,
        score: Result<RawScore, ClassificationError>,
        computed_at: DateTime<Utc>,
    ) -> RecordOutcome {
        let raw = match score {
            Ok(raw) => raw,
            Err(error) => {
                self.metrics.classification_failures.inc();
                warn!(
                    sentiment.record_key = %record.record_key,
                    sentiment.strategy = strategy.name(),
                    text = %preview(&record.text, 40),
                    %error,
                    "classification failed"
                );
                // モデル全体の問題はレコードの失敗として記録しない
                if matches!(error, ClassificationError::Failed(_)) {
                    self.mark_failed(&record.record_key, strategy.name()).await;
                }
                return RecordOutcome::Failed;
            }
        };

        let label = self.thresholds.label_for(raw.score);
        let result = ClassificationResult {
            record_key: record.record_key,
            strategy: strategy.name().to_string(),
            score: raw.score,
            confidence: raw.confidence,
            label,
            strategy_version: strategy.version().to_string(),
            computed_at,
        };

        let store = &self.store;
        let saved = &result;
        match self
            .store_call("save_result", move || store.save_result(saved))
            .await
        {
            Ok(()) => {
                self.metrics.records_classified.inc();
                RecordOutcome::Classified(label)
            }
            Err(error) => {
                self.metrics.classification_failures.inc();
                warn!(
                    sentiment.record_key = %result.record_key,
                    sentiment.strategy = %result.strategy,
                    %error,
                    "failed to persist classification result"
                );
                // 再試行を使い切った一時エラーは次回の実行で拾い直す
                if !error.is_transient() {
                    self.mark_failed(&result.record_key, &result.strategy).await;
                }
                RecordOutcome::Failed
            }
        }
    }

    async fn mark_failed(&self, record_key: &str, strategy: &str) {
        let store = &self.store;
        if let Err(error) = self
            .store_call("mark_failed", move || store.mark_failed(record_key, strategy))
            .await
        {
            warn!(
                sentiment.record_key = %record_key,
                sentiment.strategy = strategy,
                %error,
                "failed to mark record as failed"
            );
        }
    }

    /// 一時エラーを指数バックオフで再試行する。
    async fn store_call<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let retry = self.settings.store_retry;
        let mut attempt = 0;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() => {
                    attempt += 1;
                    if !retry.can_retry(attempt) {
                        warn!(
                            operation,
                            attempt,
                            max_attempts = retry.max_attempts,
                            %error,
                            "store call failed after all retries"
                        );
                        return Err(error);
                    }
                    let delay = retry.delay_for_attempt(attempt);
                    self.metrics.retries_total.inc();
                    debug!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn finish(&self, mut summary: RunSummary) -> RunSummary {
        summary.finish(Utc::now());
        if let Some(ms) = summary.duration_ms {
            #[allow(clippy::cast_precision_loss)]
            self.metrics.run_duration.observe(ms as f64 / 1000.0);
        }

        if summary.is_failed() {
            self.metrics.runs_failed.inc();
            warn!(
                sentiment.run_id = %summary.run_id,
                state = ?summary.state,
                error = summary.error.as_deref().unwrap_or_default(),
                "sentiment run failed"
            );
        } else {
            self.metrics.runs_completed.inc();
            info!(
                sentiment.run_id = %summary.run_id,
                sentiment.classified = summary.classified,
                sentiment.failed = summary.failed,
                sentiment.skipped = summary.skipped,
                cancelled = summary.cancelled,
                duration_ms = summary.duration_ms.unwrap_or_default(),
                "sentiment run finished"
            );
        }
        summary
    }
}

#[allow(clippy::cast_precision_loss)]
fn count_f64(value: usize) -> f64 {
    value as f64
}
