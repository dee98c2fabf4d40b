use std::{collections::VecDeque, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use tokio::{
    net::TcpListener,
    sync::{Mutex, OwnedMutexGuard},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    api,
    classification::StrategyRegistry,
    config::Config,
    observability::Telemetry,
    pipeline::{OrchestratorSettings, PipelineOrchestrator, RunRequest, RunSummary},
    source::{SourceQuery, build_source},
    store::{self, RecordStore},
};

/// 保持する直近の実行集計の件数。
const RECENT_RUNS: usize = 20;

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
    shutdown: CancellationToken,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    store: Arc<dyn RecordStore>,
    pipeline: Arc<PipelineOrchestrator>,
    run_lock: Arc<Mutex<()>>,
    recent_runs: std::sync::Mutex<VecDeque<RunSummary>>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry, shutdown: CancellationToken) -> Self {
        Self {
            registry: Arc::new(registry),
            shutdown,
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn config(&self) -> &Config {
        &self.registry.config
    }

    pub(crate) fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.registry.store)
    }

    pub(crate) fn pipeline(&self) -> Arc<PipelineOrchestrator> {
        Arc::clone(&self.registry.pipeline)
    }

    pub(crate) fn registry(&self) -> Arc<ComponentRegistry> {
        Arc::clone(&self.registry)
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl ComponentRegistry {
    /// 構成情報と依存をまとめて初期化し、アプリケーションの共有レジストリを構築する。
    ///
    /// # Errors
    /// Telemetry の初期化、ソース構築、ストア接続のいずれかが失敗した場合はエラーを返す。
    pub async fn build(config: Config) -> Result<Self> {
        let telemetry = Telemetry::new(config.otel_exporter_endpoint(), config.otel_sampling_ratio())
            .context("failed to initialize telemetry")?;
        Self::build_with_telemetry(config, telemetry).await
    }

    /// 初期化済みの [`Telemetry`] を使って構築する。
    ///
    /// # Errors
    /// [`ComponentRegistry::build`] と同じ。
    pub async fn build_with_telemetry(config: Config, telemetry: Telemetry) -> Result<Self> {
        let config = Arc::new(config);
        let source = build_source(config.source(), config.fetch_timeout())
            .context("failed to build ingestion source")?;
        let strategies = Arc::new(
            StrategyRegistry::load(
                config.fallback_policy(),
                config.model_weights_path(),
                config.model_load_timeout(),
            )
            .await,
        );

        let store = store::connect(
            config.db_dsn(),
            config.db_max_connections(),
            config.db_acquire_timeout(),
        )
        .await
        .context("failed to open record store")?;

        let pipeline = PipelineOrchestrator::builder()
            .with_store(Arc::clone(&store))
            .with_source(source)
            .with_strategies(strategies)
            .with_thresholds(config.thresholds())
            .with_settings(OrchestratorSettings::from_config(&config))
            .with_metrics(Arc::clone(telemetry.metrics()))
            .build();
        let pipeline = match pipeline {
            Ok(pipeline) => Arc::new(pipeline),
            Err(error) => {
                store.close().await;
                return Err(error).context("failed to build pipeline");
            }
        };

        info!(
            strategies = ?pipeline.strategies().names(),
            fallback = ?config.fallback_policy(),
            "component registry ready"
        );

        Ok(Self {
            config,
            telemetry,
            store,
            pipeline,
            run_lock: Arc::new(Mutex::new(())),
            recent_runs: std::sync::Mutex::new(VecDeque::with_capacity(RECENT_RUNS)),
        })
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    #[must_use]
    pub fn pipeline(&self) -> &PipelineOrchestrator {
        &self.pipeline
    }

    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// 設定値から組み立てた実行要求。
    #[must_use]
    pub fn default_request(&self, classify_only: bool) -> RunRequest {
        if classify_only {
            RunRequest::classify_only(self.config.strategy())
        } else {
            RunRequest::ingest(
                SourceQuery::new(self.config.query(), self.config.max_items().get()),
                self.config.strategy(),
            )
        }
    }

    /// 実行権を取得する。既に実行中なら `None`。
    ///
    /// 返したガードを保持している間は他の実行が始まらない。
    #[must_use]
    pub fn try_begin_run(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.run_lock).try_lock_owned().ok()
    }

    /// 取得済みの実行権を保持したまま実行し、集計を記録する。
    pub async fn execute_with(
        &self,
        permit: OwnedMutexGuard<()>,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let summary = self.pipeline.execute(request, cancel).await;
        self.remember(&summary);
        drop(permit);
        summary
    }

    /// 同時に 1 本だけ実行する。既に実行中なら `None`。
    pub async fn try_execute(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Option<RunSummary> {
        let permit = self.try_begin_run()?;
        Some(self.execute_with(permit, request, cancel).await)
    }

    /// 直近の実行集計を新しい順に返す。
    #[must_use]
    pub fn recent_runs(&self) -> Vec<RunSummary> {
        match self.recent_runs.lock() {
            Ok(runs) => runs.iter().rev().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn remember(&self, summary: &RunSummary) {
        if let Ok(mut runs) = self.recent_runs.lock() {
            if runs.len() == RECENT_RUNS {
                runs.pop_front();
            }
            runs.push_back(summary.clone());
        }
    }

    /// ストアを閉じる。
    pub async fn close(&self) {
        self.store.close().await;
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    api::router(state)
}

/// 1 回だけ実行して集計を返す。ストアはどの経路でも閉じる。
///
/// Ctrl-C を受け取るとバッチの境目で中断する。
///
/// # Errors
/// コンポーネントの構築に失敗した場合。実行自体の失敗は集計で表す。
pub async fn run_once(config: Config, classify_only: bool) -> Result<RunSummary> {
    let registry = ComponentRegistry::build(config).await?;
    let request = registry.default_request(classify_only);

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling after the current batch");
            signal_token.cancel();
        }
    });

    let summary = registry.pipeline().execute(&request, &cancel).await;
    signal_task.abort();
    registry.close().await;
    Ok(summary)
}

/// HTTP コントロールプレーンを起動し、シグナルを受けるまで待つ。
///
/// # Errors
/// 構築・バインド・サーバー実行のいずれかが失敗した場合。
pub async fn serve(config: Config) -> Result<()> {
    let bind_addr = config.http_bind();
    let registry = ComponentRegistry::build(config).await?;
    let shutdown = CancellationToken::new();
    let state = AppState::new(registry, shutdown.clone());
    let registry = state.registry();

    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            registry.close().await;
            return Err(error).with_context(|| format!("failed to bind listener on {bind_addr}"));
        }
    };
    info!(%bind_addr, "listening");

    let signal_token = shutdown.clone();
    let result = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
            signal_token.cancel();
        })
        .await;

    registry.close().await;
    result.context("server exited with error")
}
