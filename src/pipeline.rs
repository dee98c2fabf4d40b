//! 取り込みから分類までのパイプライン。
//!
//! fetch → normalize → store → select → classify → persist の順に進み、
//! レコード単位の失敗は集計するだけで実行全体は止めない。
pub mod normalize;
pub mod orchestrator;
pub mod summary;

pub use normalize::{NormalizationError, normalize};
pub use orchestrator::{OrchestratorSettings, PipelineBuilder, PipelineOrchestrator, RunRequest};
pub use summary::{LabelCounts, RunStage, RunState, RunSummary};
