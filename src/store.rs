//! 重複排除付きのレコードストア。
//!
//! レコードは識別キーごとに一度だけ保存され（first-write-wins）、分類結果は
//! `(record_key, strategy)` 単位で上書きされる。
pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

pub use error::StoreError;
pub use memory::MemoryRecordStore;
pub use models::{
    BatchCursor, CanonicalRecord, ClassificationResult, ClassificationStatus, EngagementMetrics,
    RecordWithResults, UpsertOutcome,
};
pub use postgres::PgRecordStore;

const MEMORY_DSN: &str = "memory://";

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 同じキーのレコードが無ければ挿入する。既存の行は変更しない。
    async fn upsert_if_absent(&self, record: &CanonicalRecord)
    -> Result<UpsertOutcome, StoreError>;

    /// `strategy` の結果も失敗記録も持たないレコードを `(ingested_at, record_key)` 昇順で返す。
    ///
    /// 読み取り専用。書き込みを挟まずに二度呼べば同じバッチが返る。
    async fn select_unclassified(
        &self,
        strategy: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        self.select_unclassified_after(strategy, None, limit).await
    }

    /// `after` より後ろから続きを返すキーセット版。
    async fn select_unclassified_after(
        &self,
        strategy: &str,
        after: Option<&BatchCursor>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError>;

    /// 結果を `(record_key, strategy)` で upsert し、同じトランザクションでレコードを
    /// `Classified` にして同じストラテジーの失敗記録を消す。レコードが無ければ `Permanent`。
    async fn save_result(&self, result: &ClassificationResult) -> Result<(), StoreError>;

    /// `(record_key, strategy)` の失敗を記録する。以後そのストラテジーでは選択されない。
    ///
    /// 結果を一つも持たないレコードだけ `ClassificationFailed` にする。
    async fn mark_failed(&self, record_key: &str, strategy: &str) -> Result<(), StoreError>;

    async fn get_record(&self, record_key: &str)
    -> Result<Option<RecordWithResults>, StoreError>;

    async fn list_records(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RecordWithResults>, StoreError>;

    async fn record_count(&self) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn close(&self);
}

/// DSN からストアを開く。`memory://` ならプロセス内ストア。
///
/// # Errors
/// 接続もしくはスキーマ適用に失敗した場合。
pub async fn connect(
    dsn: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<Arc<dyn RecordStore>, StoreError> {
    if dsn.starts_with(MEMORY_DSN) {
        return Ok(Arc::new(MemoryRecordStore::new()));
    }
    let store = PgRecordStore::connect(dsn, max_connections, acquire_timeout).await?;
    store.ensure_schema().await?;
    Ok(Arc::new(store))
}
