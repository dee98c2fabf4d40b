use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};
use tracing::{debug, info};

use super::{
    BatchCursor, CanonicalRecord, ClassificationResult, ClassificationStatus, EngagementMetrics,
    RecordStore, RecordWithResults, StoreError, UpsertOutcome,
};

const SCHEMA: &str = include_str!("../../schema/001_sentiment.sql");

const RECORD_COLUMNS: &str = "record_key, source_id, text, author, lang, retweet_count, \
     reply_count, like_count, quote_count, created_at, ingested_at, status";

/// PostgreSQL 実装。
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// # Errors
    /// 接続プールを作れなかった場合。
    pub async fn connect(
        dsn: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(dsn)
            .await?;
        info!(max_connections, "connected to sentiment database");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// テーブルとインデックスが無ければ作成する。
    ///
    /// # Errors
    /// DDL の実行に失敗した場合。
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("sentiment schema ensured");
        Ok(())
    }

    async fn results_for(
        &self,
        record_keys: &[String],
    ) -> Result<HashMap<String, Vec<ClassificationResult>>, StoreError> {
        if record_keys.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r"
            SELECT record_key, strategy, score, confidence, label, strategy_version, computed_at
            FROM classification_results
            WHERE record_key = ANY($1)
            ORDER BY record_key, strategy
            ",
        )
        .bind(record_keys)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<ClassificationResult>> = HashMap::new();
        for row in rows {
            let result = result_from_row(&row)?;
            grouped
                .entry(result.record_key.clone())
                .or_default()
                .push(result);
        }
        Ok(grouped)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_if_absent(
        &self,
        record: &CanonicalRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let result = sqlx::query(
            r"
            INSERT INTO records
                (record_key, source_id, text, author, lang, retweet_count, reply_count,
                 like_count, quote_count, created_at, ingested_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (record_key) DO NOTHING
            ",
        )
        .bind(&record.record_key)
        .bind(&record.source_id)
        .bind(&record.text)
        .bind(&record.author)
        .bind(&record.lang)
        .bind(record.metrics.retweet_count)
        .bind(record.metrics.reply_count)
        .bind(record.metrics.like_count)
        .bind(record.metrics.quote_count)
        .bind(record.created_at)
        .bind(record.ingested_at)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(UpsertOutcome::AlreadyPresent)
        } else {
            Ok(UpsertOutcome::Inserted)
        }
    }

    async fn select_unclassified_after(
        &self,
        strategy: &str,
        after: Option<&BatchCursor>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        let sql = format!(
            r"
            SELECT {RECORD_COLUMNS}
            FROM records r
            WHERE NOT EXISTS (
                  SELECT 1 FROM classification_results c
                  WHERE c.record_key = r.record_key AND c.strategy = $1
              )
              AND NOT EXISTS (
                  SELECT 1 FROM classification_failures f
                  WHERE f.record_key = r.record_key AND f.strategy = $1
              )
              AND ($2::timestamptz IS NULL OR (r.ingested_at, r.record_key) > ($2::timestamptz, $3::text))
            ORDER BY r.ingested_at ASC, r.record_key ASC
            LIMIT $4
            "
        );

        let rows = sqlx::query(&sql)
            .bind(strategy)
            .bind(after.map(|cursor| cursor.ingested_at))
            .bind(after.map(|cursor| cursor.record_key.as_str()))
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn save_result(&self, result: &ClassificationResult) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE records SET status = $2 WHERE record_key = $1")
            .bind(&result.record_key)
            .bind(ClassificationStatus::Classified.as_str())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::Permanent(format!(
                "record {} does not exist",
                result.record_key
            )));
        }

        sqlx::query(
            r"
            INSERT INTO classification_results
                (record_key, strategy, score, confidence, label, strategy_version, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (record_key, strategy) DO UPDATE SET
                score = EXCLUDED.score,
                confidence = EXCLUDED.confidence,
                label = EXCLUDED.label,
                strategy_version = EXCLUDED.strategy_version,
                computed_at = EXCLUDED.computed_at
            ",
        )
        .bind(&result.record_key)
        .bind(&result.strategy)
        .bind(result.score)
        .bind(result.confidence)
        .bind(result.label.as_str())
        .bind(&result.strategy_version)
        .bind(result.computed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM classification_failures WHERE record_key = $1 AND strategy = $2")
            .bind(&result.record_key)
            .bind(&result.strategy)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(&self, record_key: &str, strategy: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r"
            INSERT INTO classification_failures (record_key, strategy)
            SELECT record_key, $2 FROM records WHERE record_key = $1
            ON CONFLICT (record_key, strategy) DO UPDATE SET failed_at = now()
            ",
        )
        .bind(record_key)
        .bind(strategy)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::Permanent(format!(
                "record {record_key} does not exist"
            )));
        }

        sqlx::query(
            r"
            UPDATE records SET status = $2
            WHERE record_key = $1
              AND NOT EXISTS (
                  SELECT 1 FROM classification_results c WHERE c.record_key = $1
              )
            ",
        )
        .bind(record_key)
        .bind(ClassificationStatus::ClassificationFailed.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_record(
        &self,
        record_key: &str,
    ) -> Result<Option<RecordWithResults>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE record_key = $1");
        let Some(row) = sqlx::query(&sql)
            .bind(record_key)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let record = record_from_row(&row)?;
        let mut results = self.results_for(&[record.record_key.clone()]).await?;
        let results = results.remove(&record.record_key).unwrap_or_default();
        Ok(Some(RecordWithResults { record, results }))
    }

    async fn list_records(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RecordWithResults>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records \
             ORDER BY ingested_at ASC, record_key ASC LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query(&sql)
            .bind(to_i64(limit))
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let keys: Vec<String> = records.iter().map(|r| r.record_key.clone()).collect();
        let mut results = self.results_for(&keys).await?;

        Ok(records
            .into_iter()
            .map(|record| {
                let results = results.remove(&record.record_key).unwrap_or_default();
                RecordWithResults { record, results }
            })
            .collect())
    }

    async fn record_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("sentiment database pool closed");
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn record_from_row(row: &PgRow) -> Result<CanonicalRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status.parse().map_err(StoreError::Permanent)?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let ingested_at: DateTime<Utc> = row.try_get("ingested_at")?;

    Ok(CanonicalRecord {
        record_key: row.try_get("record_key")?,
        source_id: row.try_get("source_id")?,
        text: row.try_get("text")?,
        author: row.try_get("author")?,
        lang: row.try_get("lang")?,
        metrics: EngagementMetrics {
            retweet_count: row.try_get("retweet_count")?,
            reply_count: row.try_get("reply_count")?,
            like_count: row.try_get("like_count")?,
            quote_count: row.try_get("quote_count")?,
        },
        created_at,
        ingested_at,
        status,
    })
}

fn result_from_row(row: &PgRow) -> Result<ClassificationResult, StoreError> {
    let label: String = row.try_get("label")?;
    Ok(ClassificationResult {
        record_key: row.try_get("record_key")?,
        strategy: row.try_get("strategy")?,
        score: row.try_get("score")?,
        confidence: row.try_get("confidence")?,
        label: label.parse().map_err(StoreError::Permanent)?,
        strategy_version: row.try_get("strategy_version")?,
        computed_at: row.try_get("computed_at")?,
    })
}
