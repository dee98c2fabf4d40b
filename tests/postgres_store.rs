//! PostgreSQL ストアの統合テスト。`DATABASE_URL` が無ければ何もしない。

use std::time::Duration;

use chrono::{TimeZone, Utc};
use sqlx::Executor;

use sentiment_worker::{
    classification::SentimentLabel,
    store::{
        BatchCursor, CanonicalRecord, ClassificationResult, ClassificationStatus,
        EngagementMetrics, PgRecordStore, RecordStore, StoreError, UpsertOutcome,
    },
};

async fn setup_store() -> Option<PgRecordStore> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let store = PgRecordStore::connect(&database_url, 2, Duration::from_secs(10))
        .await
        .expect("database connection");
    store
        .pool()
        .execute(
            "DROP TABLE IF EXISTS classification_failures; \
             DROP TABLE IF EXISTS classification_results; \
             DROP TABLE IF EXISTS records;",
        )
        .await
        .expect("reset tables");
    store.ensure_schema().await.expect("apply schema");
    Some(store)
}

fn record(key: &str, offset_secs: i64, text: &str) -> CanonicalRecord {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        + chrono::Duration::seconds(offset_secs);
    CanonicalRecord {
        record_key: key.to_string(),
        source_id: Some(key.trim_start_matches("src:").to_string()),
        text: text.to_string(),
        author: Some("alice".to_string()),
        lang: Some("en".to_string()),
        metrics: EngagementMetrics {
            retweet_count: Some(1),
            reply_count: None,
            like_count: Some(10),
            quote_count: None,
        },
        created_at: at,
        ingested_at: at,
        status: ClassificationStatus::Unclassified,
    }
}

fn result(key: &str, score: f64, label: SentimentLabel) -> ClassificationResult {
    ClassificationResult {
        record_key: key.to_string(),
        strategy: "lexicon".to_string(),
        score,
        confidence: score.abs(),
        label,
        strategy_version: "lexicon-v1".to_string(),
        computed_at: Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
    }
}

// 同じデータベースを共有するので 1 本のテストで順に検証する
#[tokio::test]
async fn postgres_store_round_trip() -> anyhow::Result<()> {
    let Some(store) = setup_store().await else {
        return Ok(());
    };

    // first-write-wins
    assert_eq!(
        store.upsert_if_absent(&record("src:1", 0, "first")).await?,
        UpsertOutcome::Inserted
    );
    assert_eq!(
        store.upsert_if_absent(&record("src:1", 5, "changed")).await?,
        UpsertOutcome::AlreadyPresent
    );
    store.upsert_if_absent(&record("src:2", 1, "second")).await?;
    store.upsert_if_absent(&record("src:3", 2, "third")).await?;
    assert_eq!(store.record_count().await?, 3);

    let stored = store.get_record("src:1").await?.expect("record exists");
    assert_eq!(stored.record.text, "first");
    assert_eq!(stored.record.metrics.like_count, Some(10));

    // 読み取り専用・順序付きの選択
    let first = store.select_unclassified("lexicon", 10).await?;
    let second = store.select_unclassified("lexicon", 10).await?;
    assert_eq!(first, second);
    let keys: Vec<&str> = first.iter().map(|r| r.record_key.as_str()).collect();
    assert_eq!(keys, ["src:1", "src:2", "src:3"]);

    // キーセットページング
    let cursor = BatchCursor::from_record(&first[0]);
    let rest = store
        .select_unclassified_after("lexicon", Some(&cursor), 10)
        .await?;
    assert_eq!(rest.len(), 2);

    // upsert の安定性
    let saved = result("src:1", 0.67, SentimentLabel::Positive);
    store.save_result(&saved).await?;
    store.save_result(&saved).await?;
    let view = store.get_record("src:1").await?.expect("record exists");
    assert_eq!(view.results, vec![saved]);
    assert_eq!(view.record.status, ClassificationStatus::Classified);

    // 失敗はストラテジー単位で記録される
    store.mark_failed("src:2", "lexicon").await?;
    let pending = store.select_unclassified("lexicon", 10).await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].record_key, "src:3");
    let model_pending = store.select_unclassified("model", 10).await?;
    assert_eq!(model_pending.len(), 3);
    let failed = store.get_record("src:2").await?.expect("record exists");
    assert_eq!(failed.record.status, ClassificationStatus::ClassificationFailed);

    // 結果を持つレコードの状態は上書きしない
    store.mark_failed("src:1", "model").await?;
    let scored = store.get_record("src:1").await?.expect("record exists");
    assert_eq!(scored.record.status, ClassificationStatus::Classified);

    // 存在しないレコードへの保存は恒久エラー
    let missing = store
        .save_result(&result("src:404", 0.1, SentimentLabel::Positive))
        .await;
    assert!(matches!(missing, Err(StoreError::Permanent(_))));

    let page = store.list_records(2, 1).await?;
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].record.record_key, "src:2");

    store.ping().await?;
    store.close().await;
    Ok(())
}
