//! プロセス内ストア。テストと `memory://` DSN で使う。
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    BatchCursor, CanonicalRecord, ClassificationResult, ClassificationStatus, RecordStore,
    RecordWithResults, StoreError, UpsertOutcome,
};

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<String, CanonicalRecord>,
    /// record_key -> strategy -> result
    results: HashMap<String, BTreeMap<String, ClassificationResult>>,
    failures: HashSet<(String, String)>,
}

impl Tables {
    fn view(&self, record: &CanonicalRecord) -> RecordWithResults {
        let results = self
            .results
            .get(&record.record_key)
            .map(|by_strategy| by_strategy.values().cloned().collect())
            .unwrap_or_default();
        RecordWithResults {
            record: record.clone(),
            results,
        }
    }

    fn has_failed(&self, record_key: &str, strategy: &str) -> bool {
        self.failures
            .contains(&(record_key.to_owned(), strategy.to_owned()))
    }

    fn ordered_records(&self) -> Vec<&CanonicalRecord> {
        let mut records: Vec<&CanonicalRecord> = self.records.values().collect();
        records.sort_by(|a, b| {
            a.ingested_at
                .cmp(&b.ingested_at)
                .then_with(|| a.record_key.cmp(&b.record_key))
        });
        records
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<Tables>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Permanent("memory store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_if_absent(
        &self,
        record: &CanonicalRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tables = self.lock()?;
        if tables.records.contains_key(&record.record_key) {
            return Ok(UpsertOutcome::AlreadyPresent);
        }
        tables
            .records
            .insert(record.record_key.clone(), record.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn select_unclassified_after(
        &self,
        strategy: &str,
        after: Option<&BatchCursor>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .ordered_records()
            .into_iter()
            .filter(|record| !tables.has_failed(&record.record_key, strategy))
            .filter(|record| {
                !tables
                    .results
                    .get(&record.record_key)
                    .is_some_and(|by_strategy| by_strategy.contains_key(strategy))
            })
            .filter(|record| after.is_none_or(|cursor| cursor.precedes(record)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_result(&self, result: &ClassificationResult) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let Some(record) = tables.records.get_mut(&result.record_key) else {
            return Err(StoreError::Permanent(format!(
                "record {} does not exist",
                result.record_key
            )));
        };
        record.status = ClassificationStatus::Classified;
        tables
            .failures
            .remove(&(result.record_key.clone(), result.strategy.clone()));
        tables
            .results
            .entry(result.record_key.clone())
            .or_default()
            .insert(result.strategy.clone(), result.clone());
        Ok(())
    }

    async fn mark_failed(&self, record_key: &str, strategy: &str) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let has_results = tables
            .results
            .get(record_key)
            .is_some_and(|by_strategy| !by_strategy.is_empty());
        let record = tables.records.get_mut(record_key).ok_or_else(|| {
            StoreError::Permanent(format!("record {record_key} does not exist"))
        })?;
        if !has_results {
            record.status = ClassificationStatus::ClassificationFailed;
        }
        tables
            .failures
            .insert((record_key.to_string(), strategy.to_string()));
        Ok(())
    }

    async fn get_record(
        &self,
        record_key: &str,
    ) -> Result<Option<RecordWithResults>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .records
            .get(record_key)
            .map(|record| tables.view(record)))
    }

    async fn list_records(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RecordWithResults>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .ordered_records()
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|record| tables.view(record))
            .collect())
    }

    async fn record_count(&self) -> Result<u64, StoreError> {
        let tables = self.lock()?;
        Ok(u64::try_from(tables.records.len()).unwrap_or(u64::MAX))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn close(&self) {}
}
