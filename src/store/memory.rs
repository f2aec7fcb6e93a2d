//! In-process idempotency store.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::IdempotencyStore;
use crate::error::Result;
use crate::model::{Admission, IdempotencyRecord};

/// Idempotency store backed by a mutex-guarded map. Used by tests and by the
/// CLI when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.records.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Every record, sorted by key.
    pub fn records(&self) -> Vec<IdempotencyRecord> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<Admission> {
        match self.records.lock().entry(record.key.clone()) {
            Entry::Occupied(_) => Ok(Admission::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(Admission::Admitted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    #[tokio::test]
    async fn second_insert_is_rejected_and_record_kept() {
        let store = MemoryIdempotencyStore::new();
        let first = IdempotencyRecord::new("job-42", Utc::now());
        let second = IdempotencyRecord::new("job-42", Utc::now());

        assert_eq!(
            store.insert_if_absent(&first).await.unwrap(),
            Admission::Admitted
        );
        assert_eq!(
            store.insert_if_absent(&second).await.unwrap(),
            Admission::AlreadyExists
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("job-42").unwrap().admitted_at, first.admitted_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_admit_exactly_one() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .insert_if_absent(&IdempotencyRecord::new("shared", Utc::now()))
                    .await
                    .unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() == Admission::Admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(store.len(), 1);
    }
}
