//! In-memory idempotency store.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use leadflow_common::IdempotencyRecord;

use crate::traits::{IdempotencyStore, PutOutcome};

/// Mutex-guarded map. The whole check-and-set runs under one lock
/// acquisition, so concurrent putters racing on a key serialize and exactly
/// one observes `Accepted`.
pub struct MemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Number of records currently held, live or expired (for test
    /// assertions).
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn put(&self, key: &str, record: IdempotencyRecord) -> Result<PutOutcome> {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        match records.get(key).cloned() {
            Some(existing) if existing.is_live(now) => {
                // Strictly higher confidence replaces; ties keep the
                // incumbent.
                if record.confidence > existing.confidence {
                    records.insert(key.to_string(), record);
                    Ok(PutOutcome::Superseded { prior: existing })
                } else {
                    Ok(PutOutcome::Rejected { holder: existing })
                }
            }
            // Absent or expired: passive expiry happens right here.
            _ => {
                records.insert(key.to_string(), record);
                Ok(PutOutcome::Accepted)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let now = Utc::now();
        let records = self.records.lock().unwrap();
        Ok(records.get(key).filter(|r| r.is_live(now)).cloned())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| r.is_live(now));
        Ok(before - records.len())
    }
}
