//! In-memory blocker ledger.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use leadflow_common::{BlockerType, LedgerEntry};
use uuid::Uuid;

use crate::traits::BlockerLedger;

/// Append-only Vec behind a mutex. Entries go in and never change.
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Every entry ever appended, in order (for test assertions).
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockerLedger for MemoryLedger {
    async fn append(&self, entry: LedgerEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    async fn get(&self, ids: &[Uuid]) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|e| ids.contains(&e.id))
            .cloned()
            .collect())
    }

    async fn for_entity(&self, entity_id: &str) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn by_type(&self, blocker_type: BlockerType) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|e| e.blocker_type == blocker_type)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(entity: &str, stage: &str, blocker_type: BlockerType) -> LedgerEntry {
        LedgerEntry::new(entity, stage, blocker_type, "detail", false)
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let ledger = MemoryLedger::new();
        ledger
            .append(entry("e1", "targeting", BlockerType::NoCandidate))
            .await
            .unwrap();
        ledger
            .append(entry("e1", "people-fill", BlockerType::AmbiguousMatch))
            .await
            .unwrap();

        let all = ledger.for_entity("e1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].stage, "targeting");
        assert_eq!(all[1].stage, "people-fill");
    }

    #[tokio::test]
    async fn by_type_spans_entities() {
        let ledger = MemoryLedger::new();
        ledger
            .append(entry("e1", "targeting", BlockerType::ProviderError))
            .await
            .unwrap();
        ledger
            .append(entry("e2", "targeting", BlockerType::ProviderError))
            .await
            .unwrap();
        ledger
            .append(entry("e3", "targeting", BlockerType::NoCandidate))
            .await
            .unwrap();

        let errors = ledger.by_type(BlockerType::ProviderError).await.unwrap();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn get_fetches_by_id() {
        let ledger = MemoryLedger::new();
        let wanted = entry("e1", "targeting", BlockerType::NoCandidate);
        let id = wanted.id;
        ledger.append(wanted).await.unwrap();
        ledger
            .append(entry("e1", "targeting", BlockerType::ProviderError))
            .await
            .unwrap();

        let found = ledger.get(&[id]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert!(ledger.get(&[Uuid::new_v4()]).await.unwrap().is_empty());
    }
}
