//! Store contracts for the engine.
//!
//! The engine is written against these traits; the in-memory reference
//! implementations back them for tests and single-process deployments, and
//! durable backends swap in without touching engine logic.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use leadflow_common::{BlockerType, IdempotencyRecord, LedgerEntry, LeadFlowError};
use uuid::Uuid;

/// Outcome of an atomic idempotency put.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    /// No live record existed; this one was created.
    Accepted,
    /// A live record with strictly lower confidence was replaced. The
    /// caller must retract the prior record's downstream effects before
    /// applying the new ones.
    Superseded { prior: IdempotencyRecord },
    /// A live record already holds the key. No-op.
    Rejected { holder: IdempotencyRecord },
}

/// Durable key -> record map with time-to-live semantics.
///
/// `put` is atomic check-and-set: under concurrent callers racing on the
/// same key, exactly one observes `Accepted`; the rest observe `Superseded`
/// or `Rejected` deterministically from the confidence comparison. Expiry
/// is passive (checked on read); `purge_expired` exists for storage hygiene
/// only and correctness never depends on it running.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn put(&self, key: &str, record: IdempotencyRecord) -> Result<PutOutcome>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Drop expired records. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

/// Append-only record of stage blockers.
///
/// Entries are never updated or deleted. "Unresolved" is not a ledger
/// concept: resolution lives on stage records, which stop referencing an
/// entry once its stage moves on.
#[async_trait]
pub trait BlockerLedger: Send + Sync {
    async fn append(&self, entry: LedgerEntry) -> Result<()>;

    /// Fetch specific entries by id (the active blockers on stage records).
    async fn get(&self, ids: &[Uuid]) -> Result<Vec<LedgerEntry>>;

    /// All entries ever recorded for an entity, oldest first.
    async fn for_entity(&self, entity_id: &str) -> Result<Vec<LedgerEntry>>;

    /// All entries of one blocker type across entities, oldest first.
    /// Operational triage: "show me every ambiguous match in the system".
    async fn by_type(&self, blocker_type: BlockerType) -> Result<Vec<LedgerEntry>>;
}

// ---------------------------------------------------------------------------
// Arc blankets, so the engine and tests can share one store instance
// ---------------------------------------------------------------------------

#[async_trait]
impl<S: IdempotencyStore + ?Sized> IdempotencyStore for Arc<S> {
    async fn put(&self, key: &str, record: IdempotencyRecord) -> Result<PutOutcome> {
        (**self).put(key, record).await
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        (**self).get(key).await
    }

    async fn purge_expired(&self) -> Result<usize> {
        (**self).purge_expired().await
    }
}

#[async_trait]
impl<L: BlockerLedger + ?Sized> BlockerLedger for Arc<L> {
    async fn append(&self, entry: LedgerEntry) -> Result<()> {
        (**self).append(entry).await
    }

    async fn get(&self, ids: &[Uuid]) -> Result<Vec<LedgerEntry>> {
        (**self).get(ids).await
    }

    async fn for_entity(&self, entity_id: &str) -> Result<Vec<LedgerEntry>> {
        (**self).for_entity(entity_id).await
    }

    async fn by_type(&self, blocker_type: BlockerType) -> Result<Vec<LedgerEntry>> {
        (**self).by_type(blocker_type).await
    }
}

/// Run a store call under the configured deadline. An elapsed deadline
/// surfaces as a retryable timeout; the caller is responsible for backoff
/// and re-submission.
pub(crate) async fn with_deadline<T>(
    operation: &'static str,
    timeout_ms: u64,
    fut: impl Future<Output = Result<T>>,
) -> std::result::Result<T, LeadFlowError> {
    match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result.map_err(LeadFlowError::Anyhow),
        Err(_) => Err(LeadFlowError::StoreTimeout {
            operation,
            timeout_ms,
        }),
    }
}
