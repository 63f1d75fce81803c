//! Signal intake: validation, canonical dedup keys, idempotency consult.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use leadflow_common::{EngineConfig, IdempotencyRecord, LeadFlowError, RawSignal, SignalType};
use tracing::debug;

use crate::traits::{with_deadline, IdempotencyStore, PutOutcome};

/// Canonical fingerprint identifying duplicate facts across producers and
/// time. Identity is `entity_id:signal_type:natural_key` with the natural
/// key trimmed and lowercased, so the same fact hashes identically no
/// matter which producer reports it.
pub fn dedup_key(entity_id: &str, signal_type: SignalType, natural_key: &str) -> String {
    let natural = natural_key.trim().to_lowercase();
    format!("{entity_id}:{signal_type}:{natural}")
}

/// What the aggregator should do with an admitted signal.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupDecision {
    /// First live observation: apply the contribution.
    Apply,
    /// Higher-confidence observation replaced a prior one: retract the
    /// prior contribution, then apply.
    Replace,
    /// Already known. No-op downstream.
    Duplicate,
}

/// Gate between producers and the aggregator. Owns no entity state; its
/// only dependency is the idempotency store.
pub struct Deduplicator {
    store: Arc<dyn IdempotencyStore>,
    config: Arc<EngineConfig>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Reject malformed submissions before anything touches a store.
    pub fn validate(raw: &RawSignal) -> Result<(), LeadFlowError> {
        if raw.entity_id.trim().is_empty() {
            return Err(LeadFlowError::InvalidSignal("entity_id is empty".into()));
        }
        if raw.source.trim().is_empty() {
            return Err(LeadFlowError::InvalidSignal("source is empty".into()));
        }
        if raw.natural_key.trim().is_empty() {
            return Err(LeadFlowError::InvalidSignal("natural_key is empty".into()));
        }
        if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
            return Err(LeadFlowError::InvalidSignal(format!(
                "confidence {} outside 0.0-1.0",
                raw.confidence
            )));
        }
        if !raw.impact.is_finite() {
            return Err(LeadFlowError::InvalidSignal("impact is not finite".into()));
        }
        Ok(())
    }

    /// Validate, fingerprint, and consult the idempotency store. Returns the
    /// dedup key and the verdict. Runs entirely before any entity lock is
    /// taken.
    pub async fn admit(
        &self,
        raw: &RawSignal,
        received_at: DateTime<Utc>,
    ) -> Result<(String, DedupDecision), LeadFlowError> {
        Self::validate(raw)?;

        let key = dedup_key(&raw.entity_id, raw.signal_type, &raw.natural_key);
        let ttl = Duration::days(self.config.signal(raw.signal_type).ttl_days);
        let record = IdempotencyRecord {
            source: raw.source.clone(),
            confidence: raw.confidence,
            stored_at: received_at,
            expires_at: received_at + ttl,
        };

        let outcome = with_deadline(
            "idempotency_put",
            self.config.store_timeout_ms,
            self.store.put(&key, record),
        )
        .await?;

        let decision = match outcome {
            PutOutcome::Accepted => DedupDecision::Apply,
            PutOutcome::Superseded { prior } => {
                debug!(
                    %key,
                    prior_source = %prior.source,
                    prior_confidence = prior.confidence,
                    new_source = %raw.source,
                    new_confidence = raw.confidence,
                    "signal superseded prior observation"
                );
                DedupDecision::Replace
            }
            PutOutcome::Rejected { holder } => {
                // Expected steady-state traffic, not an error.
                debug!(
                    %key,
                    holder_source = %holder.source,
                    holder_confidence = holder.confidence,
                    "duplicate signal rejected"
                );
                DedupDecision::Duplicate
            }
        };

        Ok((key, decision))
    }
}
