//! The engine facade.
//!
//! Producer-facing intake (signals, stage transitions), consumer-facing
//! queries (tier, score, stage status, blocker triage), and the admin
//! surface (kill flag, reopen). All per-entity mutation serializes on an
//! entity-keyed mutex; entities never contend with each other and there is
//! no global lock. Every store consult resolves before an entity lock is
//! taken: ledger entries for blockers and reopens are appended first, so a
//! transition that then fails can at worst orphan an entry no stage record
//! references.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use leadflow_common::scoring;
use leadflow_common::{
    BlockerFilter, BlockerType, EngineConfig, EntityScoreState, LeadFlowError, LedgerEntry,
    RawSignal, SignalReceipt, SignalStatus, StageRecord, StageStatus, StageView, Tier,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::{Aggregator, ScoreState};
use crate::dedup::{DedupDecision, Deduplicator};
use crate::idempotency::MemoryIdempotencyStore;
use crate::ledger::MemoryLedger;
use crate::traits::{with_deadline, BlockerLedger, IdempotencyStore};
use crate::waterfall::{TransitionOutcome, Waterfall};

/// Everything the engine knows about one entity. Guarded by the per-entity
/// mutex in the registry.
#[derive(Default)]
struct EntityState {
    score: ScoreState,
    stages: HashMap<String, StageRecord>,
    kill_flag: bool,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    dedup: Deduplicator,
    aggregator: Aggregator,
    waterfall: Waterfall,
    store: Arc<dyn IdempotencyStore>,
    ledger: Arc<dyn BlockerLedger>,
    entities: RwLock<HashMap<String, Arc<Mutex<EntityState>>>>,
}

impl Engine {
    /// Engine backed by the in-memory reference stores.
    pub fn new(config: EngineConfig) -> Result<Self, LeadFlowError> {
        Self::with_stores(
            config,
            Arc::new(MemoryIdempotencyStore::new()),
            Arc::new(MemoryLedger::new()),
        )
    }

    /// Engine over injected store backends (durable stores in production,
    /// shared in-memory instances in tests).
    pub fn with_stores(
        config: EngineConfig,
        store: Arc<dyn IdempotencyStore>,
        ledger: Arc<dyn BlockerLedger>,
    ) -> Result<Self, LeadFlowError> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            dedup: Deduplicator::new(store.clone(), config.clone()),
            aggregator: Aggregator::new(config.clone()),
            waterfall: Waterfall::new(config.clone()),
            store,
            ledger,
            entities: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn entity(&self, entity_id: &str) -> Arc<Mutex<EntityState>> {
        {
            let entities = self.entities.read().await;
            if let Some(handle) = entities.get(entity_id) {
                return handle.clone();
            }
        }
        let mut entities = self.entities.write().await;
        entities
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(EntityState::default())))
            .clone()
    }

    async fn existing(&self, entity_id: &str) -> Option<Arc<Mutex<EntityState>>> {
        self.entities.read().await.get(entity_id).cloned()
    }

    // -----------------------------------------------------------------------
    // Producer-facing intake
    // -----------------------------------------------------------------------

    /// Submit one signal. Dedup resolves before the entity lock is taken;
    /// score, gate view, and tier are read in the same critical section the
    /// mutation commits in, so the receipt is consistent with the live
    /// signal set.
    pub async fn submit_signal(&self, raw: RawSignal) -> Result<SignalReceipt, LeadFlowError> {
        let received_at = Utc::now();
        let (key, decision) = self.dedup.admit(&raw, received_at).await?;

        let handle = self.entity(&raw.entity_id).await;
        let mut state = handle.lock().await;
        let status = match decision {
            DedupDecision::Apply => {
                self.aggregator
                    .apply(&mut state.score, &key, &raw, received_at);
                SignalStatus::Accepted
            }
            DedupDecision::Replace => {
                // apply() retracts the prior contribution under this key
                // before adding the new one; nothing double-counts.
                self.aggregator
                    .apply(&mut state.score, &key, &raw, received_at);
                SignalStatus::Superseded
            }
            DedupDecision::Duplicate => SignalStatus::Rejected,
        };

        let gate = self.waterfall.gate_view(&state.stages, state.kill_flag);
        let composite_score = state.score.composite_score();
        let tier = scoring::classify(composite_score, gate, self.config.tiers);

        if status == SignalStatus::Rejected {
            debug!(entity_id = %raw.entity_id, %key, "duplicate signal, score unchanged");
        } else {
            info!(
                entity_id = %raw.entity_id,
                signal_type = %raw.signal_type,
                %status,
                composite_score,
                %tier,
                "signal applied"
            );
        }

        Ok(SignalReceipt {
            status,
            composite_score,
            tier,
        })
    }

    /// Start a stage under a processing context. Ordering-checked.
    pub async fn begin_stage(
        &self,
        entity_id: &str,
        stage: &str,
        context: Uuid,
    ) -> Result<TransitionOutcome, LeadFlowError> {
        let handle = self.entity(entity_id).await;
        let mut state = handle.lock().await;
        let outcome = self.waterfall.begin(&mut state.stages, stage, context)?;
        self.log_transition(entity_id, stage, outcome);
        Ok(outcome)
    }

    /// Mark a stage done under a processing context. Ordering-checked.
    pub async fn complete_stage(
        &self,
        entity_id: &str,
        stage: &str,
        context: Uuid,
    ) -> Result<TransitionOutcome, LeadFlowError> {
        let handle = self.entity(entity_id).await;
        let mut state = handle.lock().await;
        let outcome = self
            .waterfall
            .complete(&mut state.stages, stage, context, Utc::now())?;
        self.log_transition(entity_id, stage, outcome);
        Ok(outcome)
    }

    /// Freeze a stage. The ledger entry is durably appended before the
    /// entity lock is taken, so a blocked stage without its entry is
    /// impossible; if the transition then fails, the entry is orphaned and
    /// no stage record ever references it.
    pub async fn block_stage(
        &self,
        entity_id: &str,
        stage: &str,
        context: Uuid,
        blocker_type: BlockerType,
        detail: &str,
        retry_allowed: bool,
    ) -> Result<Uuid, LeadFlowError> {
        // Input errors are never persisted; reject before anything lands on
        // the ledger.
        if self.config.stage_index(stage).is_none() {
            return Err(LeadFlowError::UnknownStage(stage.to_string()));
        }
        let entry = LedgerEntry::new(entity_id, stage, blocker_type, detail, retry_allowed);
        let entry_id = entry.id;

        with_deadline(
            "ledger_append",
            self.config.store_timeout_ms,
            self.ledger.append(entry),
        )
        .await?;

        let handle = self.entity(entity_id).await;
        let mut state = handle.lock().await;
        self.waterfall
            .block(&mut state.stages, stage, context, entry_id)?;

        warn!(
            entity_id,
            stage,
            %blocker_type,
            retry_allowed,
            "stage blocked"
        );
        Ok(entry_id)
    }

    /// Remediate a blocked stage under the same context. Only legal when
    /// the active blocker allows retry.
    pub async fn resume_stage(
        &self,
        entity_id: &str,
        stage: &str,
        context: Uuid,
    ) -> Result<TransitionOutcome, LeadFlowError> {
        if self.config.stage_index(stage).is_none() {
            return Err(LeadFlowError::UnknownStage(stage.to_string()));
        }
        let handle = self.entity(entity_id).await;

        let blocker_id = {
            let state = handle.lock().await;
            state
                .stages
                .get(stage)
                .and_then(|r| r.blocker)
                .ok_or_else(|| LeadFlowError::IllegalTransition {
                    stage: stage.to_string(),
                    reason: "no active blocker".into(),
                })?
        };

        // Ledger consult runs with no lock held; re-verify afterwards.
        let entries = with_deadline(
            "ledger_get",
            self.config.store_timeout_ms,
            self.ledger.get(&[blocker_id]),
        )
        .await?;
        let retry_allowed = entries.first().map(|e| e.retry_allowed).unwrap_or(false);

        let mut state = handle.lock().await;
        if state.stages.get(stage).and_then(|r| r.blocker) != Some(blocker_id) {
            return Err(LeadFlowError::IllegalTransition {
                stage: stage.to_string(),
                reason: "stage state changed during remediation check".into(),
            });
        }
        let outcome = self
            .waterfall
            .resume(&mut state.stages, stage, context, retry_allowed)?;
        info!(entity_id, stage, "blocked stage resumed under its context");
        Ok(outcome)
    }

    /// Abandon a blocked context and restart the stage fresh under a new
    /// one. The stage returns to NotStarted; ordering applies again on the
    /// next begin.
    pub async fn restart_stage(
        &self,
        entity_id: &str,
        stage: &str,
        new_context: Uuid,
    ) -> Result<TransitionOutcome, LeadFlowError> {
        let handle = self.entity(entity_id).await;
        let mut state = handle.lock().await;
        let outcome = self
            .waterfall
            .restart(&mut state.stages, stage, new_context)?;
        info!(entity_id, stage, %new_context, "blocked stage restarted under a new context");
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Admin surface
    // -----------------------------------------------------------------------

    /// Administrative regression of a Done stage. The documenting ledger
    /// entry is appended before the entity lock is taken; a reopen that then
    /// fails leaves the entry orphaned. Returns the entry id.
    pub async fn reopen_stage(
        &self,
        entity_id: &str,
        stage: &str,
        reason: &str,
    ) -> Result<Uuid, LeadFlowError> {
        if self.config.stage_index(stage).is_none() {
            return Err(LeadFlowError::UnknownStage(stage.to_string()));
        }
        let entry = LedgerEntry::new(entity_id, stage, BlockerType::AdminOverride, reason, true);
        let entry_id = entry.id;

        with_deadline(
            "ledger_append",
            self.config.store_timeout_ms,
            self.ledger.append(entry),
        )
        .await?;

        let handle = self.entity(entity_id).await;
        let mut state = handle.lock().await;
        self.waterfall.reopen(&mut state.stages, stage)?;

        warn!(entity_id, stage, reason, "done stage reopened by administrative override");
        Ok(entry_id)
    }

    /// Flip the entity's kill flag. While set, the classifier returns
    /// `Ineligible` no matter the score.
    pub async fn set_kill_flag(&self, entity_id: &str, on: bool) {
        let handle = self.entity(entity_id).await;
        let mut state = handle.lock().await;
        state.kill_flag = on;
        warn!(entity_id, on, "kill flag changed");
    }

    /// Storage hygiene: drop expired idempotency records. Never required
    /// for correctness.
    pub async fn purge_expired(&self) -> Result<usize, LeadFlowError> {
        with_deadline(
            "idempotency_purge",
            self.config.store_timeout_ms,
            self.store.purge_expired(),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Consumer-facing queries
    // -----------------------------------------------------------------------

    pub async fn get_tier(&self, entity_id: &str) -> Tier {
        match self.existing(entity_id).await {
            Some(handle) => {
                let state = handle.lock().await;
                let gate = self.waterfall.gate_view(&state.stages, state.kill_flag);
                scoring::classify(state.score.composite_score(), gate, self.config.tiers)
            }
            None => scoring::classify(0.0, Default::default(), self.config.tiers),
        }
    }

    pub async fn get_score(&self, entity_id: &str) -> EntityScoreState {
        match self.existing(entity_id).await {
            Some(handle) => {
                let state = handle.lock().await;
                self.aggregator.snapshot(entity_id, &state.score)
            }
            None => EntityScoreState::empty(entity_id),
        }
    }

    /// Stage status plus the active blocker's full entry when frozen.
    pub async fn get_stage_status(
        &self,
        entity_id: &str,
        stage: &str,
    ) -> Result<StageView, LeadFlowError> {
        if self.config.stage_index(stage).is_none() {
            return Err(LeadFlowError::UnknownStage(stage.to_string()));
        }
        let (status, blocker_id) = match self.existing(entity_id).await {
            Some(handle) => {
                let state = handle.lock().await;
                match state.stages.get(stage) {
                    Some(record) => (record.status, record.blocker),
                    None => (StageStatus::NotStarted, None),
                }
            }
            None => (StageStatus::NotStarted, None),
        };
        let blocker = match blocker_id {
            Some(id) => with_deadline(
                "ledger_get",
                self.config.store_timeout_ms,
                self.ledger.get(&[id]),
            )
            .await?
            .into_iter()
            .next(),
            None => None,
        };
        Ok(StageView { status, blocker })
    }

    /// Ledger entries still referenced by a Blocked stage, filtered.
    pub async fn list_unresolved_blockers(
        &self,
        filter: &BlockerFilter,
    ) -> Result<Vec<LedgerEntry>, LeadFlowError> {
        let handles: Vec<Arc<Mutex<EntityState>>> =
            self.entities.read().await.values().cloned().collect();
        let mut active_ids = Vec::new();
        for handle in handles {
            let state = handle.lock().await;
            active_ids.extend(state.stages.values().filter_map(|r| r.blocker));
        }
        let entries = with_deadline(
            "ledger_get",
            self.config.store_timeout_ms,
            self.ledger.get(&active_ids),
        )
        .await?;
        Ok(entries.into_iter().filter(|e| filter.matches(e)).collect())
    }

    /// Whether the entity carries any unresolved non-retryable blocker on a
    /// blocking stage.
    pub async fn has_blocking_error(&self, entity_id: &str) -> Result<bool, LeadFlowError> {
        let active_ids = match self.existing(entity_id).await {
            Some(handle) => {
                let state = handle.lock().await;
                state
                    .stages
                    .iter()
                    .filter(|(name, record)| {
                        record.status == StageStatus::Blocked
                            && self.config.stage(name).is_some_and(|s| s.blocking)
                    })
                    .filter_map(|(_, record)| record.blocker)
                    .collect::<Vec<_>>()
            }
            None => Vec::new(),
        };
        if active_ids.is_empty() {
            return Ok(false);
        }
        let entries = with_deadline(
            "ledger_get",
            self.config.store_timeout_ms,
            self.ledger.get(&active_ids),
        )
        .await?;
        Ok(entries.iter().any(|e| !e.retry_allowed))
    }

    fn log_transition(&self, entity_id: &str, stage: &str, outcome: TransitionOutcome) {
        match outcome {
            TransitionOutcome::Applied(status) => {
                info!(entity_id, stage, %status, "stage transition");
            }
            TransitionOutcome::UpstreamNotReady => {
                debug!(entity_id, stage, "upstream not ready");
            }
        }
    }
}
