//! The waterfall gate state machine.
//!
//! Per (entity, stage): NotStarted -> InProgress -> {Done, Blocked}. A stage
//! may leave NotStarted only once its nearest upstream blocking stage is
//! Done. Blocked is terminal for the current processing context: progress
//! resumes either by remediation under the same context (when the blocker
//! allows retry) or by restarting under a brand-new context. Done never
//! regresses outside the administrative reopen path, which the engine
//! documents in the ledger.
//!
//! This module mutates stage-record maps handed to it; the engine owns the
//! maps and the per-entity locking around them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use leadflow_common::{EngineConfig, GateView, LeadFlowError, StageRecord, StageStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of an ordering-checked transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied(StageStatus),
    /// The upstream stage is not Done. Nothing changed; retrying after the
    /// upstream completes is the caller's job.
    UpstreamNotReady,
}

pub struct Waterfall {
    config: Arc<EngineConfig>,
}

impl Waterfall {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    fn stage_index(&self, stage: &str) -> Result<usize, LeadFlowError> {
        self.config
            .stage_index(stage)
            .ok_or_else(|| LeadFlowError::UnknownStage(stage.to_string()))
    }

    /// Whether the stage at `idx` may leave NotStarted: the nearest
    /// upstream blocking stage must be Done. Non-blocking stages never
    /// gate, in any state; a best-effort stage that never ran must not
    /// hold up the funnel.
    fn upstream_ready(&self, stages: &HashMap<String, StageRecord>, idx: usize) -> bool {
        for j in (0..idx).rev() {
            let upstream = &self.config.stages[j];
            if !upstream.blocking {
                continue;
            }
            return stages
                .get(&upstream.name)
                .is_some_and(|r| r.status == StageStatus::Done);
        }
        true
    }

    fn context_matches(
        record: &StageRecord,
        context: Uuid,
        stage: &str,
    ) -> Result<(), LeadFlowError> {
        match record.context_id {
            Some(current) if current == context => Ok(()),
            Some(current) => Err(LeadFlowError::ContextMismatch {
                stage: stage.to_string(),
                reason: format!("running under context {current}, got {context}"),
            }),
            None => Ok(()),
        }
    }

    /// NotStarted -> InProgress, ordering-checked. Idempotent when already
    /// running under the same context.
    pub fn begin(
        &self,
        stages: &mut HashMap<String, StageRecord>,
        stage: &str,
        context: Uuid,
    ) -> Result<TransitionOutcome, LeadFlowError> {
        let idx = self.stage_index(stage)?;
        let current = stages.get(stage).cloned().unwrap_or_default();
        match current.status {
            StageStatus::NotStarted => {
                if !self.upstream_ready(stages, idx) {
                    // No record transition: the rejection leaves no trace in
                    // stage state.
                    return Ok(TransitionOutcome::UpstreamNotReady);
                }
                stages.insert(
                    stage.to_string(),
                    StageRecord {
                        status: StageStatus::InProgress,
                        context_id: Some(context),
                        completed_at: None,
                        blocker: None,
                    },
                );
                Ok(TransitionOutcome::Applied(StageStatus::InProgress))
            }
            StageStatus::InProgress => {
                Self::context_matches(&current, context, stage)?;
                Ok(TransitionOutcome::Applied(StageStatus::InProgress))
            }
            StageStatus::Done => Err(LeadFlowError::IllegalTransition {
                stage: stage.to_string(),
                reason: "already done".into(),
            }),
            StageStatus::Blocked => Err(LeadFlowError::IllegalTransition {
                stage: stage.to_string(),
                reason: "blocked; resume under the same context or restart under a new one".into(),
            }),
        }
    }

    /// -> Done, ordering-checked. Accepts a NotStarted stage directly
    /// (begin and complete collapsed into one call) and is idempotent on a
    /// stage that is already Done.
    pub fn complete(
        &self,
        stages: &mut HashMap<String, StageRecord>,
        stage: &str,
        context: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, LeadFlowError> {
        let idx = self.stage_index(stage)?;
        let current = stages.get(stage).cloned().unwrap_or_default();
        match current.status {
            StageStatus::NotStarted => {
                if !self.upstream_ready(stages, idx) {
                    return Ok(TransitionOutcome::UpstreamNotReady);
                }
                stages.insert(
                    stage.to_string(),
                    StageRecord {
                        status: StageStatus::Done,
                        context_id: Some(context),
                        completed_at: Some(now),
                        blocker: None,
                    },
                );
                Ok(TransitionOutcome::Applied(StageStatus::Done))
            }
            StageStatus::InProgress => {
                Self::context_matches(&current, context, stage)?;
                stages.insert(
                    stage.to_string(),
                    StageRecord {
                        status: StageStatus::Done,
                        context_id: Some(context),
                        completed_at: Some(now),
                        blocker: None,
                    },
                );
                Ok(TransitionOutcome::Applied(StageStatus::Done))
            }
            StageStatus::Done => Ok(TransitionOutcome::Applied(StageStatus::Done)),
            StageStatus::Blocked => Err(LeadFlowError::IllegalTransition {
                stage: stage.to_string(),
                reason: "blocked; resume under the same context or restart under a new one".into(),
            }),
        }
    }

    /// -> Blocked, referencing a ledger entry the engine has already
    /// durably appended. Legal from NotStarted, since a producer can
    /// discover a blocker while first probing a stage.
    pub fn block(
        &self,
        stages: &mut HashMap<String, StageRecord>,
        stage: &str,
        context: Uuid,
        ledger_id: Uuid,
    ) -> Result<(), LeadFlowError> {
        self.stage_index(stage)?;
        let current = stages.get(stage).cloned().unwrap_or_default();
        match current.status {
            StageStatus::NotStarted | StageStatus::InProgress => {
                if current.status == StageStatus::InProgress {
                    Self::context_matches(&current, context, stage)?;
                }
                stages.insert(
                    stage.to_string(),
                    StageRecord {
                        status: StageStatus::Blocked,
                        context_id: Some(context),
                        completed_at: None,
                        blocker: Some(ledger_id),
                    },
                );
                Ok(())
            }
            StageStatus::Done => Err(LeadFlowError::IllegalTransition {
                stage: stage.to_string(),
                reason: "already done".into(),
            }),
            StageStatus::Blocked => Err(LeadFlowError::IllegalTransition {
                stage: stage.to_string(),
                reason: "already blocked".into(),
            }),
        }
    }

    /// Blocked -> InProgress under the same context, after remediation.
    /// Only legal when the active blocker allows retry; the ledger entry
    /// itself stays on record forever.
    pub fn resume(
        &self,
        stages: &mut HashMap<String, StageRecord>,
        stage: &str,
        context: Uuid,
        retry_allowed: bool,
    ) -> Result<TransitionOutcome, LeadFlowError> {
        self.stage_index(stage)?;
        let current = stages.get(stage).cloned().unwrap_or_default();
        if current.status != StageStatus::Blocked {
            return Err(LeadFlowError::IllegalTransition {
                stage: stage.to_string(),
                reason: format!("resume from {}, expected blocked", current.status),
            });
        }
        Self::context_matches(&current, context, stage)?;
        if !retry_allowed {
            return Err(LeadFlowError::RetryNotAllowed {
                stage: stage.to_string(),
            });
        }
        stages.insert(
            stage.to_string(),
            StageRecord {
                status: StageStatus::InProgress,
                context_id: Some(context),
                completed_at: None,
                blocker: None,
            },
        );
        Ok(TransitionOutcome::Applied(StageStatus::InProgress))
    }

    /// Blocked -> NotStarted under a brand-new context. The blocked context
    /// may not be reused; a silent in-place retry would make the audit
    /// trail ambiguous.
    pub fn restart(
        &self,
        stages: &mut HashMap<String, StageRecord>,
        stage: &str,
        new_context: Uuid,
    ) -> Result<TransitionOutcome, LeadFlowError> {
        self.stage_index(stage)?;
        let current = stages.get(stage).cloned().unwrap_or_default();
        if current.status != StageStatus::Blocked {
            return Err(LeadFlowError::IllegalTransition {
                stage: stage.to_string(),
                reason: format!("restart from {}, expected blocked", current.status),
            });
        }
        if current.context_id == Some(new_context) {
            return Err(LeadFlowError::ContextMismatch {
                stage: stage.to_string(),
                reason: "restart requires a brand-new context".into(),
            });
        }
        stages.insert(
            stage.to_string(),
            StageRecord {
                status: StageStatus::NotStarted,
                context_id: Some(new_context),
                completed_at: None,
                blocker: None,
            },
        );
        Ok(TransitionOutcome::Applied(StageStatus::NotStarted))
    }

    /// Administrative regression of a Done stage back to NotStarted. The
    /// engine appends the documenting ledger entry; this only flips state.
    pub fn reopen(
        &self,
        stages: &mut HashMap<String, StageRecord>,
        stage: &str,
    ) -> Result<(), LeadFlowError> {
        self.stage_index(stage)?;
        let current = stages.get(stage).cloned().unwrap_or_default();
        if current.status != StageStatus::Done {
            return Err(LeadFlowError::IllegalTransition {
                stage: stage.to_string(),
                reason: format!("reopen from {}, expected done", current.status),
            });
        }
        stages.insert(stage.to_string(), StageRecord::default());
        Ok(())
    }

    /// The eligibility slice the classifier consumes.
    pub fn gate_view(&self, stages: &HashMap<String, StageRecord>, kill_flag: bool) -> GateView {
        let blocked_blocking_stage = stages.iter().any(|(name, record)| {
            record.status == StageStatus::Blocked
                && self.config.stage(name).is_some_and(|s| s.blocking)
        });
        GateView {
            kill_flag,
            blocked_blocking_stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waterfall() -> Waterfall {
        Waterfall::new(Arc::new(EngineConfig::default()))
    }

    fn ctx() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn first_stage_starts_without_upstream() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        let outcome = wf.begin(&mut stages, "identity-resolution", ctx()).unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied(StageStatus::InProgress));
    }

    #[test]
    fn later_stage_cannot_start_before_upstream_done() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        let outcome = wf.begin(&mut stages, "targeting", ctx()).unwrap();
        assert_eq!(outcome, TransitionOutcome::UpstreamNotReady);
        // The rejection left no stage record behind.
        assert!(stages.is_empty());
    }

    #[test]
    fn complete_unlocks_the_next_stage() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        let now = Utc::now();
        wf.complete(&mut stages, "identity-resolution", ctx(), now)
            .unwrap();
        let outcome = wf.begin(&mut stages, "targeting", ctx()).unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied(StageStatus::InProgress));
    }

    #[test]
    fn every_stage_out_of_order_is_upstream_not_ready() {
        let wf = waterfall();
        let config = EngineConfig::default();
        for stage in config.stages.iter().skip(1) {
            let mut stages = HashMap::new();
            let outcome = wf.complete(&mut stages, &stage.name, ctx(), Utc::now()).unwrap();
            assert_eq!(
                outcome,
                TransitionOutcome::UpstreamNotReady,
                "stage {} started with nothing upstream done",
                stage.name
            );
            assert!(stages.is_empty());
        }
    }

    #[test]
    fn unknown_stage_is_an_input_error() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        let err = wf.begin(&mut stages, "shipping", ctx()).unwrap_err();
        assert!(matches!(err, LeadFlowError::UnknownStage(_)));
    }

    #[test]
    fn non_blocking_stage_never_gates_downstream() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        let now = Utc::now();
        let context = ctx();
        wf.complete(&mut stages, "identity-resolution", context, now)
            .unwrap();
        wf.complete(&mut stages, "targeting", context, now).unwrap();
        // enrichment (non-blocking) is untouched; people-fill may proceed.
        let outcome = wf.begin(&mut stages, "people-fill", ctx()).unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied(StageStatus::InProgress));
    }

    #[test]
    fn blocked_non_blocking_stage_does_not_gate_downstream() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        let now = Utc::now();
        let context = ctx();
        wf.complete(&mut stages, "identity-resolution", context, now)
            .unwrap();
        wf.complete(&mut stages, "targeting", context, now).unwrap();
        wf.block(&mut stages, "enrichment", ctx(), Uuid::new_v4())
            .unwrap();
        let outcome = wf.begin(&mut stages, "people-fill", ctx()).unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied(StageStatus::InProgress));
        // ...but it also never marks the entity ineligible.
        assert!(!wf.gate_view(&stages, false).blocked_blocking_stage);
    }

    #[test]
    fn blocked_blocking_stage_flips_the_gate_view() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        wf.block(&mut stages, "targeting", ctx(), Uuid::new_v4())
            .unwrap();
        assert!(wf.gate_view(&stages, false).blocked_blocking_stage);
    }

    #[test]
    fn complete_is_idempotent_once_done() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        let now = Utc::now();
        let context = ctx();
        wf.complete(&mut stages, "identity-resolution", context, now)
            .unwrap();
        let again = wf
            .complete(&mut stages, "identity-resolution", context, now)
            .unwrap();
        assert_eq!(again, TransitionOutcome::Applied(StageStatus::Done));
    }

    #[test]
    fn in_progress_under_another_context_rejects_completion() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        wf.begin(&mut stages, "identity-resolution", ctx()).unwrap();
        let err = wf
            .complete(&mut stages, "identity-resolution", ctx(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LeadFlowError::ContextMismatch { .. }));
    }

    #[test]
    fn blocked_stage_rejects_begin_and_complete() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        wf.block(&mut stages, "identity-resolution", ctx(), Uuid::new_v4())
            .unwrap();
        assert!(wf.begin(&mut stages, "identity-resolution", ctx()).is_err());
        assert!(wf
            .complete(&mut stages, "identity-resolution", ctx(), Utc::now())
            .is_err());
    }

    #[test]
    fn double_block_is_illegal() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        let context = ctx();
        wf.block(&mut stages, "targeting", context, Uuid::new_v4())
            .unwrap();
        let err = wf
            .block(&mut stages, "targeting", context, Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, LeadFlowError::IllegalTransition { .. }));
    }

    #[test]
    fn resume_requires_same_context_and_retryable_blocker() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        let context = ctx();
        wf.block(&mut stages, "targeting", context, Uuid::new_v4())
            .unwrap();

        let err = wf.resume(&mut stages, "targeting", ctx(), true).unwrap_err();
        assert!(matches!(err, LeadFlowError::ContextMismatch { .. }));

        let err = wf
            .resume(&mut stages, "targeting", context, false)
            .unwrap_err();
        assert!(matches!(err, LeadFlowError::RetryNotAllowed { .. }));

        let outcome = wf.resume(&mut stages, "targeting", context, true).unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied(StageStatus::InProgress));
        assert!(stages["targeting"].blocker.is_none());
    }

    #[test]
    fn restart_rejects_the_blocked_context() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        let context = ctx();
        wf.block(&mut stages, "targeting", context, Uuid::new_v4())
            .unwrap();

        let err = wf.restart(&mut stages, "targeting", context).unwrap_err();
        assert!(matches!(err, LeadFlowError::ContextMismatch { .. }));

        let fresh = ctx();
        let outcome = wf.restart(&mut stages, "targeting", fresh).unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied(StageStatus::NotStarted));
        assert_eq!(stages["targeting"].context_id, Some(fresh));
        assert!(stages["targeting"].blocker.is_none());
    }

    #[test]
    fn done_never_regresses_through_block() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        wf.complete(&mut stages, "identity-resolution", ctx(), Utc::now())
            .unwrap();
        let err = wf
            .block(&mut stages, "identity-resolution", ctx(), Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, LeadFlowError::IllegalTransition { .. }));
    }

    #[test]
    fn reopen_resets_a_done_stage() {
        let wf = waterfall();
        let mut stages = HashMap::new();
        wf.complete(&mut stages, "identity-resolution", ctx(), Utc::now())
            .unwrap();
        wf.reopen(&mut stages, "identity-resolution").unwrap();
        assert_eq!(
            stages["identity-resolution"].status,
            StageStatus::NotStarted
        );

        // Only Done stages reopen.
        assert!(wf.reopen(&mut stages, "identity-resolution").is_err());
    }

    #[test]
    fn kill_flag_passes_through_gate_view() {
        let wf = waterfall();
        let stages = HashMap::new();
        assert!(wf.gate_view(&stages, true).kill_flag);
        assert!(!wf.gate_view(&stages, false).kill_flag);
    }
}
