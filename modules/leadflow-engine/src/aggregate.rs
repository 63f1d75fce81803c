//! Score aggregation: the live contribution set and composite recomputation.
//!
//! Every accepted, superseded, or retracted signal triggers a synchronous
//! recompute from the live set. There is no batch path, so the composite
//! is always consistent with the signals currently held.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use leadflow_common::scoring;
use leadflow_common::{EngineConfig, EntityScoreState, RawSignal, SignalType};

/// One live signal, pinned by its dedup key. A retraction removes exactly
/// this entry; decay only dampens what future recomputes produce from it.
#[derive(Debug, Clone)]
struct LiveSignal {
    signal_type: SignalType,
    impact: f64,
    confidence: f64,
    occurred_at: DateTime<Utc>,
}

/// Per-entity aggregation state. Exclusively owned by the aggregator; the
/// engine hands out read-only snapshots.
#[derive(Debug, Default)]
pub struct ScoreState {
    live: HashMap<String, LiveSignal>,
    component_scores: HashMap<SignalType, f64>,
    composite_score: f64,
    last_updated_at: Option<DateTime<Utc>>,
}

impl ScoreState {
    pub fn composite_score(&self) -> f64 {
        self.composite_score
    }

    pub fn signal_count(&self) -> u32 {
        self.live.len() as u32
    }
}

pub struct Aggregator {
    config: Arc<EngineConfig>,
}

impl Aggregator {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Apply a signal under `key`. Any still-live contribution under the
    /// same key is replaced, never summed: a key counts at most once no
    /// matter how it re-enters (supersession, or re-acceptance after its
    /// idempotency window lapsed).
    pub fn apply(&self, state: &mut ScoreState, key: &str, raw: &RawSignal, now: DateTime<Utc>) {
        state.live.insert(
            key.to_string(),
            LiveSignal {
                signal_type: raw.signal_type,
                impact: raw.impact,
                confidence: raw.confidence,
                occurred_at: raw.occurred_at,
            },
        );
        self.recompute(state, now);
    }

    /// Remove the contribution under `key`, exactly.
    pub fn retract(&self, state: &mut ScoreState, key: &str, now: DateTime<Utc>) {
        if state.live.remove(key).is_some() {
            self.recompute(state, now);
        }
    }

    fn recompute(&self, state: &mut ScoreState, now: DateTime<Utc>) {
        let mut components: HashMap<SignalType, f64> = HashMap::new();
        for signal in state.live.values() {
            let age_days = (now - signal.occurred_at).num_seconds() as f64 / 86_400.0;
            let half_life = self.config.signal(signal.signal_type).decay_half_life_days;
            let decay = scoring::decay_factor(age_days, half_life);
            *components.entry(signal.signal_type).or_insert(0.0) +=
                scoring::contribution(signal.impact, signal.confidence, decay);
        }
        state.composite_score = scoring::composite_score(&components, &self.config.signals);
        state.component_scores = components;
        state.last_updated_at = Some(now);
    }

    /// Read-only view for consumers.
    pub fn snapshot(&self, entity_id: &str, state: &ScoreState) -> EntityScoreState {
        EntityScoreState {
            entity_id: entity_id.to_string(),
            composite_score: state.composite_score,
            signal_count: state.signal_count(),
            component_scores: state.component_scores.clone(),
            last_updated_at: state.last_updated_at,
        }
    }
}
