use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::LeadFlowError;
use crate::types::SignalType;

/// TOML-backed engine configuration, loaded once at process start.
/// Frozen after load: stage order, weight tables, and tier boundaries change
/// only by redeploy, never at runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// The waterfall, in its fixed total order.
    pub stages: Vec<StageConfig>,
    /// Per-signal-type weight, decay, and idempotency window.
    pub signals: HashMap<SignalType, SignalTypeConfig>,
    pub tiers: TierBoundaries,
    /// Deadline applied to each store call, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    /// Whether a blocker here freezes downstream starts and tier
    /// eligibility. Explicit per stage, never inferred.
    pub blocking: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalTypeConfig {
    pub weight: f64,
    /// Half-life of a signal's contribution, in days.
    pub decay_half_life_days: f64,
    /// Dedup window: how long an observed fact suppresses re-submission.
    pub ttl_days: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierBoundaries {
    pub suspect: f64,
    pub engage: f64,
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self {
            suspect: 25.0,
            engage: 50.0,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let stage = |name: &str, blocking: bool| StageConfig {
            name: name.to_string(),
            blocking,
        };
        let signal = |weight: f64, half_life: f64, ttl: i64| SignalTypeConfig {
            weight,
            decay_half_life_days: half_life,
            ttl_days: ttl,
        };
        let mut signals = HashMap::new();
        signals.insert(SignalType::FilingDetected, signal(1.0, 90.0, 365));
        signals.insert(SignalType::FundingEvent, signal(1.2, 60.0, 180));
        signals.insert(SignalType::LeadershipChange, signal(1.0, 45.0, 120));
        signals.insert(SignalType::HiringSurge, signal(0.8, 30.0, 60));
        signals.insert(SignalType::ContentEngagement, signal(0.5, 14.0, 7));
        signals.insert(SignalType::ContactFilled, signal(0.6, 30.0, 30));
        signals.insert(SignalType::AdverseEvent, signal(1.0, 120.0, 365));

        Self {
            stages: vec![
                stage("identity-resolution", true),
                stage("targeting", true),
                // Best-effort: a frozen enrichment never holds up the funnel.
                stage("enrichment", false),
                stage("people-fill", true),
                stage("execution", true),
            ],
            signals,
            tiers: TierBoundaries::default(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Position of a stage in the waterfall, if configured.
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn signal(&self, signal_type: SignalType) -> &SignalTypeConfig {
        // validate() guarantees every type has an entry
        &self.signals[&signal_type]
    }

    pub fn validate(&self) -> std::result::Result<(), LeadFlowError> {
        if self.stages.is_empty() {
            return Err(LeadFlowError::Config("stage list is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(LeadFlowError::Config("stage with empty name".into()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(LeadFlowError::Config(format!(
                    "duplicate stage: {}",
                    stage.name
                )));
            }
        }
        for signal_type in SignalType::ALL {
            let Some(cfg) = self.signals.get(&signal_type) else {
                return Err(LeadFlowError::Config(format!(
                    "missing signal config for {signal_type}"
                )));
            };
            if !cfg.weight.is_finite() {
                return Err(LeadFlowError::Config(format!(
                    "non-finite weight for {signal_type}"
                )));
            }
            if cfg.decay_half_life_days <= 0.0 {
                return Err(LeadFlowError::Config(format!(
                    "non-positive half-life for {signal_type}"
                )));
            }
            if cfg.ttl_days <= 0 {
                return Err(LeadFlowError::Config(format!(
                    "non-positive ttl for {signal_type}"
                )));
            }
        }
        if self.tiers.suspect >= self.tiers.engage {
            return Err(LeadFlowError::Config(format!(
                "tier boundaries out of order: suspect {} >= engage {}",
                self.tiers.suspect, self.tiers.engage
            )));
        }
        if self.store_timeout_ms == 0 {
            return Err(LeadFlowError::Config("store_timeout_ms is zero".into()));
        }
        Ok(())
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
