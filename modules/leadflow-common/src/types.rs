use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// --- Signal Types ---

/// The closed set of intent signal types producers may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    FilingDetected,
    FundingEvent,
    LeadershipChange,
    HiringSurge,
    ContentEngagement,
    ContactFilled,
    AdverseEvent,
}

impl SignalType {
    pub const ALL: [SignalType; 7] = [
        SignalType::FilingDetected,
        SignalType::FundingEvent,
        SignalType::LeadershipChange,
        SignalType::HiringSurge,
        SignalType::ContentEngagement,
        SignalType::ContactFilled,
        SignalType::AdverseEvent,
    ];
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalType::FilingDetected => write!(f, "filing_detected"),
            SignalType::FundingEvent => write!(f, "funding_event"),
            SignalType::LeadershipChange => write!(f, "leadership_change"),
            SignalType::HiringSurge => write!(f, "hiring_surge"),
            SignalType::ContentEngagement => write!(f, "content_engagement"),
            SignalType::ContactFilled => write!(f, "contact_filled"),
            SignalType::AdverseEvent => write!(f, "adverse_event"),
        }
    }
}

/// A signal as submitted by a producer. `received_at` is assigned at intake,
/// not carried here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSignal {
    /// Stable identifier of the business entity this signal is about.
    pub entity_id: String,
    pub signal_type: SignalType,
    /// Producer identifier.
    pub source: String,
    /// Producer-declared weight contribution. Signed: adverse facts carry
    /// negative impact.
    pub impact: f64,
    /// 0.0-1.0.
    pub confidence: f64,
    /// When the real-world event happened, producer-declared.
    pub occurred_at: DateTime<Utc>,
    /// Source-declared natural key: an article id, filing number, job
    /// posting id. Feeds the dedup key.
    pub natural_key: String,
}

/// Outcome of submitting a signal, relative to prior observations of the
/// same fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    /// First live observation of this fact.
    Accepted,
    /// Replaced a lower-confidence observation of the same fact.
    Superseded,
    /// Already known. Normal, not an error.
    Rejected,
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalStatus::Accepted => write!(f, "accepted"),
            SignalStatus::Superseded => write!(f, "superseded"),
            SignalStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// What the producer gets back from a submission: the dedup verdict plus the
/// entity's resulting score and tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalReceipt {
    pub status: SignalStatus,
    pub composite_score: f64,
    pub tier: Tier,
}

// --- Idempotency ---

/// The record held per dedup key while its window is live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub source: String,
    pub confidence: f64,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

// --- Score State ---

/// Aggregated score for one entity. Mutated only by the aggregator;
/// read-only everywhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityScoreState {
    pub entity_id: String,
    pub composite_score: f64,
    /// Number of currently-live signals.
    pub signal_count: u32,
    /// Contribution sum per signal type, decay and confidence applied.
    pub component_scores: HashMap<SignalType, f64>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl EntityScoreState {
    pub fn empty(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            composite_score: 0.0,
            signal_count: 0,
            component_scores: HashMap::new(),
            last_updated_at: None,
        }
    }
}

// --- Tiers ---

/// Discrete action classification derived from score plus gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Below the suspect boundary.
    Cold,
    /// At or above suspect, below engage.
    Suspect,
    /// At or above engage.
    Engage,
    /// Hard override: a blocking stage is frozen or the entity is
    /// kill-flagged. Takes precedence over any score.
    Ineligible,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Cold => write!(f, "cold"),
            Tier::Suspect => write!(f, "suspect"),
            Tier::Engage => write!(f, "engage"),
            Tier::Ineligible => write!(f, "ineligible"),
        }
    }
}

/// The slice of waterfall state the classifier needs: eligibility only, no
/// stage detail.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateView {
    pub kill_flag: bool,
    /// Any blocking-configured stage currently Blocked.
    pub blocked_blocking_stage: bool,
}

// --- Waterfall Stages ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    InProgress,
    Done,
    Blocked,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::NotStarted => write!(f, "not_started"),
            StageStatus::InProgress => write!(f, "in_progress"),
            StageStatus::Done => write!(f, "done"),
            StageStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Per (entity, stage) progress. Created when the entity first becomes
/// visible to the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    /// The processing context the current attempt runs under.
    pub context_id: Option<Uuid>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Active blocker, referencing a ledger entry. At most one per stage.
    pub blocker: Option<Uuid>,
}

impl Default for StageRecord {
    fn default() -> Self {
        Self {
            status: StageStatus::NotStarted,
            context_id: None,
            completed_at: None,
            blocker: None,
        }
    }
}

/// Consumer view of one stage: status plus the blocker entry when frozen.
/// A blocked stage always surfaces its blocker detail here; there is no
/// failure state reachable only through logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageView {
    pub status: StageStatus,
    pub blocker: Option<LedgerEntry>,
}

// --- Blocker Ledger ---

/// The closed taxonomy of reasons a stage can freeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerType {
    /// Nothing matched the stage's search (e.g. no target contact found).
    NoCandidate,
    /// More than one plausible match; a human must disambiguate.
    AmbiguousMatch,
    /// An upstream provider failed or timed out. Always retryable.
    ProviderError,
    /// A required identifier from an earlier stage is missing.
    MissingUpstreamId,
    /// The entity is on a suppression list.
    KillListed,
    /// Administrative regression of a Done stage, with the reason on record.
    AdminOverride,
}

impl std::fmt::Display for BlockerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockerType::NoCandidate => write!(f, "no_candidate"),
            BlockerType::AmbiguousMatch => write!(f, "ambiguous_match"),
            BlockerType::ProviderError => write!(f, "provider_error"),
            BlockerType::MissingUpstreamId => write!(f, "missing_upstream_id"),
            BlockerType::KillListed => write!(f, "kill_listed"),
            BlockerType::AdminOverride => write!(f, "admin_override"),
        }
    }
}

/// One append-only ledger row. Never updated or deleted; resolution is a new
/// stage transition under a remediated or fresh context, not a mutation here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub entity_id: String,
    pub stage: String,
    pub blocker_type: BlockerType,
    pub detail: String,
    /// Whether the same context may resume after remediation, or a brand-new
    /// context is mandatory.
    pub retry_allowed: bool,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        entity_id: &str,
        stage: &str,
        blocker_type: BlockerType,
        detail: &str,
        retry_allowed: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            stage: stage.to_string(),
            blocker_type,
            detail: detail.to_string(),
            retry_allowed,
            created_at: Utc::now(),
        }
    }
}

/// Filter for ledger triage queries. All fields optional; `None` matches
/// everything.
#[derive(Debug, Clone, Default)]
pub struct BlockerFilter {
    pub entity_id: Option<String>,
    pub blocker_type: Option<BlockerType>,
    pub retry_allowed: Option<bool>,
}

impl BlockerFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(ref e) = self.entity_id {
            if &entry.entity_id != e {
                return false;
            }
        }
        if let Some(t) = self.blocker_type {
            if entry.blocker_type != t {
                return false;
            }
        }
        if let Some(r) = self.retry_allowed {
            if entry.retry_allowed != r {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_type_serializes_snake_case() {
        let json = serde_json::to_string(&SignalType::FilingDetected).unwrap();
        assert_eq!(json, "\"filing_detected\"");
        assert_eq!(SignalType::FilingDetected.to_string(), "filing_detected");
    }

    #[test]
    fn signal_type_display_matches_serde_for_all_variants() {
        for t in SignalType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{t}\""));
        }
    }

    #[test]
    fn idempotency_record_live_until_expiry() {
        let now = Utc::now();
        let rec = IdempotencyRecord {
            source: "filings".into(),
            confidence: 0.9,
            stored_at: now,
            expires_at: now + chrono::Duration::days(1),
        };
        assert!(rec.is_live(now));
        assert!(!rec.is_live(now + chrono::Duration::days(2)));
        // Expiry boundary itself is dead, not live
        assert!(!rec.is_live(rec.expires_at));
    }

    #[test]
    fn stage_record_defaults_to_not_started() {
        let rec = StageRecord::default();
        assert_eq!(rec.status, StageStatus::NotStarted);
        assert!(rec.context_id.is_none());
        assert!(rec.blocker.is_none());
    }

    #[test]
    fn blocker_filter_empty_matches_all() {
        let entry = LedgerEntry::new("e1", "targeting", BlockerType::NoCandidate, "none", false);
        assert!(BlockerFilter::default().matches(&entry));
    }

    #[test]
    fn blocker_filter_narrows_by_type_and_retry() {
        let entry = LedgerEntry::new("e1", "targeting", BlockerType::NoCandidate, "none", false);
        let hit = BlockerFilter {
            blocker_type: Some(BlockerType::NoCandidate),
            retry_allowed: Some(false),
            ..Default::default()
        };
        let miss = BlockerFilter {
            blocker_type: Some(BlockerType::ProviderError),
            ..Default::default()
        };
        assert!(hit.matches(&entry));
        assert!(!miss.matches(&entry));
    }

    #[test]
    fn ledger_entry_round_trips_through_json() {
        let entry = LedgerEntry::new("e1", "people-fill", BlockerType::AmbiguousMatch, "two slots", true);
        let json = serde_json::to_string(&entry).unwrap();
        let back: LedgerEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, back);
    }
}
