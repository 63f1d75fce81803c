//! Pure scoring math: decay, confidence weighting, composite score, and
//! tier classification.
//!
//! Everything here is a pure function so the engine and any future
//! consumers share the same arithmetic without pulling in engine state.

use std::collections::HashMap;

use crate::config::{SignalTypeConfig, TierBoundaries};
use crate::types::{GateView, SignalType, Tier};

/// Exponential decay factor for a signal aged `age_days` with the given
/// half-life: 1.0 at age zero, 0.5 at one half-life, approaching zero
/// without ever reaching it. Future-dated signals do not amplify.
pub fn decay_factor(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    let age = age_days.max(0.0);
    0.5_f64.powf(age / half_life_days)
}

/// One signal's contribution to its type component: impact scaled by
/// confidence and decay. Impact keeps its sign; adverse facts subtract.
pub fn contribution(impact: f64, confidence: f64, decay: f64) -> f64 {
    impact * confidence.clamp(0.0, 1.0) * decay
}

/// Weighted composite over per-type component sums.
pub fn composite_score(
    components: &HashMap<SignalType, f64>,
    signals: &HashMap<SignalType, SignalTypeConfig>,
) -> f64 {
    components
        .iter()
        .map(|(t, component)| component * signals.get(t).map(|c| c.weight).unwrap_or(0.0))
        .sum()
}

/// Map a composite score plus gate state to a tier.
///
/// The gate override is non-negotiable: a kill flag or a frozen blocking
/// stage yields `Ineligible` at any score. Idempotent on unchanged inputs.
pub fn classify(composite: f64, gate: GateView, bounds: TierBoundaries) -> Tier {
    if gate.kill_flag || gate.blocked_blocking_stage {
        return Tier::Ineligible;
    }
    if composite >= bounds.engage {
        Tier::Engage
    } else if composite >= bounds.suspect {
        Tier::Suspect
    } else {
        Tier::Cold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    // --- decay_factor tests ---

    #[test]
    fn decay_is_one_at_age_zero() {
        assert!((decay_factor(0.0, 30.0) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn decay_is_half_at_one_half_life() {
        assert!((decay_factor(30.0, 30.0) - 0.5).abs() < 1e-10);
        assert!((decay_factor(90.0, 90.0) - 0.5).abs() < 1e-10);
    }

    #[test]
    fn decay_is_quarter_at_two_half_lives() {
        assert!((decay_factor(60.0, 30.0) - 0.25).abs() < 1e-10);
    }

    #[test]
    fn decay_approaches_zero_but_stays_positive() {
        let d = decay_factor(3000.0, 30.0);
        assert!(d > 0.0);
        assert!(d < 1e-10);
    }

    #[test]
    fn future_dated_signal_does_not_amplify() {
        assert!((decay_factor(-5.0, 30.0) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn decay_is_monotonically_non_increasing() {
        let mut prev = decay_factor(0.0, 45.0);
        for age in 1..200 {
            let d = decay_factor(age as f64, 45.0);
            assert!(d <= prev, "decay rose at age {age}");
            prev = d;
        }
    }

    // --- contribution tests ---

    #[test]
    fn contribution_scales_by_confidence() {
        assert!((contribution(8.0, 0.5, 1.0) - 4.0).abs() < 1e-10);
    }

    #[test]
    fn contribution_clamps_confidence_to_unit_range() {
        assert!((contribution(10.0, 1.5, 1.0) - 10.0).abs() < 1e-10);
        assert!((contribution(10.0, -0.5, 1.0) - 0.0).abs() < 1e-10);
    }

    #[test]
    fn negative_impact_yields_negative_contribution() {
        assert!(contribution(-6.0, 0.9, 1.0) < 0.0);
    }

    // --- composite_score tests ---

    #[test]
    fn composite_applies_per_type_weights() {
        let config = EngineConfig::default();
        let mut components = HashMap::new();
        components.insert(SignalType::FilingDetected, 8.0);
        components.insert(SignalType::FundingEvent, 5.0);
        let expected = 8.0 * config.signal(SignalType::FilingDetected).weight
            + 5.0 * config.signal(SignalType::FundingEvent).weight;
        assert!((composite_score(&components, &config.signals) - expected).abs() < 1e-10);
    }

    #[test]
    fn composite_can_go_below_zero() {
        let config = EngineConfig::default();
        let mut components = HashMap::new();
        components.insert(SignalType::AdverseEvent, -12.0);
        components.insert(SignalType::ContentEngagement, 2.0);
        assert!(composite_score(&components, &config.signals) < 0.0);
    }

    #[test]
    fn composite_of_empty_components_is_zero() {
        let config = EngineConfig::default();
        assert_eq!(composite_score(&HashMap::new(), &config.signals), 0.0);
    }

    // --- classify tests ---

    #[test]
    fn classify_boundaries_are_inclusive_above() {
        let bounds = TierBoundaries {
            suspect: 25.0,
            engage: 50.0,
        };
        let open = GateView::default();
        assert_eq!(classify(24.9, open, bounds), Tier::Cold);
        assert_eq!(classify(25.0, open, bounds), Tier::Suspect);
        assert_eq!(classify(49.9, open, bounds), Tier::Suspect);
        assert_eq!(classify(50.0, open, bounds), Tier::Engage);
    }

    #[test]
    fn negative_score_is_cold() {
        assert_eq!(
            classify(-30.0, GateView::default(), TierBoundaries::default()),
            Tier::Cold
        );
    }

    #[test]
    fn blocked_blocking_stage_overrides_any_score() {
        let gate = GateView {
            kill_flag: false,
            blocked_blocking_stage: true,
        };
        for score in [-10.0, 0.0, 25.0, 1e6] {
            assert_eq!(
                classify(score, gate, TierBoundaries::default()),
                Tier::Ineligible
            );
        }
    }

    #[test]
    fn kill_flag_overrides_any_score() {
        let gate = GateView {
            kill_flag: true,
            blocked_blocking_stage: false,
        };
        assert_eq!(
            classify(1e6, gate, TierBoundaries::default()),
            Tier::Ineligible
        );
    }

    #[test]
    fn classify_is_idempotent_on_unchanged_inputs() {
        let gate = GateView::default();
        let bounds = TierBoundaries::default();
        assert_eq!(classify(42.0, gate, bounds), classify(42.0, gate, bounds));
    }
}
