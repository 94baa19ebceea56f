//! Checkout risk scoring.
//!
//! The score is a bounded heuristic (0-100) that feeds the gate decision. It
//! sits behind the [`RiskScorer`] trait so a behavioural model can replace
//! [`HeuristicRiskScorer`] without touching verification.

use std::time::Duration;

/// Highest possible risk score.
pub const MAX_RISK_SCORE: u8 = 100;

/// Session signals available at the end of a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFeatures {
    /// Total number of units in the cart.
    pub item_count: u32,
    /// Time between the session start and payment.
    pub session_duration: Duration,
    /// Purchase total in minor currency units.
    pub total: u64,
    /// Free-form noise term standing in for richer behavioural signals.
    pub entropy: u8,
}

/// Turns session features into a risk score.
///
/// Implementations must be total: every input maps to a score within
/// `0..=MAX_RISK_SCORE`.
pub trait RiskScorer: Send + Sync {
    /// Score a completed session.
    fn score(&self, features: &SessionFeatures) -> u8;
}

/// Additive heuristic over cart size, spend and pace.
#[derive(Debug, Clone)]
pub struct HeuristicRiskScorer {
    /// Totals at or above this (minor units) are treated as high value.
    pub high_value_total: u64,
    /// Sessions shorter than this with a busy cart look rushed.
    pub rushed_session: Duration,
    /// Maximum points contributed by the entropy term.
    pub entropy_weight: u8,
}

impl Default for HeuristicRiskScorer {
    fn default() -> Self {
        Self {
            high_value_total: 200_000,
            rushed_session: Duration::from_secs(60),
            entropy_weight: 20,
        }
    }
}

const BASE_SCORE: i64 = 10;

impl RiskScorer for HeuristicRiskScorer {
    fn score(&self, features: &SessionFeatures) -> u8 {
        let mut score = BASE_SCORE;

        score += match features.item_count {
            0..=5 => 0,
            6..=10 => 5,
            11..=20 => 15,
            _ => 25,
        };

        if features.total >= self.high_value_total {
            score += 20;
        } else if features.total >= self.high_value_total / 2 {
            score += 10;
        }

        if features.item_count > 5 && features.session_duration < self.rushed_session {
            score += 20;
        }

        score += i64::from(features.entropy) * i64::from(self.entropy_weight) / 255;

        clamp_score(score)
    }
}

/// Clamp an arbitrary intermediate value into the score range.
#[must_use]
pub fn clamp_score(raw: i64) -> u8 {
    u8::try_from(raw.clamp(0, i64::from(MAX_RISK_SCORE))).unwrap_or(MAX_RISK_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn features(item_count: u32, secs: u64, total: u64, entropy: u8) -> SessionFeatures {
        SessionFeatures {
            item_count,
            session_duration: Duration::from_secs(secs),
            total,
            entropy,
        }
    }

    #[test]
    fn test_small_relaxed_basket_scores_low() {
        let scorer = HeuristicRiskScorer::default();
        let score = scorer.score(&features(3, 900, 450, 0));
        assert_eq!(score, 10);
    }

    #[test]
    fn test_rushed_high_value_basket_scores_high() {
        let scorer = HeuristicRiskScorer::default();
        let score = scorer.score(&features(25, 30, 500_000, 255));
        // 10 + 25 + 20 + 20 + 20
        assert_eq!(score, 95);
        assert!(score > 65);
    }

    #[test]
    fn test_deterministic_without_entropy() {
        let scorer = HeuristicRiskScorer::default();
        let f = features(8, 45, 120_000, 0);
        assert_eq!(scorer.score(&f), scorer.score(&f));
    }

    #[test]
    fn test_clamp_score_bounds() {
        assert_eq!(clamp_score(-40), 0);
        assert_eq!(clamp_score(55), 55);
        assert_eq!(clamp_score(400), 100);
    }

    proptest! {
        #[test]
        fn prop_score_within_bounds(
            items in any::<u32>(),
            secs in any::<u64>(),
            total in any::<u64>(),
            entropy in any::<u8>(),
            weight in any::<u8>(),
        ) {
            let scorer = HeuristicRiskScorer {
                entropy_weight: weight,
                ..HeuristicRiskScorer::default()
            };
            let score = scorer.score(&features(items, secs, total, entropy));
            prop_assert!(score <= MAX_RISK_SCORE);
        }
    }
}
