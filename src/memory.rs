//! Forgetting-curve math.
//!
//! Pure functions over (difficulty, stability, grade, elapsed days). Nothing
//! here touches storage; values are kept at full precision and only rounded
//! by the caller when persisting.

use serde::{Deserialize, Serialize};

use crate::models::Grade;

/// Tunable parameters of the memory model. One set per learner; defaults are
/// the FSRS-4.5 values adapted for command-line skills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryParams {
    /// Stability (days) after the first review, indexed by grade.
    pub initial_stability: [f64; 4],
    /// Difficulty after the first review, indexed by grade.
    pub initial_difficulty: [f64; 4],
    /// Per-grade step sizes for the difficulty drift.
    pub difficulty_multiplier: [f64; 4],
    /// w8: overall scale of stability growth on success.
    pub success_scale: f64,
    /// w9: exponent applied to current stability on success.
    pub success_exponent: f64,
    /// w10: how strongly a low retrievability boosts growth.
    pub retrievability_gain: f64,
    /// w11 and w12: shrink rate on failure.
    pub failure_scale: f64,
    pub failure_step: f64,
    pub minimum_stability: f64,
    pub target_retention: f64,
    pub minimum_interval: f64,
    pub maximum_interval: f64,
    pub easy_bonus: f64,
    pub hard_penalty: f64,
}

impl Default for MemoryParams {
    fn default() -> Self {
        Self {
            initial_stability: [0.4, 0.6, 2.4, 5.8],
            initial_difficulty: [8.0, 6.0, 4.0, 2.0],
            difficulty_multiplier: [5.0, 1.2, 0.8, 0.5],
            success_scale: 1.49,
            success_exponent: 0.14,
            retrievability_gain: 0.94,
            failure_scale: 2.18,
            failure_step: 0.05,
            minimum_stability: 0.1,
            target_retention: 0.90,
            minimum_interval: 1.0,
            maximum_interval: 365.0,
            easy_bonus: 1.3,
            hard_penalty: 0.8,
        }
    }
}

pub const MIN_DIFFICULTY: f64 = 1.0;
pub const MAX_DIFFICULTY: f64 = 10.0;

// Retention level that stability is defined against.
const REFERENCE_RETENTION: f64 = 0.9;

/// Probability of recall after `elapsed_days`, in (0, 1].
pub fn retrievability(stability: f64, elapsed_days: f64) -> f64 {
    debug_assert!(stability > 0.0, "stability must be positive, got {}", stability);
    if elapsed_days <= 0.0 {
        return 1.0;
    }
    (-elapsed_days / stability).exp().clamp(f64::MIN_POSITIVE, 1.0)
}

pub fn initial_stability(params: &MemoryParams, grade: Grade) -> f64 {
    params.initial_stability[grade.index()]
}

pub fn initial_difficulty(params: &MemoryParams, grade: Grade) -> f64 {
    params.initial_difficulty[grade.index()].clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}

/// Low grades push difficulty up, high grades pull it down.
pub fn update_difficulty(params: &MemoryParams, difficulty: f64, grade: Grade) -> f64 {
    let multiplier = params.difficulty_multiplier[grade.index()];
    let delta = (2.5 - grade.value() as f64) * multiplier * 0.1;
    (difficulty + delta).clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}

pub fn update_stability(
    params: &MemoryParams,
    stability: f64,
    difficulty: f64,
    grade: Grade,
    retrievability: f64,
) -> f64 {
    debug_assert!(stability > 0.0 && stability.is_finite());
    debug_assert!((0.0..=1.0).contains(&retrievability));

    if grade.is_success() {
        let increment = params.success_scale.exp()
            * (11.0 - difficulty)
            * stability.powf(params.success_exponent)
            * ((params.retrievability_gain * (1.0 - retrievability)).exp() - 1.0);
        stability * (1.0 + increment)
    } else {
        let multiplier =
            (params.failure_scale * (grade.value() as f64 - 3.0) * params.failure_step).exp();
        let difficulty_factor = (11.0 - difficulty) / 10.0;
        (stability * multiplier * difficulty_factor).max(params.minimum_stability)
    }
}

/// Days until recall probability falls to the target retention.
pub fn optimal_interval(params: &MemoryParams, stability: f64) -> f64 {
    stability * params.target_retention.ln() / REFERENCE_RETENTION.ln()
}

/// Next interval in days for a grade, with grade floors and bonuses applied
/// and the result clamped to the configured range.
pub fn next_interval(params: &MemoryParams, stability: f64, grade: Grade) -> f64 {
    let base = optimal_interval(params, stability);
    let interval = match grade {
        Grade::Again => params.minimum_interval,
        Grade::Hard => (base * params.hard_penalty).max(1.0),
        Grade::Good => base.max(2.0),
        Grade::Easy => base.max(4.0) * params.easy_bonus,
    };
    interval.clamp(params.minimum_interval, params.maximum_interval)
}

/// Ranking key for the review queue. Overdue items are always positive;
/// items not yet due are zero or negative.
pub fn urgency(stability: f64, days_overdue: f64) -> f64 {
    if days_overdue > 0.0 {
        (1.0 - retrievability(stability, days_overdue)) * 100.0 + days_overdue
    } else {
        days_overdue
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
