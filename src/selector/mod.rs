//! The recommendation cascade: an ordered list of strategies, first hit wins.

pub mod strategies;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SelectorConfig;
use crate::content::{ContentLibrary, Micro};
use crate::error::Result;
use crate::mastery::DecayedMastery;
use crate::models::{
    LabAttempt, PriorityTier, Recommendation, ResponseRecord, SessionState, Track,
};

/// Caller-supplied request options.
#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    /// Recommendation ids, skills or chapters already shown for this request.
    pub exclude_ids: BTreeSet<String>,
    pub last_correct: bool,
}

/// Everything the cascade reads, loaded once per call.
#[derive(Debug, Clone)]
pub struct LearnerSnapshot {
    pub learner_id: String,
    pub track: Track,
    pub now: DateTime<Utc>,
    pub masteries: Vec<DecayedMastery>,
    pub session: Option<SessionState>,
    /// Newest first.
    pub lab_attempts: Vec<LabAttempt>,
    /// Answers from other sessions inside the failed-recent window, newest first.
    pub recent_responses: Vec<ResponseRecord>,
}

/// Cooldown bookkeeping a decision asks the caller to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SessionEffect {
    MarkBatchReview { position: usize },
    MarkLab { position: usize },
}

impl SessionEffect {
    pub fn apply_to(&self, session: &mut SessionState) {
        match *self {
            SessionEffect::MarkBatchReview { position } => {
                session.last_review_chapter_position = position
            }
            SessionEffect::MarkLab { position } => session.last_lab_chapter_position = position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub recommendation: Recommendation,
    pub effects: Vec<SessionEffect>,
}

impl Decision {
    pub fn new(recommendation: Recommendation) -> Self {
        Self {
            recommendation,
            effects: Vec::new(),
        }
    }

    pub fn with_effect(mut self, effect: SessionEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

pub trait RandomSource {
    /// Uniform sample in [0, 1).
    fn sample(&self) -> f64;

    fn fires(&self, probability: f64) -> bool {
        self.sample() < probability
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Always returns the same sample. `FixedRandom(1.0)` never fires.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn sample(&self) -> f64 {
        self.0
    }
}

pub struct SelectionContext<'a> {
    pub snapshot: &'a LearnerSnapshot,
    pub request: &'a SelectionRequest,
    pub library: &'a dyn ContentLibrary,
    pub config: &'a SelectorConfig,
    pub random: &'a dyn RandomSource,
    path: Vec<String>,
    empty_progress: BTreeMap<String, BTreeSet<String>>,
}

impl<'a> SelectionContext<'a> {
    pub fn new(
        snapshot: &'a LearnerSnapshot,
        request: &'a SelectionRequest,
        library: &'a dyn ContentLibrary,
        config: &'a SelectorConfig,
        random: &'a dyn RandomSource,
    ) -> Self {
        Self {
            snapshot,
            request,
            library,
            config,
            random,
            path: library.learning_path().chapters(),
            empty_progress: BTreeMap::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.snapshot.now
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.snapshot.session.as_ref()
    }

    /// Learning path chapters, flattened.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn progress(&self) -> &BTreeMap<String, BTreeSet<String>> {
        self.session()
            .map(|s| &s.completed_micros)
            .unwrap_or(&self.empty_progress)
    }

    pub fn is_excluded(&self, key: &str) -> bool {
        self.request.exclude_ids.contains(key)
    }

    /// Path index of the session's current chapter, 0 when unknown.
    pub fn chapter_position(&self) -> usize {
        self.session()
            .and_then(|s| s.current_chapter.as_deref())
            .and_then(|chapter| self.path.iter().position(|c| c == chapter))
            .unwrap_or(0)
    }

    /// First micro of the chapter not yet completed in this session, else
    /// the chapter's first micro.
    pub fn best_micro(&self, chapter: &str) -> Option<Micro> {
        let micros = self.library.micros(chapter);
        let done = self.progress().get(chapter);
        micros
            .iter()
            .find(|m| done.map_or(true, |d| !d.contains(&m.id)))
            .or_else(|| micros.first())
            .cloned()
    }

    pub fn raw_scores(&self) -> HashMap<String, f64> {
        self.snapshot
            .masteries
            .iter()
            .map(|m| (m.record.skill.clone(), m.record.proficiency_score))
            .collect()
    }

    pub fn latest_attempt(&self, lab_id: &str) -> Option<&LabAttempt> {
        self.snapshot.lab_attempts.iter().find(|a| a.lab_id == lab_id)
    }

    pub fn lab_passed(&self, lab_id: &str) -> bool {
        self.snapshot
            .lab_attempts
            .iter()
            .any(|a| a.lab_id == lab_id && a.passed)
    }

    /// True when the recommendation's id or any key it names is excluded.
    pub fn excludes(&self, recommendation: &Recommendation) -> bool {
        recommendation_keys(recommendation)
            .iter()
            .any(|key| self.is_excluded(key))
    }
}

fn recommendation_keys(recommendation: &Recommendation) -> Vec<&str> {
    let mut keys = vec![recommendation.id.as_str()];
    for field in ["skill", "chapter", "micro_id", "lab_id"] {
        if let Some(value) = recommendation.metadata.get(field).and_then(|v| v.as_str()) {
            keys.push(value);
        }
    }
    if let Some(skills) = recommendation.metadata.get("skills").and_then(|v| v.as_array()) {
        keys.extend(skills.iter().filter_map(|v| v.as_str()));
    }
    keys
}

pub trait Strategy {
    fn tier(&self) -> PriorityTier;

    /// Whether results from this tier are dropped when excluded.
    fn honors_exclusions(&self) -> bool {
        true
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>>;
}

pub struct PrioritySelector {
    strategies: Vec<Box<dyn Strategy>>,
}

impl Default for PrioritySelector {
    fn default() -> Self {
        Self::new(strategies::default_strategies())
    }
}

impl PrioritySelector {
    pub fn new(strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self { strategies }
    }

    pub fn tiers(&self) -> Vec<PriorityTier> {
        self.strategies.iter().map(|s| s.tier()).collect()
    }

    /// Walk the strategies in order and return the first decision.
    /// A failing tier is logged and skipped.
    pub fn select(&self, ctx: &SelectionContext) -> Option<Decision> {
        for strategy in &self.strategies {
            let tier = strategy.tier();
            match strategy.evaluate(ctx) {
                Ok(Some(decision)) => {
                    if strategy.honors_exclusions() && ctx.excludes(&decision.recommendation) {
                        debug!(tier = tier.as_str(), id = %decision.recommendation.id, "excluded");
                        continue;
                    }
                    info!(
                        learner = %ctx.snapshot.learner_id,
                        tier = tier.as_str(),
                        id = %decision.recommendation.id,
                        "selected recommendation"
                    );
                    return Some(decision);
                }
                Ok(None) => debug!(tier = tier.as_str(), "tier skipped"),
                Err(e) => warn!(tier = tier.as_str(), error = %e, "tier failed"),
            }
        }
        None
    }
}

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
