//! Per-learner review scheduling on top of the memory model.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::memory::{self, MemoryParams};
use crate::models::{
    days_between, Grade, ItemKind, ItemStats, LearningGoal, MasteryTier, QueueEntry, ReviewPhase,
    ReviewState, ScheduleResult, SkillItem,
};
use crate::store::{LearnerStore, ReviewLogEntry, ReviewStateStore};

/// Reviews a learner must have logged before their parameters are tuned.
pub const MIN_REVIEWS_FOR_OPTIMIZATION: u32 = 50;

/// An item overdue by this many multiples of its interval is relearned.
const STALE_INTERVAL_MULTIPLE: f64 = 3.0;

const MINUTES_PER_REVIEW: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub limit: usize,
    pub include_future: bool,
    pub kind: Option<ItemKind>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            limit: 20,
            include_future: false,
            kind: None,
        }
    }
}

/// How many reviews are coming up. Buckets are cumulative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewLoad {
    pub due_now: u32,
    pub within_day: u32,
    pub within_week: u32,
    pub total_items: u32,
    pub recommended_minutes: u32,
}

pub struct ReviewScheduler<'a, S> {
    store: &'a S,
    defaults: &'a MemoryParams,
}

impl<'a, S: ReviewStateStore + LearnerStore> ReviewScheduler<'a, S> {
    pub fn new(store: &'a S, defaults: &'a MemoryParams) -> Self {
        Self { store, defaults }
    }

    /// The learner's tuned parameters, or the configured defaults.
    pub fn params_for(&self, learner_id: &str) -> Result<MemoryParams> {
        Ok(self
            .store
            .learner_params(learner_id)?
            .unwrap_or_else(|| self.defaults.clone()))
    }

    pub fn schedule_review(
        &self,
        learner_id: &str,
        item: &SkillItem,
        grade: Grade,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<ScheduleResult> {
        if learner_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("learner id is empty".into()));
        }
        if item.key.trim().is_empty() {
            return Err(EngineError::InvalidInput("item key is empty".into()));
        }

        if let Some(key) = idempotency_key {
            if let Some(previous) = self.store.replay(learner_id, key)? {
                if previous.state.item != *item {
                    return Err(EngineError::InvalidInput(format!(
                        "idempotency key {} was used for {}",
                        key, previous.state.item.key
                    )));
                }
                info!(learner = learner_id, item = %item.key, key, "replayed graded review");
                return Ok(previous);
            }
        }

        let params = self.params_for(learner_id)?;
        let previous = self.store.review_state(learner_id, &item.key)?;
        let (result, elapsed_days) = advance(&params, learner_id, item, previous.as_ref(), grade, now);

        let log = ReviewLogEntry {
            learner_id: learner_id.to_string(),
            item_key: item.key.clone(),
            grade,
            reviewed_at: now,
            elapsed_days,
            retrievability: result.retention,
            idempotency_key: idempotency_key.map(String::from),
        };
        let expected_version = previous.as_ref().map(|s| s.version).unwrap_or(0);
        self.store
            .commit_review(&result, expected_version, Some(&log))?;

        info!(
            learner = learner_id,
            item = %item.key,
            grade = grade.as_str(),
            stability = result.state.stability,
            interval_days = result.interval_days,
            "graded review"
        );
        Ok(result)
    }

    /// Urgency-ranked reviews. Reads only.
    pub fn review_queue(
        &self,
        learner_id: &str,
        options: &QueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>> {
        let states = self.store.review_states(learner_id, options.kind)?;
        let mut queue: Vec<QueueEntry> = states
            .iter()
            .filter(|s| options.include_future || s.is_due(now))
            .map(|s| queue_entry(s, now))
            .collect();

        queue.sort_by(|a, b| {
            b.urgency
                .total_cmp(&a.urgency)
                .then_with(|| a.item.key.cmp(&b.item.key))
        });
        queue.truncate(options.limit);
        Ok(queue)
    }

    pub fn item_stats(
        &self,
        learner_id: &str,
        item_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ItemStats>> {
        let state = match self.store.review_state(learner_id, item_key)? {
            Some(state) => state,
            None => return Ok(None),
        };
        let success_rate = state.success_rate();
        Ok(Some(ItemStats {
            item: state.item.clone(),
            review_count: state.review_count,
            lapse_count: state.lapse_count,
            success_rate,
            stability: state.stability,
            difficulty: state.difficulty,
            retrievability: current_retrievability(&state, now),
            tier: mastery_tier(state.stability, success_rate, state.review_count),
            next_review_at: state.next_review_at,
        }))
    }

    /// Tune retention and interval range to the learner's goal. Learners
    /// with too little history keep the defaults.
    pub fn optimize_parameters(&self, learner_id: &str) -> Result<MemoryParams> {
        let reviews = self.store.logged_review_count(learner_id)?;
        if reviews < MIN_REVIEWS_FOR_OPTIMIZATION {
            debug!(learner = learner_id, reviews, "not enough history to optimize");
            return Ok(self.defaults.clone());
        }

        let goal = self
            .store
            .learner(learner_id)?
            .map(|p| p.goal)
            .unwrap_or(LearningGoal::Standard);

        let mut params = self.defaults.clone();
        match goal {
            LearningGoal::ExamPrep => {
                params.target_retention = 0.95;
                params.maximum_interval = 180.0;
            }
            LearningGoal::Casual => params.target_retention = 0.85,
            LearningGoal::Standard => params.target_retention = 0.90,
        }

        self.store.save_learner_params(learner_id, &params)?;
        info!(
            learner = learner_id,
            goal = goal.as_str(),
            target_retention = params.target_retention,
            "optimized parameters"
        );
        Ok(params)
    }

    /// Put badly overdue items back into relearning, due now.
    pub fn reset_stale_items(&self, learner_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let params = self.params_for(learner_id)?;
        let mut reset = 0;

        for state in self.store.due_review_states(learner_id, now)? {
            let threshold = STALE_INTERVAL_MULTIPLE * state.interval_days.max(1) as f64;
            if state.days_overdue(now) < threshold {
                continue;
            }

            let retention = current_retrievability(&state, now);
            let expected_version = state.version;
            let mut next = state;
            next.phase = ReviewPhase::Relearning;
            next.stability = memory::round2(memory::initial_stability(&params, Grade::Good));
            next.next_review_at = now;
            next.version += 1;

            let result = ScheduleResult {
                retention,
                tier: mastery_tier(next.stability, next.success_rate(), next.review_count),
                interval_days: next.interval_days,
                state: next,
                replayed: false,
            };
            self.store.commit_review(&result, expected_version, None)?;
            reset += 1;
        }

        if reset > 0 {
            info!(learner = learner_id, reset, "reset stale items to relearning");
        }
        Ok(reset)
    }

    pub fn review_load(&self, learner_id: &str, now: DateTime<Utc>) -> Result<ReviewLoad> {
        let states = self.store.review_states(learner_id, None)?;
        let due_by = |until: DateTime<Utc>| {
            states.iter().filter(|s| s.next_review_at <= until).count() as u32
        };

        let due_now = due_by(now);
        Ok(ReviewLoad {
            due_now,
            within_day: due_by(now + Duration::days(1)),
            within_week: due_by(now + Duration::days(7)),
            total_items: states.len() as u32,
            recommended_minutes: due_now * MINUTES_PER_REVIEW,
        })
    }
}

/// Apply one grade to an item's state. Returns the new result and the
/// elapsed days used for retrievability.
pub fn advance(
    params: &MemoryParams,
    learner_id: &str,
    item: &SkillItem,
    previous: Option<&ReviewState>,
    grade: Grade,
    now: DateTime<Utc>,
) -> (ScheduleResult, f64) {
    let (difficulty, stability, retention, elapsed) = match previous {
        None => (
            memory::initial_difficulty(params, grade),
            memory::initial_stability(params, grade),
            1.0,
            0.0,
        ),
        Some(prev) => {
            let elapsed = prev
                .last_reviewed_at
                .map(|at| days_between(at, now).max(0.0))
                .unwrap_or(0.0);
            let r = memory::retrievability(prev.stability, elapsed);
            let d = memory::update_difficulty(params, prev.difficulty, grade);
            let s = memory::update_stability(params, prev.stability, d, grade, r);
            (d, s, r, elapsed)
        }
    };

    let interval_days = memory::next_interval(params, stability, grade).round() as u32;
    let review_count = previous.map(|p| p.review_count).unwrap_or(0) + 1;
    let lapse_count = previous.map(|p| p.lapse_count).unwrap_or(0)
        + u32::from(grade == Grade::Again);

    let state = ReviewState {
        learner_id: learner_id.to_string(),
        item: item.clone(),
        difficulty: memory::round2(difficulty),
        stability: memory::round2(stability),
        review_count,
        lapse_count,
        last_reviewed_at: Some(now),
        next_review_at: now + Duration::days(interval_days as i64),
        last_grade: grade,
        interval_days,
        phase: ReviewPhase::after(grade, previous.map(|p| p.phase)),
        version: previous.map(|p| p.version).unwrap_or(0) + 1,
    };

    let tier = mastery_tier(state.stability, state.success_rate(), state.review_count);
    (
        ScheduleResult {
            retention,
            tier,
            interval_days,
            state,
            replayed: false,
        },
        elapsed,
    )
}

pub fn mastery_tier(stability: f64, success_rate: f64, review_count: u32) -> MasteryTier {
    if review_count == 0 {
        MasteryTier::New
    } else if stability > 30.0 && success_rate > 0.9 {
        MasteryTier::Mastered
    } else if stability > 14.0 && success_rate > 0.8 {
        MasteryTier::Proficient
    } else if stability > 7.0 && success_rate > 0.7 {
        MasteryTier::Familiar
    } else if review_count > 3 && success_rate < 0.5 {
        MasteryTier::Struggling
    } else {
        MasteryTier::Learning
    }
}

fn current_retrievability(state: &ReviewState, now: DateTime<Utc>) -> f64 {
    let elapsed = state
        .last_reviewed_at
        .map(|at| days_between(at, now))
        .unwrap_or(0.0);
    memory::retrievability(state.stability, elapsed)
}

fn queue_entry(state: &ReviewState, now: DateTime<Utc>) -> QueueEntry {
    let days_overdue = state.days_overdue(now);
    QueueEntry {
        item: state.item.clone(),
        urgency: memory::urgency(state.stability, days_overdue),
        overdue: days_overdue > 0.0,
        days_overdue,
        retrievability: current_retrievability(state, now),
        stability: state.stability,
        next_review_at: state.next_review_at,
    }
}
