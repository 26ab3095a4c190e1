//! Persistence seams. The engine only talks to these traits; `Database`
//! implements all of them on SQLite.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::memory::MemoryParams;
use crate::models::{
    Grade, ItemKind, LabAttempt, LearnerProfile, MasteryRecord, ResponseRecord, ReviewState,
    ScheduleResult, SessionState,
};

/// One graded review, appended alongside the state write.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewLogEntry {
    pub learner_id: String,
    pub item_key: String,
    pub grade: Grade,
    pub reviewed_at: DateTime<Utc>,
    pub elapsed_days: f64,
    pub retrievability: f64,
    pub idempotency_key: Option<String>,
}

pub trait ReviewStateStore {
    fn review_state(&self, learner_id: &str, item_key: &str) -> Result<Option<ReviewState>>;

    fn review_states(&self, learner_id: &str, kind: Option<ItemKind>) -> Result<Vec<ReviewState>>;

    /// States whose next review falls at or before `until`.
    fn due_review_states(&self, learner_id: &str, until: DateTime<Utc>)
        -> Result<Vec<ReviewState>>;

    fn lapsed_review_states(&self, learner_id: &str, min_lapses: u32) -> Result<Vec<ReviewState>>;

    /// Compare-and-swap write of `result.state`. Succeeds only when the stored
    /// version equals `expected_version` (0 for a state not stored yet).
    /// When `log` is given it is appended in the same transaction.
    fn commit_review(
        &self,
        result: &ScheduleResult,
        expected_version: u32,
        log: Option<&ReviewLogEntry>,
    ) -> Result<()>;

    /// The result stored for an idempotency key, if that key was seen before.
    fn replay(&self, learner_id: &str, idempotency_key: &str) -> Result<Option<ScheduleResult>>;

    fn logged_review_count(&self, learner_id: &str) -> Result<u32>;
}

pub trait MasteryStore {
    fn mastery(&self, learner_id: &str, skill: &str) -> Result<Option<MasteryRecord>>;

    fn masteries(&self, learner_id: &str) -> Result<Vec<MasteryRecord>>;

    /// Records whose raw score lies in `[min, max)`.
    fn masteries_in_band(&self, learner_id: &str, min: f64, max: f64)
        -> Result<Vec<MasteryRecord>>;

    fn save_mastery(&self, record: &MasteryRecord) -> Result<()>;
}

pub trait SessionStore {
    fn active_session(&self, learner_id: &str) -> Result<Option<SessionState>>;

    fn session(&self, session_id: i64) -> Result<Option<SessionState>>;

    /// Close any open session for the learner and start a fresh one.
    fn start_session(&self, learner_id: &str, now: DateTime<Utc>) -> Result<SessionState>;

    fn save_session(&self, session: &SessionState) -> Result<()>;

    fn close_session(&self, session_id: i64, now: DateTime<Utc>) -> Result<bool>;

    fn record_response(&self, response: &ResponseRecord) -> Result<()>;

    fn responses_since(
        &self,
        learner_id: &str,
        since: DateTime<Utc>,
        exclude_session: Option<i64>,
    ) -> Result<Vec<ResponseRecord>>;
}

pub trait LabAttemptStore {
    fn record_lab_attempt(&self, attempt: &LabAttempt) -> Result<i64>;

    /// Newest first.
    fn lab_attempts(&self, learner_id: &str) -> Result<Vec<LabAttempt>>;
}

pub trait LearnerStore {
    fn learner(&self, learner_id: &str) -> Result<Option<LearnerProfile>>;

    fn save_learner(&self, profile: &LearnerProfile) -> Result<()>;

    fn learner_params(&self, learner_id: &str) -> Result<Option<MemoryParams>>;

    fn save_learner_params(&self, learner_id: &str, params: &MemoryParams) -> Result<()>;
}

pub trait Store:
    ReviewStateStore + MasteryStore + SessionStore + LabAttemptStore + LearnerStore
{
}

impl<T> Store for T where
    T: ReviewStateStore + MasteryStore + SessionStore + LabAttemptStore + LearnerStore
{
}
