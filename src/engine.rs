//! The entry points callers use: next content, apply, grading and the gate.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::canonical;
use crate::config::EngineConfig;
use crate::content::ContentLibrary;
use crate::error::{EngineError, Result};
use crate::mastery::{
    decay_all, AttemptContext, DecayFunction, ForgettingCurveDecay, GateResult, MasteryGate,
    MasterySummary,
};
use crate::models::{
    Grade, LabAttempt, LearnerProfile, LearningGoal, MasteryRecord, ResponseRecord,
    ScheduleResult, SessionState, SkillItem, Track,
};
use crate::scheduler::ReviewScheduler;
use crate::selector::{
    Decision, LearnerSnapshot, PrioritySelector, RandomSource, SelectionContext,
    SelectionRequest, SessionEffect, ThreadRandom,
};
use crate::store::Store;
use crate::struggle::{LabSession, StruggleAnalyzer, StruggleReport};

pub struct Engine<S> {
    store: S,
    library: Box<dyn ContentLibrary>,
    config: EngineConfig,
    decay: Box<dyn DecayFunction>,
    random: Box<dyn RandomSource>,
    selector: PrioritySelector,
}

impl<S: Store> Engine<S> {
    /// Validates the configuration before anything runs.
    pub fn new(store: S, library: Box<dyn ContentLibrary>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let decay = Box::new(ForgettingCurveDecay::new(config.decay.clone()));
        Ok(Self {
            store,
            library,
            config,
            decay,
            random: Box::new(ThreadRandom),
            selector: PrioritySelector::default(),
        })
    }

    pub fn with_random(mut self, random: Box<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_decay(mut self, decay: Box<dyn DecayFunction>) -> Self {
        self.decay = decay;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn library(&self) -> &dyn ContentLibrary {
        self.library.as_ref()
    }

    pub fn scheduler(&self) -> ReviewScheduler<'_, S> {
        ReviewScheduler::new(&self.store, &self.config.memory)
    }

    pub fn gate(&self) -> MasteryGate<'_, S> {
        MasteryGate::new(&self.store, self.decay.as_ref(), &self.config.gate)
    }

    pub fn profile(&self, learner_id: &str) -> Result<LearnerProfile> {
        Ok(self.store.learner(learner_id)?.unwrap_or_else(|| LearnerProfile {
            id: learner_id.to_string(),
            goal: LearningGoal::Standard,
            track: Track::Docker,
        }))
    }

    pub fn set_profile(&self, learner_id: &str, goal: Option<LearningGoal>, track: Option<Track>) -> Result<LearnerProfile> {
        let mut profile = self.profile(learner_id)?;
        if let Some(goal) = goal {
            profile.goal = goal;
        }
        if let Some(track) = track {
            profile.track = track;
        }
        self.store.save_learner(&profile)?;
        Ok(profile)
    }

    /// Everything the cascade reads, loaded once.
    pub fn snapshot(&self, learner_id: &str, now: DateTime<Utc>) -> Result<LearnerSnapshot> {
        let profile = self.profile(learner_id)?;
        let masteries = decay_all(self.store.masteries(learner_id)?, self.decay.as_ref(), now);
        let session = self.store.active_session(learner_id)?;
        let lab_attempts = self.store.lab_attempts(learner_id)?;
        let since = now - Duration::hours(self.config.selector.failed_recent_window_hours);
        let recent_responses =
            self.store
                .responses_since(learner_id, since, session.as_ref().map(|s| s.id))?;

        Ok(LearnerSnapshot {
            learner_id: learner_id.to_string(),
            track: profile.track,
            now,
            masteries,
            session,
            lab_attempts,
            recent_responses,
        })
    }

    /// Pick what to show next. Nothing is written; pass the decision's
    /// effects to [`Engine::apply`] once it is accepted.
    pub fn next_content(
        &self,
        learner_id: &str,
        request: &SelectionRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<Decision>> {
        if learner_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("learner id is empty".into()));
        }
        let snapshot = self.snapshot(learner_id, now)?;
        let ctx = SelectionContext::new(
            &snapshot,
            request,
            self.library.as_ref(),
            &self.config.selector,
            self.random.as_ref(),
        );
        let decision = self.selector.select(&ctx);
        if decision.is_none() {
            info!(learner = learner_id, "cascade exhausted");
        }
        Ok(decision)
    }

    /// Persist cooldown checkpoints. Returns false when there is no active
    /// session to write them to.
    pub fn apply(&self, learner_id: &str, effects: &[SessionEffect]) -> Result<bool> {
        if effects.is_empty() {
            return Ok(true);
        }
        let mut session = match self.store.active_session(learner_id)? {
            Some(session) => session,
            None => return Ok(false),
        };
        for effect in effects {
            effect.apply_to(&mut session);
        }
        self.store.save_session(&session)?;
        info!(learner = learner_id, effects = effects.len(), "applied session effects");
        Ok(true)
    }

    /// Apply a decision's effects and count it as presented.
    pub fn accept(&self, learner_id: &str, decision: &Decision, now: DateTime<Utc>) -> Result<()> {
        self.apply(learner_id, &decision.effects)?;
        if let Some(mut session) = self.store.active_session(learner_id)? {
            session.items_presented += 1;
            session.updated_at = now;
            self.store.save_session(&session)?;
        }
        Ok(())
    }

    pub fn grade_review(
        &self,
        learner_id: &str,
        item: &SkillItem,
        grade: Grade,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<ScheduleResult> {
        self.scheduler()
            .schedule_review(learner_id, item, grade, now, idempotency_key)
    }

    pub fn record_attempt(
        &self,
        learner_id: &str,
        raw: &str,
        success: bool,
        context: AttemptContext,
        now: DateTime<Utc>,
    ) -> Result<Option<MasteryRecord>> {
        self.gate().record_attempt(learner_id, raw, success, context, now)
    }

    pub fn remedial_gate(
        &self,
        learner_id: &str,
        required_skills: &[String],
        now: DateTime<Utc>,
    ) -> Result<GateResult> {
        self.gate().check_remedial_gate(learner_id, required_skills, now)
    }

    pub fn mastery_summary(&self, learner_id: &str, now: DateTime<Utc>) -> Result<MasterySummary> {
        self.gate().mastery_summary(learner_id, now)
    }

    /// Score a finished lab and store the attempt with its retry cooldown.
    /// Failed commands may be raw; they are canonicalized where possible.
    pub fn record_lab_attempt(
        &self,
        learner_id: &str,
        lab_id: &str,
        session: &LabSession,
        passed: bool,
        failed_commands: &[String],
        now: DateTime<Utc>,
    ) -> Result<(LabAttempt, StruggleReport)> {
        let analyzer = StruggleAnalyzer::new(session, &self.config.struggle);
        let report = analyzer.report();

        let mut failed_skills: Vec<String> = Vec::new();
        for raw in failed_commands {
            let skill = canonical::canonicalize(raw).unwrap_or_else(|| raw.trim().to_string());
            if !skill.is_empty() && !failed_skills.contains(&skill) {
                failed_skills.push(skill);
            }
        }

        let mut attempt = LabAttempt {
            id: 0,
            learner_id: learner_id.to_string(),
            lab_id: lab_id.to_string(),
            passed,
            struggle_score: report.struggle_score,
            failed_skills,
            attempted_at: now,
            retry_available_at: analyzer.retry_available_at(passed, now),
        };
        attempt.id = self.store.record_lab_attempt(&attempt)?;

        info!(
            learner = learner_id,
            lab = lab_id,
            passed,
            struggle = report.struggle_score,
            "recorded lab attempt"
        );
        Ok((attempt, report))
    }

    pub fn start_session(&self, learner_id: &str, now: DateTime<Utc>) -> Result<SessionState> {
        let session = self.store.start_session(learner_id, now)?;
        debug!(learner = learner_id, session = session.id, "started session");
        Ok(session)
    }

    pub fn close_session(&self, learner_id: &str, now: DateTime<Utc>) -> Result<bool> {
        match self.store.active_session(learner_id)? {
            Some(session) => self.store.close_session(session.id, now),
            None => Ok(false),
        }
    }

    fn require_session(&self, learner_id: &str) -> Result<SessionState> {
        self.store
            .active_session(learner_id)?
            .ok_or_else(|| EngineError::InvalidInput(format!("no active session for {}", learner_id)))
    }

    /// Point the session at a chapter, defaulting to its first micro not
    /// yet completed.
    pub fn goto(
        &self,
        learner_id: &str,
        chapter: &str,
        micro_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionState> {
        let mut session = self.require_session(learner_id)?;
        let micro = match micro_id {
            Some(id) => self.library.micro(chapter, id),
            None => {
                let micros = self.library.micros(chapter);
                micros
                    .iter()
                    .find(|m| !session.has_completed(chapter, &m.id))
                    .or_else(|| micros.first())
                    .cloned()
            }
        }
        .ok_or_else(|| EngineError::InvalidInput(format!("unknown chapter or micro: {}", chapter)))?;

        session.current_chapter = Some(chapter.to_string());
        session.current_micro_id = Some(micro.id);
        session.updated_at = now;
        self.store.save_session(&session)?;
        Ok(session)
    }

    /// Move to the first path chapter the session has not learned yet.
    pub fn goto_next(&self, learner_id: &str, now: DateTime<Utc>) -> Result<SessionState> {
        let session = self.require_session(learner_id)?;
        let chapter = self
            .library
            .next_chapter(&session.completed_micros)
            .ok_or_else(|| EngineError::InvalidInput("the course has no chapters".into()))?;
        self.goto(learner_id, &chapter, None, now)
    }

    pub fn complete_micro(
        &self,
        learner_id: &str,
        chapter: &str,
        micro_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionState> {
        let mut session = self.require_session(learner_id)?;
        session
            .completed_micros
            .entry(chapter.to_string())
            .or_default()
            .insert(micro_id.to_string());
        session.updated_at = now;
        self.store.save_session(&session)?;
        Ok(session)
    }

    /// Log an answer against the session's current chapter and micro.
    pub fn answer(
        &self,
        learner_id: &str,
        item_id: &str,
        correct: bool,
        now: DateTime<Utc>,
    ) -> Result<ResponseRecord> {
        let mut session = self.require_session(learner_id)?;
        let response = ResponseRecord {
            session_id: session.id,
            item_id: item_id.to_string(),
            chapter: session.current_chapter.clone(),
            micro_id: session.current_micro_id.clone(),
            correct,
            answered_at: now,
        };
        self.store.record_response(&response)?;
        session.updated_at = now;
        self.store.save_session(&session)?;
        Ok(response)
    }
}
