//! Command proficiency: decay, attempt recording and the remedial gate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::canonical;
use crate::config::{DecayConfig, GateConfig};
use crate::error::Result;
use crate::models::{days_between, MasteryRecord, RiskLevel};
use crate::store::MasteryStore;

/// Time-based decay of a 0..100 proficiency score.
///
/// Implementations must return `score` unchanged when no time has elapsed
/// and must never increase as elapsed time grows.
pub trait DecayFunction {
    fn decayed_score(
        &self,
        score: f64,
        last_used_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> f64;

    /// New raw score after an attempt made at decayed score `current`.
    fn score_attempt(&self, current: f64, success: bool) -> f64;
}

/// Exponential forgetting with a grace window after practice and a
/// muscle-memory floor that decay never crosses.
#[derive(Debug, Clone, Default)]
pub struct ForgettingCurveDecay {
    config: DecayConfig,
}

impl ForgettingCurveDecay {
    pub fn new(config: DecayConfig) -> Self {
        Self { config }
    }
}

impl DecayFunction for ForgettingCurveDecay {
    fn decayed_score(
        &self,
        score: f64,
        last_used_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> f64 {
        let last_used_at = match last_used_at {
            Some(at) => at,
            None => return score,
        };
        if (now - last_used_at).num_minutes() < self.config.grace_minutes {
            return score;
        }

        let days = days_between(last_used_at, now);
        let decayed = score * (-days / self.config.strength_days).exp();
        decayed.max(score.min(self.config.muscle_memory_floor))
    }

    fn score_attempt(&self, current: f64, success: bool) -> f64 {
        let next = if success {
            current + self.config.success_gain
        } else {
            current - self.config.failure_penalty
        };
        next.clamp(0.0, 100.0)
    }
}

/// A mastery record together with its score at read time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecayedMastery {
    pub record: MasteryRecord,
    pub decayed_score: f64,
}

impl DecayedMastery {
    pub fn skill(&self) -> &str {
        &self.record.skill
    }

    pub fn risk(&self) -> RiskLevel {
        RiskLevel::for_score(self.decayed_score)
    }
}

pub fn decay_all(
    records: Vec<MasteryRecord>,
    decay: &dyn DecayFunction,
    now: DateTime<Utc>,
) -> Vec<DecayedMastery> {
    records
        .into_iter()
        .map(|record| {
            let decayed_score =
                decay.decayed_score(record.proficiency_score, record.last_used_at, now);
            DecayedMastery {
                record,
                decayed_score,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptContext {
    Practice,
    Quiz,
    Lab,
    Remedial,
    Review,
}

impl AttemptContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptContext::Practice => "practice",
            AttemptContext::Quiz => "quiz",
            AttemptContext::Lab => "lab",
            AttemptContext::Remedial => "remedial",
            AttemptContext::Review => "review",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "practice" => Some(AttemptContext::Practice),
            "quiz" => Some(AttemptContext::Quiz),
            "lab" => Some(AttemptContext::Lab),
            "remedial" | "drill" => Some(AttemptContext::Remedial),
            "review" => Some(AttemptContext::Review),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HintLevel {
    Full,
    Partial,
    Minimal,
    #[serde(rename = "none")]
    NoHints,
}

impl HintLevel {
    pub fn for_score(score: f64) -> Self {
        if score <= 30.0 {
            HintLevel::Full
        } else if score <= 60.0 {
            HintLevel::Partial
        } else if score <= 90.0 {
            HintLevel::Minimal
        } else {
            HintLevel::NoHints
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseType {
    GuidedTutorial,
    FillInBlank,
    MultipleChoice,
    FreeForm,
}

impl ExerciseType {
    pub fn for_record(score: f64, total_attempts: u32) -> Self {
        if total_attempts == 0 {
            ExerciseType::GuidedTutorial
        } else if score < 50.0 {
            ExerciseType::FillInBlank
        } else if score < 80.0 {
            ExerciseType::MultipleChoice
        } else {
            ExerciseType::FreeForm
        }
    }
}

pub fn attempts_needed(score: f64) -> u32 {
    if score >= 90.0 {
        1
    } else if score >= 70.0 {
        2
    } else if score >= 50.0 {
        3
    } else {
        4
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemedialDrill {
    pub skill: String,
    pub label: String,
    pub current_score: f64,
    pub attempts_needed: u32,
    pub hint_level: HintLevel,
    pub exercise_type: ExerciseType,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GateResult {
    Ok {
        skills: Vec<String>,
    },
    Blocked {
        blocked_skills: Vec<String>,
        remedial_drills: Vec<RemedialDrill>,
    },
}

impl GateResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, GateResult::Ok { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryBreakdown {
    pub category: String,
    pub total: usize,
    pub mastered: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillStatus {
    pub skill: String,
    pub label: String,
    pub category: String,
    pub raw_score: f64,
    pub decayed_score: f64,
    pub risk: RiskLevel,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterySummary {
    pub total: usize,
    pub mastered: usize,
    pub needs_practice: usize,
    pub mastery_percentage: f64,
    pub categories: Vec<CategoryBreakdown>,
    /// Weakest first.
    pub skills: Vec<SkillStatus>,
}

const SUMMARY_CATEGORIES: [&str; 3] = ["docker", "docker-compose", "kubernetes"];

// Below this decayed score a skill counts as needing practice.
const NEEDS_PRACTICE_BELOW: f64 = 70.0;

pub struct MasteryGate<'a, S> {
    store: &'a S,
    decay: &'a dyn DecayFunction,
    config: &'a GateConfig,
}

impl<'a, S: MasteryStore> MasteryGate<'a, S> {
    pub fn new(store: &'a S, decay: &'a dyn DecayFunction, config: &'a GateConfig) -> Self {
        Self {
            store,
            decay,
            config,
        }
    }

    /// Record one attempt at a raw command. Returns `None` for input that
    /// does not canonicalize; that is expected for free-text practice.
    pub fn record_attempt(
        &self,
        learner_id: &str,
        raw: &str,
        success: bool,
        context: AttemptContext,
        now: DateTime<Utc>,
    ) -> Result<Option<MasteryRecord>> {
        let skill = match canonical::canonicalize(raw) {
            Some(skill) => skill,
            None => {
                warn!(learner = learner_id, command = raw, "unrecognized command");
                return Ok(None);
            }
        };

        let mut record = self
            .store
            .mastery(learner_id, &skill)?
            .unwrap_or_else(|| MasteryRecord::new(learner_id, &skill, canonical::category(&skill)));

        let current =
            self.decay
                .decayed_score(record.proficiency_score, record.last_used_at, now);
        record.proficiency_score = self.decay.score_attempt(current, success);
        record.total_attempts += 1;
        if success {
            record.successful_attempts += 1;
            record.consecutive_failures = 0;
        } else {
            record.consecutive_failures += 1;
        }
        record.last_used_at = Some(now);

        self.store.save_mastery(&record)?;
        debug!(
            learner = learner_id,
            skill = %skill,
            success,
            context = context.as_str(),
            score = record.proficiency_score,
            "recorded attempt"
        );
        Ok(Some(record))
    }

    pub fn is_mastered(&self, decayed_score: f64) -> bool {
        decayed_score >= self.config.mastery_threshold
    }

    /// Decay each required skill, then block on any below the threshold.
    pub fn check_remedial_gate(
        &self,
        learner_id: &str,
        required_skills: &[String],
        now: DateTime<Utc>,
    ) -> Result<GateResult> {
        let mut skills: Vec<String> = Vec::new();
        for skill in required_skills {
            if !skills.contains(skill) {
                skills.push(skill.clone());
            }
        }

        let mut blocked_skills = Vec::new();
        let mut remedial_drills = Vec::new();

        for skill in &skills {
            let record = self.store.mastery(learner_id, skill)?;
            let (score, attempts) = match &record {
                Some(r) => (
                    self.decay
                        .decayed_score(r.proficiency_score, r.last_used_at, now),
                    r.total_attempts,
                ),
                None => (0.0, 0),
            };

            if self.is_mastered(score) {
                continue;
            }

            blocked_skills.push(skill.clone());
            remedial_drills.push(RemedialDrill {
                skill: skill.clone(),
                label: canonical::label(skill),
                current_score: round1(score),
                attempts_needed: attempts_needed(score),
                hint_level: HintLevel::for_score(score),
                exercise_type: ExerciseType::for_record(score, attempts),
                examples: canonical::examples(skill)
                    .iter()
                    .map(|e| e.to_string())
                    .collect(),
            });
        }

        if blocked_skills.is_empty() {
            Ok(GateResult::Ok { skills })
        } else {
            debug!(learner = learner_id, blocked = blocked_skills.len(), "remedial gate blocked");
            Ok(GateResult::Blocked {
                blocked_skills,
                remedial_drills,
            })
        }
    }

    pub fn mastery_summary(&self, learner_id: &str, now: DateTime<Utc>) -> Result<MasterySummary> {
        let decayed = decay_all(self.store.masteries(learner_id)?, self.decay, now);

        let total = decayed.len();
        let mastered = decayed
            .iter()
            .filter(|m| self.is_mastered(m.decayed_score))
            .count();
        let needs_practice = decayed
            .iter()
            .filter(|m| m.decayed_score < NEEDS_PRACTICE_BELOW)
            .count();

        let categories = SUMMARY_CATEGORIES
            .iter()
            .map(|category| {
                let in_category: Vec<_> = decayed
                    .iter()
                    .filter(|m| m.record.category == *category)
                    .collect();
                let mastered = in_category
                    .iter()
                    .filter(|m| self.is_mastered(m.decayed_score))
                    .count();
                CategoryBreakdown {
                    category: category.to_string(),
                    total: in_category.len(),
                    mastered,
                    percentage: percentage(mastered, in_category.len()),
                }
            })
            .collect();

        let mut skills: Vec<SkillStatus> = decayed
            .iter()
            .map(|m| SkillStatus {
                skill: m.record.skill.clone(),
                label: canonical::label(&m.record.skill),
                category: m.record.category.clone(),
                raw_score: m.record.proficiency_score,
                decayed_score: round1(m.decayed_score),
                risk: m.risk(),
                last_used_at: m.record.last_used_at,
            })
            .collect();
        skills.sort_by(|a, b| {
            a.decayed_score
                .total_cmp(&b.decayed_score)
                .then_with(|| a.skill.cmp(&b.skill))
        });

        Ok(MasterySummary {
            total,
            mastered,
            needs_practice,
            mastery_percentage: percentage(mastered, total),
            categories,
            skills,
        })
    }
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64 * 10_000.0).round() / 100.0
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::{Duration, TimeZone};

    fn setup_db() -> Database {
        let db = Database::open(":memory:").expect("Failed to create in-memory database");
        db.init().expect("Failed to initialize database");
        db
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    mod decay_tests {
        use super::*;

        #[test]
        fn identity_without_elapsed_time() {
            let decay = ForgettingCurveDecay::default();
            assert_eq!(decay.decayed_score(80.0, Some(t0()), t0()), 80.0);
            assert_eq!(decay.decayed_score(80.0, None, t0()), 80.0);
        }

        #[test]
        fn grace_window_holds_score() {
            let decay = ForgettingCurveDecay::default();
            let score = decay.decayed_score(90.0, Some(t0()), t0() + Duration::minutes(59));
            assert_eq!(score, 90.0);
        }

        #[test]
        fn monotone_non_increasing() {
            let decay = ForgettingCurveDecay::default();
            for start in [10.0, 45.0, 100.0] {
                let mut previous = start;
                for hours in (0..24 * 60).step_by(7) {
                    let now = t0() + Duration::hours(hours);
                    let score = decay.decayed_score(start, Some(t0()), now);
                    assert!(score <= previous, "start {} hours {}", start, hours);
                    assert!(score <= start);
                    previous = score;
                }
            }
        }

        #[test]
        fn floor_is_respected() {
            let decay = ForgettingCurveDecay::default();
            let far = t0() + Duration::days(365);
            assert_eq!(decay.decayed_score(100.0, Some(t0()), far), 40.0);
            // Scores under the floor never rise to it.
            assert_eq!(decay.decayed_score(25.0, Some(t0()), far), 25.0);
        }

        #[test]
        fn one_week_is_one_e_fold() {
            let decay = ForgettingCurveDecay::default();
            let score = decay.decayed_score(100.0, Some(t0()), t0() + Duration::days(7));
            assert!((score - 100.0 / std::f64::consts::E).abs() < 1e-9);
        }

        #[test]
        fn attempt_scoring_is_clamped() {
            let decay = ForgettingCurveDecay::default();
            assert_eq!(decay.score_attempt(90.0, true), 100.0);
            assert_eq!(decay.score_attempt(5.0, false), 0.0);
            assert_eq!(decay.score_attempt(50.0, true), 75.0);
        }
    }

    mod record_tests {
        use super::*;

        #[test]
        fn creates_record_on_first_sight() {
            let db = setup_db();
            let decay = ForgettingCurveDecay::default();
            let config = GateConfig::default();
            let gate = MasteryGate::new(&db, &decay, &config);

            let record = gate
                .record_attempt("ada", "docker container ls -a", true, AttemptContext::Practice, t0())
                .unwrap()
                .unwrap();
            assert_eq!(record.skill, "docker_ps");
            assert_eq!(record.category, "docker");
            assert_eq!(record.proficiency_score, 25.0);
            assert_eq!(record.total_attempts, 1);
            assert_eq!(db.mastery("ada", "docker_ps").unwrap().unwrap(), record);
        }

        #[test]
        fn failures_track_streak() {
            let db = setup_db();
            let decay = ForgettingCurveDecay::default();
            let config = GateConfig::default();
            let gate = MasteryGate::new(&db, &decay, &config);

            for success in [true, true, false, false] {
                gate.record_attempt("ada", "docker run nginx", success, AttemptContext::Quiz, t0())
                    .unwrap();
            }
            let record = db.mastery("ada", "docker_run").unwrap().unwrap();
            assert_eq!(record.proficiency_score, 30.0);
            assert_eq!(record.total_attempts, 4);
            assert_eq!(record.successful_attempts, 2);
            assert_eq!(record.consecutive_failures, 2);

            gate.record_attempt("ada", "docker run nginx", true, AttemptContext::Quiz, t0())
                .unwrap();
            let record = db.mastery("ada", "docker_run").unwrap().unwrap();
            assert_eq!(record.consecutive_failures, 0);
        }

        #[test]
        fn attempt_scores_from_decayed_value() {
            let db = setup_db();
            let decay = ForgettingCurveDecay::default();
            let config = GateConfig::default();
            let gate = MasteryGate::new(&db, &decay, &config);
            for _ in 0..4 {
                gate.record_attempt("ada", "docker ps", true, AttemptContext::Practice, t0())
                    .unwrap();
            }

            let later = t0() + Duration::days(3);
            let record = gate
                .record_attempt("ada", "docker ps", true, AttemptContext::Review, later)
                .unwrap()
                .unwrap();
            let expected = 100.0 * (-3.0f64 / 7.0).exp() + 25.0;
            assert!((record.proficiency_score - expected).abs() < 1e-9);
        }

        #[test]
        fn unrecognized_command_is_none() {
            let db = setup_db();
            let decay = ForgettingCurveDecay::default();
            let config = GateConfig::default();
            let gate = MasteryGate::new(&db, &decay, &config);

            let result = gate
                .record_attempt("ada", "rm -rf /tmp/x", true, AttemptContext::Practice, t0())
                .unwrap();
            assert!(result.is_none());
            assert!(db.masteries("ada").unwrap().is_empty());
        }
    }

    mod gate_tests {
        use super::*;

        fn practiced(db: &Database, successes: usize, at: DateTime<Utc>) {
            let decay = ForgettingCurveDecay::default();
            let config = GateConfig::default();
            let gate = MasteryGate::new(db, &decay, &config);
            for _ in 0..successes {
                gate.record_attempt("ada", "docker ps", true, AttemptContext::Practice, at)
                    .unwrap();
            }
        }

        #[test]
        fn empty_requirements_pass() {
            let db = setup_db();
            let decay = ForgettingCurveDecay::default();
            let config = GateConfig::default();
            let gate = MasteryGate::new(&db, &decay, &config);
            assert!(gate.check_remedial_gate("ada", &[], t0()).unwrap().is_ok());
        }

        #[test]
        fn fresh_mastery_passes() {
            let db = setup_db();
            practiced(&db, 4, t0());
            let decay = ForgettingCurveDecay::default();
            let config = GateConfig::default();
            let gate = MasteryGate::new(&db, &decay, &config);

            let result = gate
                .check_remedial_gate("ada", &["docker_ps".to_string()], t0() + Duration::minutes(30))
                .unwrap();
            assert_eq!(
                result,
                GateResult::Ok {
                    skills: vec!["docker_ps".to_string()]
                }
            );
        }

        #[test]
        fn decay_blocks_with_drills() {
            let db = setup_db();
            practiced(&db, 4, t0());
            let decay = ForgettingCurveDecay::default();
            let config = GateConfig::default();
            let gate = MasteryGate::new(&db, &decay, &config);

            let required = vec![
                "docker_ps".to_string(),
                "docker_run".to_string(),
                "docker_ps".to_string(),
            ];
            let result = gate
                .check_remedial_gate("ada", &required, t0() + Duration::days(2))
                .unwrap();

            match result {
                GateResult::Blocked {
                    blocked_skills,
                    remedial_drills,
                } => {
                    assert_eq!(blocked_skills, vec!["docker_ps", "docker_run"]);
                    let ps = &remedial_drills[0];
                    assert_eq!(ps.attempts_needed, 2);
                    assert_eq!(ps.hint_level, HintLevel::Minimal);
                    assert_eq!(ps.exercise_type, ExerciseType::MultipleChoice);
                    assert_eq!(ps.examples.len(), 3);
                    let run = &remedial_drills[1];
                    assert_eq!(run.current_score, 0.0);
                    assert_eq!(run.attempts_needed, 4);
                    assert_eq!(run.hint_level, HintLevel::Full);
                    assert_eq!(run.exercise_type, ExerciseType::GuidedTutorial);
                    assert_eq!(run.label, "Docker Run");
                }
                other => panic!("expected blocked, got {:?}", other),
            }
        }

        #[test]
        fn serializes_with_status_tag() {
            let json = serde_json::to_value(GateResult::Ok { skills: vec![] }).unwrap();
            assert_eq!(json["status"], "ok");
        }

        #[test]
        fn bands() {
            assert_eq!(attempts_needed(95.0), 1);
            assert_eq!(attempts_needed(70.0), 2);
            assert_eq!(attempts_needed(50.0), 3);
            assert_eq!(attempts_needed(49.9), 4);
            assert_eq!(HintLevel::for_score(30.0), HintLevel::Full);
            assert_eq!(HintLevel::for_score(95.0), HintLevel::NoHints);
            assert_eq!(ExerciseType::for_record(85.0, 3), ExerciseType::FreeForm);
            assert_eq!(ExerciseType::for_record(20.0, 3), ExerciseType::FillInBlank);
        }
    }

    #[test]
    fn summary_counts_and_orders() {
        let db = setup_db();
        let decay = ForgettingCurveDecay::default();
        let config = GateConfig::default();
        let gate = MasteryGate::new(&db, &decay, &config);
        for _ in 0..4 {
            gate.record_attempt("ada", "docker ps", true, AttemptContext::Practice, t0())
                .unwrap();
        }
        gate.record_attempt("ada", "kubectl get pods", true, AttemptContext::Practice, t0())
            .unwrap();

        let summary = gate.mastery_summary("ada", t0()).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.mastered, 1);
        assert_eq!(summary.needs_practice, 1);
        assert_eq!(summary.mastery_percentage, 50.0);
        assert_eq!(summary.skills[0].skill, "kubectl_get_pods");
        assert_eq!(summary.skills[0].risk, RiskLevel::Critical);
        let docker = &summary.categories[0];
        assert_eq!((docker.total, docker.mastered, docker.percentage), (1, 1, 100.0));
    }
}
