use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// Review grades, FSRS numbering (1 = again .. 4 = easy)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    Again = 1,
    Hard = 2,
    Good = 3,
    Easy = 4,
}

impl Grade {
    pub const ALL: [Grade; 4] = [Grade::Again, Grade::Hard, Grade::Good, Grade::Easy];

    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Zero-based position, for indexing per-grade parameter tables.
    pub fn index(&self) -> usize {
        self.value() as usize - 1
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Grade::Good | Grade::Easy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::Again => "again",
            Grade::Hard => "hard",
            Grade::Good => "good",
            Grade::Easy => "easy",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "again" | "a" | "1" => Some(Grade::Again),
            "hard" | "h" | "2" => Some(Grade::Hard),
            "good" | "g" | "3" => Some(Grade::Good),
            "easy" | "e" | "4" => Some(Grade::Easy),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::from_str(s).ok_or_else(|| EngineError::InvalidGrade(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Command,
    Concept,
    Lab,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Command => "command",
            ItemKind::Concept => "concept",
            ItemKind::Lab => "lab",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "command" | "cmd" => Some(ItemKind::Command),
            "concept" => Some(ItemKind::Concept),
            "lab" => Some(ItemKind::Lab),
            _ => None,
        }
    }
}

/// One learnable unit, identified by its canonical key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SkillItem {
    pub key: String,
    pub kind: ItemKind,
}

impl SkillItem {
    pub fn command(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ItemKind::Command,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPhase {
    Learning,
    Review,
    Relearning,
}

impl ReviewPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewPhase::Learning => "learning",
            ReviewPhase::Review => "review",
            ReviewPhase::Relearning => "relearning",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "learning" => Some(ReviewPhase::Learning),
            "review" => Some(ReviewPhase::Review),
            "relearning" => Some(ReviewPhase::Relearning),
            _ => None,
        }
    }

    /// Phase after grading, given the phase before it (None for a new item).
    pub fn after(grade: Grade, previous: Option<ReviewPhase>) -> Self {
        match grade {
            Grade::Again => ReviewPhase::Relearning,
            Grade::Hard => ReviewPhase::Learning,
            Grade::Good | Grade::Easy => match previous {
                None => ReviewPhase::Learning,
                Some(_) => ReviewPhase::Review,
            },
        }
    }
}

/// Memory state for one learner and one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewState {
    pub learner_id: String,
    pub item: SkillItem,
    pub difficulty: f64,
    pub stability: f64,
    pub review_count: u32,
    pub lapse_count: u32,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub next_review_at: DateTime<Utc>,
    pub last_grade: Grade,
    pub interval_days: u32,
    pub phase: ReviewPhase,
    pub version: u32,
}

impl ReviewState {
    pub fn success_rate(&self) -> f64 {
        if self.review_count == 0 {
            0.0
        } else {
            (self.review_count - self.lapse_count) as f64 / self.review_count as f64
        }
    }

    /// Fractional days past the due date; negative while not yet due.
    pub fn days_overdue(&self, now: DateTime<Utc>) -> f64 {
        days_between(self.next_review_at, now)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasteryTier {
    New,
    Struggling,
    Learning,
    Familiar,
    Proficient,
    Mastered,
}

impl MasteryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasteryTier::New => "new",
            MasteryTier::Struggling => "struggling",
            MasteryTier::Learning => "learning",
            MasteryTier::Familiar => "familiar",
            MasteryTier::Proficient => "proficient",
            MasteryTier::Mastered => "mastered",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MasteryTier::New => "New",
            MasteryTier::Struggling => "Struggling",
            MasteryTier::Learning => "Learning",
            MasteryTier::Familiar => "Familiar",
            MasteryTier::Proficient => "Proficient",
            MasteryTier::Mastered => "Mastered",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResult {
    /// Probability of recall at the moment of grading.
    pub retention: f64,
    pub tier: MasteryTier,
    pub interval_days: u32,
    pub state: ReviewState,
    /// True when this result was replayed for a repeated idempotency key.
    #[serde(default)]
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemStats {
    pub item: SkillItem,
    pub review_count: u32,
    pub lapse_count: u32,
    pub success_rate: f64,
    pub stability: f64,
    pub difficulty: f64,
    pub retrievability: f64,
    pub tier: MasteryTier,
    pub next_review_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub item: SkillItem,
    pub urgency: f64,
    pub overdue: bool,
    pub days_overdue: f64,
    pub retrievability: f64,
    pub stability: f64,
    pub next_review_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningGoal {
    ExamPrep,
    Standard,
    Casual,
}

impl LearningGoal {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningGoal::ExamPrep => "exam_prep",
            LearningGoal::Standard => "standard",
            LearningGoal::Casual => "casual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "exam_prep" | "exam-prep" | "exam" | "certification" => Some(LearningGoal::ExamPrep),
            "standard" | "default" => Some(LearningGoal::Standard),
            "casual" => Some(LearningGoal::Casual),
            _ => None,
        }
    }
}

/// Which command family a learner is studying. Restricts critical reviews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    Docker,
    Kubernetes,
    Any,
}

impl Track {
    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Docker => "docker",
            Track::Kubernetes => "kubernetes",
            Track::Any => "any",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Some(Track::Docker),
            "kubernetes" | "k8s" => Some(Track::Kubernetes),
            "any" => Some(Track::Any),
            _ => None,
        }
    }

    pub fn matches(&self, skill_key: &str) -> bool {
        match self {
            Track::Docker => skill_key.contains("docker"),
            Track::Kubernetes => skill_key.contains("kubectl") || skill_key.contains("k8s"),
            Track::Any => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerProfile {
    pub id: String,
    pub goal: LearningGoal,
    pub track: Track,
}

/// Raw, undecayed proficiency for one learner and one canonical skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub learner_id: String,
    pub skill: String,
    pub category: String,
    pub proficiency_score: f64,
    pub total_attempts: u32,
    pub successful_attempts: u32,
    pub consecutive_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl MasteryRecord {
    pub fn new(learner_id: &str, skill: &str, category: &str) -> Self {
        Self {
            learner_id: learner_id.to_string(),
            skill: skill.to_string(),
            category: category.to_string(),
            proficiency_score: 0.0,
            total_attempts: 0,
            successful_attempts: 0,
            consecutive_failures: 0,
            last_used_at: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            (self.successful_attempts as f64 / self.total_attempts as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Watch,
    Risk,
    Critical,
}

impl RiskLevel {
    pub fn for_score(score: f64) -> Self {
        if score >= 90.0 {
            RiskLevel::Safe
        } else if score >= 70.0 {
            RiskLevel::Watch
        } else if score >= 60.0 {
            RiskLevel::Risk
        } else {
            RiskLevel::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Watch => "watch",
            RiskLevel::Risk => "risk",
            RiskLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub session_id: i64,
    pub item_id: String,
    pub chapter: Option<String>,
    pub micro_id: Option<String>,
    pub correct: bool,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: i64,
    pub learner_id: String,
    pub current_chapter: Option<String>,
    pub current_micro_id: Option<String>,
    pub completed_micros: BTreeMap<String, BTreeSet<String>>,
    pub last_review_chapter_position: usize,
    pub last_lab_chapter_position: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items_presented: u32,
    pub responses: Vec<ResponseRecord>,
}

impl SessionState {
    pub fn last_answer_correct(&self) -> bool {
        self.responses.last().map(|r| r.correct).unwrap_or(false)
    }

    pub fn has_completed(&self, chapter: &str, micro_id: &str) -> bool {
        self.completed_micros
            .get(chapter)
            .map(|set| set.contains(micro_id))
            .unwrap_or(false)
    }

    pub fn completed_chapters(&self) -> BTreeSet<String> {
        self.completed_micros.keys().cloned().collect()
    }

    pub fn minutes_since_start(&self, now: DateTime<Utc>) -> f64 {
        (now - self.started_at).num_seconds() as f64 / 60.0
    }

    pub fn minutes_since_update(&self, now: DateTime<Utc>) -> f64 {
        (now - self.updated_at).num_seconds() as f64 / 60.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabAttempt {
    pub id: i64,
    pub learner_id: String,
    pub lab_id: String,
    pub passed: bool,
    pub struggle_score: f64,
    pub failed_skills: Vec<String>,
    pub attempted_at: DateTime<Utc>,
    pub retry_available_at: Option<DateTime<Utc>>,
}

impl LabAttempt {
    pub fn can_retry(&self, now: DateTime<Utc>) -> bool {
        self.retry_available_at.map(|at| now >= at).unwrap_or(true)
    }
}

/// The fixed, ordered strategies of the recommendation cascade.
/// Lower numbers win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PriorityTier {
    ResumeSession = 0,
    CriticalReview = 1,
    ComprehensiveLab = 2,
    BatchReview = 3,
    UrgentDecay = 4,
    FailedRecent = 5,
    StealthReview = 6,
    WeaknessArea = 7,
    LabReady = 8,
    LearningPath = 9,
    NewContent = 10,
    Fallback = 11,
}

impl PriorityTier {
    pub const ORDER: [PriorityTier; 12] = [
        PriorityTier::ResumeSession,
        PriorityTier::CriticalReview,
        PriorityTier::ComprehensiveLab,
        PriorityTier::BatchReview,
        PriorityTier::UrgentDecay,
        PriorityTier::FailedRecent,
        PriorityTier::StealthReview,
        PriorityTier::WeaknessArea,
        PriorityTier::LabReady,
        PriorityTier::LearningPath,
        PriorityTier::NewContent,
        PriorityTier::Fallback,
    ];

    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::ResumeSession => "resume_session",
            PriorityTier::CriticalReview => "critical_review",
            PriorityTier::ComprehensiveLab => "comprehensive_lab",
            PriorityTier::BatchReview => "batch_review",
            PriorityTier::UrgentDecay => "urgent_decay",
            PriorityTier::FailedRecent => "failed_recent",
            PriorityTier::StealthReview => "stealth_review",
            PriorityTier::WeaknessArea => "weakness_area",
            PriorityTier::LabReady => "lab_ready",
            PriorityTier::LearningPath => "learning_path",
            PriorityTier::NewContent => "new_content",
            PriorityTier::Fallback => "fallback",
        }
    }
}

impl From<PriorityTier> for u8 {
    fn from(tier: PriorityTier) -> Self {
        tier.value()
    }
}

impl TryFrom<u8> for PriorityTier {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        PriorityTier::ORDER
            .get(value as usize)
            .copied()
            .ok_or_else(|| format!("unknown priority tier {}", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    Interactive,
    Lesson,
    Practice,
    QuickReview,
    ScenarioReview,
    ComprehensiveLab,
    Lab,
}

impl RecommendationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationType::Interactive => "interactive",
            RecommendationType::Lesson => "lesson",
            RecommendationType::Practice => "practice",
            RecommendationType::QuickReview => "quick_review",
            RecommendationType::ScenarioReview => "scenario_review",
            RecommendationType::ComprehensiveLab => "comprehensive_lab",
            RecommendationType::Lab => "lab",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RecommendationType,
    pub priority_tier: PriorityTier,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl Recommendation {
    /// Skill or chapter key the recommendation is about, when it has one.
    pub fn subject(&self) -> Option<&str> {
        self.metadata
            .get("skill")
            .or_else(|| self.metadata.get("chapter"))
            .and_then(|v| v.as_str())
    }
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Fractional days from `from` to `to` (negative if `to` is earlier).
pub fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 86_400_000.0
}
