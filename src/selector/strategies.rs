//! One strategy per priority tier.

use std::collections::HashSet;

use chrono::Duration;
use serde_json::{json, Value};

use super::{round1, Decision, SelectionContext, SessionEffect, Strategy};
use crate::canonical;
use crate::content::{LabSummary, Micro};
use crate::error::Result;
use crate::mastery::DecayedMastery;
use crate::models::{LabAttempt, PriorityTier, Recommendation, RecommendationType};

pub fn default_strategies() -> Vec<Box<dyn Strategy>> {
    vec![
        Box::new(ResumeSession),
        Box::new(CriticalReview),
        Box::new(ComprehensiveLab),
        Box::new(BatchReview),
        Box::new(UrgentDecay),
        Box::new(FailedRecent),
        Box::new(StealthReview),
        Box::new(WeaknessArea),
        Box::new(LabReady),
        Box::new(LearningPathProgress),
        Box::new(NewContent),
        Box::new(Fallback),
    ]
}

fn recommendation(
    id: String,
    kind: RecommendationType,
    tier: PriorityTier,
    payload: Value,
    metadata: Value,
) -> Recommendation {
    Recommendation {
        id,
        kind,
        priority_tier: tier,
        payload,
        metadata,
    }
}

fn micro_payload(micro: &Micro) -> Value {
    json!({ "title": micro.title, "content": micro.content })
}

fn review_payload(mastery: &DecayedMastery) -> Value {
    let skill = mastery.skill();
    json!({
        "title": format!("Review: {}", canonical::label(skill)),
        "description": format!(
            "Your retention has dropped to {:.1}%. Time for a quick refresher.",
            mastery.decayed_score
        ),
        "skill": skill,
        "examples": canonical::examples(skill),
    })
}

fn lab_payload(lab: &LabSummary) -> Value {
    json!({
        "title": lab.title,
        "description": lab.description,
        "objectives": lab.objectives,
        "estimated_minutes": lab.estimated_minutes,
        "current_instruction": lab.first_instruction(),
    })
}

fn by_decayed(a: &&DecayedMastery, b: &&DecayedMastery) -> std::cmp::Ordering {
    a.decayed_score
        .total_cmp(&b.decayed_score)
        .then_with(|| a.skill().cmp(b.skill()))
}

fn by_raw(a: &&DecayedMastery, b: &&DecayedMastery) -> std::cmp::Ordering {
    a.record
        .proficiency_score
        .total_cmp(&b.record.proficiency_score)
        .then_with(|| a.skill().cmp(b.skill()))
}

// First candidate whose id and keys are all outside the request's exclusions.
fn first_allowed(
    ctx: &SelectionContext,
    candidates: impl IntoIterator<Item = Decision>,
) -> Option<Decision> {
    candidates
        .into_iter()
        .find(|d| !ctx.excludes(&d.recommendation))
}

/// Tier 0: keep the learner on the chapter they are working through.
/// Never mutates the session; a finished chapter falls through.
pub struct ResumeSession;

impl ResumeSession {
    /// Next unfinished micro of the first path chapter. Falls through once
    /// that chapter is learned or the pick is excluded.
    fn start_of_session(ctx: &SelectionContext) -> Option<Decision> {
        let chapter = ctx.path().first()?;
        if ctx.library.is_learned(chapter, ctx.progress()) {
            return None;
        }
        let micro = ctx.best_micro(chapter)?;
        let decision = Decision::new(recommendation(
            format!("start_{}_{}", chapter, micro.id),
            RecommendationType::Interactive,
            PriorityTier::ResumeSession,
            micro_payload(&micro),
            json!({ "chapter": chapter, "micro_id": micro.id, "is_learning_path": true }),
        ));
        if ctx.excludes(&decision.recommendation) {
            return None;
        }
        Some(decision)
    }
}

impl Strategy for ResumeSession {
    fn tier(&self) -> PriorityTier {
        PriorityTier::ResumeSession
    }

    fn honors_exclusions(&self) -> bool {
        false
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        let session = match ctx.session() {
            Some(session) => session,
            None => return Ok(None),
        };
        let chapter = match &session.current_chapter {
            Some(chapter) => chapter,
            None => return Ok(Self::start_of_session(ctx)),
        };

        if session.minutes_since_update(ctx.now()) >= ctx.config.resume_window_minutes as f64 {
            return Ok(None);
        }
        if session.last_answer_correct() || ctx.request.last_correct {
            return Ok(None);
        }

        let micro = match &session.current_micro_id {
            None => ctx.library.first_micro(chapter),
            Some(id) if session.has_completed(chapter, id) => ctx.library.next_micro(chapter, id),
            Some(id) => ctx.library.micro(chapter, id),
        };
        let micro = match micro {
            Some(micro) => micro,
            None => return Ok(None),
        };

        Ok(Some(Decision::new(recommendation(
            format!("continue_{}_{}", chapter, micro.id),
            RecommendationType::Interactive,
            PriorityTier::ResumeSession,
            micro_payload(&micro),
            json!({ "chapter": chapter, "micro_id": micro.id, "is_learning_path": true }),
        ))))
    }
}

/// Tier 1: the worst decayed skill from a chapter already worked on.
pub struct CriticalReview;

impl Strategy for CriticalReview {
    fn tier(&self) -> PriorityTier {
        PriorityTier::CriticalReview
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        let completed = match ctx.session() {
            Some(session) => session.completed_chapters(),
            None => return Ok(None),
        };

        let mut critical: Vec<&DecayedMastery> = ctx
            .snapshot
            .masteries
            .iter()
            .filter(|m| completed.contains(m.skill()))
            .filter(|m| ctx.snapshot.track.matches(m.skill()))
            .filter(|m| m.decayed_score < ctx.config.critical_threshold)
            .filter(|m| !ctx.is_excluded(m.skill()))
            .collect();
        critical.sort_by(by_decayed);

        Ok(first_allowed(
            ctx,
            critical.into_iter().map(|worst| {
                Decision::new(recommendation(
                    format!("review_{}", worst.skill()),
                    RecommendationType::QuickReview,
                    PriorityTier::CriticalReview,
                    review_payload(worst),
                    json!({
                        "skill": worst.skill(),
                        "is_review": true,
                        "review_type": "critical",
                        "review_reason": "critical_decay",
                        "mastery_score": worst.record.proficiency_score.round(),
                        "retention_level": round1(worst.decayed_score),
                        "risk": worst.risk().as_str(),
                    }),
                ))
            }),
        ))
    }
}

/// Tier 2: a milestone lab every few chapters. A lab still cooling down
/// after a failure is replaced by a review of the skill that failed.
pub struct ComprehensiveLab;

impl ComprehensiveLab {
    fn failed_skill_review(
        ctx: &SelectionContext,
        lab: &LabSummary,
        attempt: &LabAttempt,
    ) -> Option<Decision> {
        let mastery = attempt.failed_skills.iter().find_map(|skill| {
            ctx.snapshot
                .masteries
                .iter()
                .find(|m| m.skill() == skill.as_str())
        })?;

        Some(Decision::new(recommendation(
            format!("lab_review_{}", mastery.skill()),
            RecommendationType::QuickReview,
            PriorityTier::ComprehensiveLab,
            review_payload(mastery),
            json!({
                "skill": mastery.skill(),
                "lab_id": lab.id,
                "is_review": true,
                "review_type": "failed_lab",
                "review_reason": format!("Failed in lab: {}", lab.title),
                "lab_attempt_id": attempt.id,
                "retry_available_at": attempt.retry_available_at,
            }),
        )))
    }
}

impl Strategy for ComprehensiveLab {
    fn tier(&self) -> PriorityTier {
        PriorityTier::ComprehensiveLab
    }

    fn honors_exclusions(&self) -> bool {
        false
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        let session = match ctx.session() {
            Some(session) => session,
            None => return Ok(None),
        };
        let position = ctx.chapter_position();
        if position < ctx.config.min_chapters_for_lab {
            return Ok(None);
        }
        let since_last = position.saturating_sub(session.last_lab_chapter_position);
        if since_last < ctx.config.lab_interval_chapters {
            return Ok(None);
        }

        let lab = ctx
            .library
            .eligible_labs(&ctx.raw_scores(), ctx.config.lab_min_mastery)
            .into_iter()
            .find(|lab| !ctx.lab_passed(&lab.id));
        let lab = match lab {
            Some(lab) => lab,
            None => return Ok(None),
        };

        if let Some(attempt) = ctx.latest_attempt(&lab.id) {
            if !attempt.can_retry(ctx.now()) {
                return Ok(Self::failed_skill_review(ctx, &lab, attempt));
            }
        }

        let decision = Decision::new(recommendation(
            lab.id.clone(),
            RecommendationType::ComprehensiveLab,
            PriorityTier::ComprehensiveLab,
            lab_payload(&lab),
            json!({
                "lab_id": lab.id,
                "is_comprehensive_lab": true,
                "chapters_since_last_lab": since_last,
                "step_count": lab.steps.len(),
            }),
        ));
        Ok(Some(decision.with_effect(SessionEffect::MarkLab { position })))
    }
}

/// Tier 3: bundle the worst skills of the moderate band into one scenario.
pub struct BatchReview;

impl Strategy for BatchReview {
    fn tier(&self) -> PriorityTier {
        PriorityTier::BatchReview
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        let session = match ctx.session() {
            Some(session) => session,
            None => return Ok(None),
        };
        let position = ctx.chapter_position();
        if position.saturating_sub(session.last_review_chapter_position)
            < ctx.config.batch_interval_chapters
        {
            return Ok(None);
        }

        let mut moderate: Vec<&DecayedMastery> = ctx
            .snapshot
            .masteries
            .iter()
            .filter(|m| {
                m.decayed_score >= ctx.config.critical_threshold
                    && m.decayed_score < ctx.config.moderate_threshold
            })
            .filter(|m| !ctx.is_excluded(m.skill()))
            .collect();
        if moderate.len() < ctx.config.min_skills_for_batch {
            return Ok(None);
        }
        moderate.sort_by(by_decayed);
        moderate.truncate(ctx.config.batch_size);

        let skills: Vec<&str> = moderate.iter().map(|m| m.skill()).collect();
        let scores: Vec<f64> = moderate.iter().map(|m| round1(m.decayed_score)).collect();
        let parts: Vec<Value> = moderate
            .iter()
            .map(|m| {
                json!({
                    "skill": m.skill(),
                    "label": canonical::label(m.skill()),
                    "examples": canonical::examples(m.skill()),
                })
            })
            .collect();

        let decision = Decision::new(recommendation(
            format!("batch_{}", skills.join("+")),
            RecommendationType::ScenarioReview,
            PriorityTier::BatchReview,
            json!({ "title": "Mixed review", "parts": parts }),
            json!({
                "skills": skills,
                "scores": scores,
                "is_review": true,
                "review_type": "batch",
                "review_reason": "moderate_decay",
            }),
        ));
        Ok(Some(decision.with_effect(SessionEffect::MarkBatchReview { position })))
    }
}

/// Tier 4: badly decayed skills left alone for a week, completed or not.
pub struct UrgentDecay;

impl Strategy for UrgentDecay {
    fn tier(&self) -> PriorityTier {
        PriorityTier::UrgentDecay
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        let cutoff = ctx.now() - Duration::days(ctx.config.urgent_min_idle_days);
        let mut urgent: Vec<&DecayedMastery> = ctx
            .snapshot
            .masteries
            .iter()
            .filter(|m| m.record.last_used_at.map_or(false, |at| at < cutoff))
            .filter(|m| m.decayed_score < ctx.config.urgent_threshold)
            .filter(|m| !ctx.is_excluded(m.skill()))
            .collect();
        urgent.sort_by(by_decayed);

        let candidates = urgent.into_iter().filter_map(|mastery| {
            let micro = ctx.best_micro(mastery.skill())?;
            Some(Decision::new(recommendation(
                format!("urgent_{}", mastery.skill()),
                RecommendationType::Interactive,
                PriorityTier::UrgentDecay,
                micro_payload(&micro),
                json!({
                    "skill": mastery.skill(),
                    "chapter": mastery.skill(),
                    "micro_id": micro.id,
                    "is_review": true,
                    "is_urgent": true,
                    "review_reason": "decay",
                    "previous_score": round1(mastery.record.proficiency_score),
                    "retention_level": round1(mastery.decayed_score),
                }),
            )))
        });
        Ok(first_allowed(ctx, candidates))
    }
}

/// Tier 5: retry something answered wrong in another recent session.
pub struct FailedRecent;

impl Strategy for FailedRecent {
    fn tier(&self) -> PriorityTier {
        PriorityTier::FailedRecent
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        let now = ctx.now();
        let current = ctx.session();
        if let Some(session) = current {
            if session.minutes_since_start(now) < ctx.config.failed_recent_grace_minutes as f64 {
                return Ok(None);
            }
        }

        let window_start = now - Duration::hours(ctx.config.failed_recent_window_hours);
        let mut recovered: HashSet<&str> = HashSet::new();

        for response in &ctx.snapshot.recent_responses {
            if response.answered_at < window_start
                || current.map_or(false, |s| s.id == response.session_id)
            {
                continue;
            }
            // Newest first, so a later correct answer is seen before the failure.
            if response.correct {
                recovered.insert(&response.item_id);
                continue;
            }
            if recovered.contains(response.item_id.as_str()) || ctx.is_excluded(&response.item_id) {
                continue;
            }
            let chapter = match &response.chapter {
                Some(chapter) if !ctx.is_excluded(chapter) => chapter,
                _ => continue,
            };
            let micro = response
                .micro_id
                .as_deref()
                .and_then(|id| ctx.library.micro(chapter, id))
                .or_else(|| ctx.library.first_micro(chapter));
            let micro = match micro {
                Some(micro) => micro,
                None => continue,
            };

            let decision = Decision::new(recommendation(
                format!("retry_{}", response.item_id),
                RecommendationType::Interactive,
                PriorityTier::FailedRecent,
                micro_payload(&micro),
                json!({
                    "chapter": chapter,
                    "micro_id": micro.id,
                    "item_id": response.item_id,
                    "is_review": true,
                    "review_reason": "failed_recent",
                    "failed_at": response.answered_at,
                }),
            ));
            if ctx.excludes(&decision.recommendation) {
                continue;
            }
            return Ok(Some(decision));
        }
        Ok(None)
    }
}

/// Tier 6: occasionally slip a review in looking like ordinary content.
pub struct StealthReview;

impl Strategy for StealthReview {
    fn tier(&self) -> PriorityTier {
        PriorityTier::StealthReview
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        if !ctx.random.fires(ctx.config.stealth_probability) {
            return Ok(None);
        }

        let cutoff = ctx.now() - Duration::days(ctx.config.stealth_min_idle_days);
        let mut candidates: Vec<&DecayedMastery> = ctx
            .snapshot
            .masteries
            .iter()
            .filter(|m| m.record.last_used_at.map_or(false, |at| at <= cutoff))
            .filter(|m| m.decayed_score < ctx.config.stealth_score_ceiling)
            .filter(|m| m.record.proficiency_score < ctx.config.max_proficiency)
            .filter(|m| !ctx.is_excluded(m.skill()))
            .collect();
        candidates.sort_by(by_decayed);

        let candidates = candidates.into_iter().filter_map(|mastery| {
            let micro = ctx.best_micro(mastery.skill())?;
            Some(Decision::new(recommendation(
                format!("stealth_{}", mastery.skill()),
                RecommendationType::Interactive,
                PriorityTier::StealthReview,
                micro_payload(&micro),
                json!({
                    "skill": mastery.skill(),
                    "chapter": mastery.skill(),
                    "micro_id": micro.id,
                    "is_review": true,
                    "is_stealth_review": true,
                    "review_reason": "stealth",
                }),
            )))
        });
        Ok(first_allowed(ctx, candidates))
    }
}

/// Tier 7: drill the weakest skill by raw proficiency.
pub struct WeaknessArea;

impl Strategy for WeaknessArea {
    fn tier(&self) -> PriorityTier {
        PriorityTier::WeaknessArea
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        if ctx.request.last_correct || ctx.session().map_or(false, |s| s.last_answer_correct()) {
            return Ok(None);
        }
        if let Some(session) = ctx.session() {
            if session.minutes_since_start(ctx.now()) < ctx.config.weakness_grace_minutes as f64 {
                return Ok(None);
            }
        }

        let mut weak: Vec<&DecayedMastery> = ctx
            .snapshot
            .masteries
            .iter()
            .filter(|m| m.record.proficiency_score < ctx.config.weakness_threshold)
            .filter(|m| !ctx.is_excluded(m.skill()))
            .collect();
        weak.sort_by(by_raw);

        let candidates = weak.into_iter().filter_map(|mastery| {
            let micro = ctx.best_micro(mastery.skill())?;
            Some(Decision::new(recommendation(
                format!("weakness_{}", mastery.skill()),
                RecommendationType::Interactive,
                PriorityTier::WeaknessArea,
                micro_payload(&micro),
                json!({
                    "skill": mastery.skill(),
                    "chapter": mastery.skill(),
                    "micro_id": micro.id,
                    "is_review": true,
                    "is_weakness": true,
                    "review_reason": "low_mastery",
                    "current_score": round1(mastery.record.proficiency_score),
                }),
            )))
        });
        Ok(first_allowed(ctx, candidates))
    }
}

/// Tier 8: unlock a lab whose declared prerequisites are met.
pub struct LabReady;

impl Strategy for LabReady {
    fn tier(&self) -> PriorityTier {
        PriorityTier::LabReady
    }

    fn honors_exclusions(&self) -> bool {
        false
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        let session = match ctx.session() {
            Some(session) => session,
            None => return Ok(None),
        };
        if session.items_presented < ctx.config.lab_ready_min_items {
            return Ok(None);
        }

        let now = ctx.now();
        let lab = ctx
            .library
            .eligible_labs(&ctx.raw_scores(), ctx.config.lab_min_mastery)
            .into_iter()
            .filter(|lab| !lab.requires_mastery.is_empty())
            .filter(|lab| !ctx.lab_passed(&lab.id))
            .find(|lab| ctx.latest_attempt(&lab.id).map_or(true, |a| a.can_retry(now)));
        let lab = match lab {
            Some(lab) => lab,
            None => return Ok(None),
        };

        Ok(Some(Decision::new(recommendation(
            lab.id.clone(),
            RecommendationType::Lab,
            PriorityTier::LabReady,
            lab_payload(&lab),
            json!({
                "lab_id": lab.id,
                "step_count": lab.steps.len(),
                "is_lab_unlock": true,
                "prerequisites": lab.requires_mastery,
            }),
        ))))
    }
}

/// Tier 9: the next chapter of the learning path not yet learned.
pub struct LearningPathProgress;

impl Strategy for LearningPathProgress {
    fn tier(&self) -> PriorityTier {
        PriorityTier::LearningPath
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        let progress = ctx.progress();
        let candidates = ctx
            .path()
            .iter()
            .filter(|chapter| !ctx.is_excluded(chapter))
            .filter(|chapter| !ctx.library.is_learned(chapter, progress))
            .filter_map(|chapter| {
                let micro = ctx.best_micro(chapter)?;
                let base_done = ctx
                    .session()
                    .map_or(false, |s| s.has_completed(chapter, &format!("{}_base", chapter)));
                let kind = if micro.is_base() {
                    RecommendationType::Lesson
                } else if base_done {
                    RecommendationType::Practice
                } else {
                    RecommendationType::Interactive
                };

                Some(Decision::new(recommendation(
                    format!("lesson_{}_{}", chapter, micro.id),
                    kind,
                    PriorityTier::LearningPath,
                    micro_payload(&micro),
                    json!({ "chapter": chapter, "micro_id": micro.id, "is_learning_path": true }),
                )))
            });
        Ok(first_allowed(ctx, candidates))
    }
}

/// Tier 10: any chapter not learned yet, in catalog order.
pub struct NewContent;

impl Strategy for NewContent {
    fn tier(&self) -> PriorityTier {
        PriorityTier::NewContent
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        let progress = ctx.progress();
        let candidates = ctx
            .library
            .chapters()
            .into_iter()
            .filter(|chapter| !ctx.is_excluded(chapter))
            .filter(|chapter| !ctx.library.is_learned(chapter, progress))
            .filter_map(|chapter| {
                let micro = ctx.best_micro(&chapter)?;
                Some(Decision::new(recommendation(
                    format!("new_{}_{}", chapter, micro.id),
                    RecommendationType::Interactive,
                    PriorityTier::NewContent,
                    micro_payload(&micro),
                    json!({ "chapter": chapter, "micro_id": micro.id, "is_new_content": true }),
                )))
            });
        Ok(first_allowed(ctx, candidates))
    }
}

/// Tier 11: the first chapter with content. Only an empty library gets nothing.
pub struct Fallback;

impl Strategy for Fallback {
    fn tier(&self) -> PriorityTier {
        PriorityTier::Fallback
    }

    fn honors_exclusions(&self) -> bool {
        false
    }

    fn evaluate(&self, ctx: &SelectionContext) -> Result<Option<Decision>> {
        let found = ctx
            .path()
            .iter()
            .cloned()
            .chain(ctx.library.chapters())
            .find_map(|chapter| ctx.library.first_micro(&chapter).map(|micro| (chapter, micro)));
        let (chapter, micro) = match found {
            Some(found) => found,
            None => return Ok(None),
        };

        Ok(Some(Decision::new(recommendation(
            format!("fallback_{}", chapter),
            RecommendationType::Interactive,
            PriorityTier::Fallback,
            micro_payload(&micro),
            json!({ "chapter": chapter, "micro_id": micro.id, "is_learning_path": true }),
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorConfig;
    use crate::content::{ContentLibrary, StaticLibrary};
    use crate::models::{ResponseRecord, SessionState, Track};
    use crate::selector::test_support::*;
    use crate::selector::{
        FixedRandom, LearnerSnapshot, PrioritySelector, RandomSource, SelectionRequest,
    };
    use std::collections::BTreeSet;

    fn select_with(
        snap: &LearnerSnapshot,
        request: &SelectionRequest,
        random: &dyn RandomSource,
    ) -> Option<Decision> {
        let lib = library();
        let config = SelectorConfig::default();
        let ctx = SelectionContext::new(snap, request, &lib, &config, random);
        PrioritySelector::default().select(&ctx)
    }

    fn select(snap: &LearnerSnapshot) -> Decision {
        select_with(snap, &SelectionRequest::default(), &FixedRandom(1.0)).unwrap()
    }

    fn evaluate(strategy: &dyn Strategy, snap: &LearnerSnapshot, random: &dyn RandomSource) -> Option<Decision> {
        let lib = library();
        let config = SelectorConfig::default();
        let request = SelectionRequest::default();
        let ctx = SelectionContext::new(snap, &request, &lib, &config, random);
        strategy.evaluate(&ctx).unwrap()
    }

    fn excluding(keys: &[&str]) -> SelectionRequest {
        SelectionRequest {
            exclude_ids: keys.iter().map(|k| k.to_string()).collect::<BTreeSet<_>>(),
            last_correct: false,
        }
    }

    fn answer(session_id: i64, item: &str, micro: &str, correct: bool, hours_ago: i64) -> ResponseRecord {
        ResponseRecord {
            session_id,
            item_id: item.to_string(),
            chapter: Some("docker_ps".to_string()),
            micro_id: Some(micro.to_string()),
            correct,
            answered_at: now() - Duration::hours(hours_ago),
        }
    }

    fn decayed_45_docker() -> LearnerSnapshot {
        let mut s = session();
        s.current_chapter = Some("docker_ps".to_string());
        complete(&mut s, "docker_run", "docker_run_base");
        snapshot(Some(s), vec![mastery("docker_run", 100.0, 45.0, 10)])
    }

    mod scenario_tests {
        use super::*;

        #[test]
        fn new_learner_starts_at_first_chapter() {
            let mut s = session();
            s.current_chapter = None;
            s.current_micro_id = None;
            let decision = select(&snapshot(Some(s), Vec::new()));
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::ResumeSession);
            assert_eq!(decision.recommendation.id, "start_docker_run_docker_run_base");
            assert!(decision.effects.is_empty());
        }

        #[test]
        fn start_of_session_skips_finished_micro() {
            let mut s = session();
            s.current_chapter = None;
            s.current_micro_id = None;
            complete(&mut s, "docker_run", "docker_run_base");
            let snap = snapshot(Some(s), Vec::new());

            let decision = select(&snap);
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::ResumeSession);
            assert_eq!(decision.recommendation.id, "start_docker_run_docker_run_ports");

            let request = excluding(&["start_docker_run_docker_run_ports"]);
            let decision = select_with(&snap, &request, &FixedRandom(1.0)).unwrap();
            assert_ne!(decision.recommendation.id, "start_docker_run_docker_run_ports");
            assert_ne!(decision.recommendation.priority_tier, PriorityTier::ResumeSession);

            let request = excluding(&["docker_run_ports"]);
            let decision = select_with(&snap, &request, &FixedRandom(1.0)).unwrap();
            assert_ne!(decision.recommendation.metadata["micro_id"], "docker_run_ports");
            assert_eq!(decision.recommendation.subject(), Some("docker_ps"));
        }

        #[test]
        fn start_of_session_passes_a_learned_first_chapter() {
            let mut s = session();
            s.current_chapter = None;
            s.current_micro_id = None;
            complete(&mut s, "docker_run", "docker_run_base");
            complete(&mut s, "docker_run", "docker_run_ports");
            let snap = snapshot(Some(s), Vec::new());
            assert!(evaluate(&ResumeSession, &snap, &FixedRandom(1.0)).is_none());
            assert_eq!(
                select(&snap).recommendation.id,
                "lesson_docker_ps_docker_ps_base"
            );
        }

        #[test]
        fn no_session_follows_learning_path() {
            let decision = select(&snapshot(None, Vec::new()));
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::LearningPath);
            assert_eq!(decision.recommendation.kind, RecommendationType::Lesson);
            assert_eq!(decision.recommendation.subject(), Some("docker_run"));
        }

        #[test]
        fn decayed_skill_in_completed_chapter_is_critical() {
            let snap = decayed_45_docker();
            let decision = select(&snap);
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::CriticalReview);
            assert_eq!(decision.recommendation.kind, RecommendationType::QuickReview);
            assert_eq!(decision.recommendation.subject(), Some("docker_run"));
            assert_eq!(decision.recommendation.metadata["retention_level"], 45.0);
            assert_eq!(decision.recommendation.metadata["mastery_score"], 100.0);
        }

        #[test]
        fn critical_beats_learning_path() {
            let snap = decayed_45_docker();
            assert!(evaluate(&LearningPathProgress, &snap, &FixedRandom(1.0)).is_some());
            assert_eq!(
                select(&snap).recommendation.priority_tier,
                PriorityTier::CriticalReview
            );
        }

        #[test]
        fn excluded_skill_is_never_returned() {
            let snap = decayed_45_docker();
            for request in [excluding(&["docker_run"]), excluding(&["review_docker_run", "docker_run"])] {
                let decision = select_with(&snap, &request, &FixedRandom(0.0)).unwrap();
                assert_ne!(decision.recommendation.subject(), Some("docker_run"));
                assert_eq!(decision.recommendation.priority_tier, PriorityTier::LearningPath);
            }
        }

        #[test]
        fn excluded_review_id_moves_to_next_tier() {
            let snap = decayed_45_docker();
            let decision = select_with(&snap, &excluding(&["review_docker_run"]), &FixedRandom(1.0))
                .unwrap();
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::UrgentDecay);
        }

        #[test]
        fn stealth_never_fires_with_never_source() {
            let mut states = vec![decayed_45_docker(), snapshot(None, Vec::new())];
            states.push(snapshot(
                Some(session()),
                vec![
                    mastery("docker_ps", 70.0, 65.0, 3),
                    mastery("docker_logs", 75.0, 40.0, 2),
                ],
            ));
            for snap in &states {
                assert!(evaluate(&StealthReview, snap, &FixedRandom(1.0)).is_none());
                let decision = select_with(snap, &SelectionRequest::default(), &FixedRandom(1.0));
                assert_ne!(
                    decision.map(|d| d.recommendation.priority_tier),
                    Some(PriorityTier::StealthReview)
                );
            }
        }
    }

    mod resume_tests {
        use super::*;

        fn active() -> SessionState {
            let mut s = session();
            s.updated_at = now() - Duration::minutes(2);
            s
        }

        #[test]
        fn resumes_recent_chapter() {
            let decision = evaluate(&ResumeSession, &snapshot(Some(active()), Vec::new()), &FixedRandom(1.0))
                .unwrap();
            assert_eq!(decision.recommendation.id, "continue_docker_run_docker_run_base");
        }

        #[test]
        fn moves_past_completed_micro() {
            let mut s = active();
            complete(&mut s, "docker_run", "docker_run_base");
            let decision = evaluate(&ResumeSession, &snapshot(Some(s), Vec::new()), &FixedRandom(1.0))
                .unwrap();
            assert_eq!(decision.recommendation.metadata["micro_id"], "docker_run_ports");
        }

        #[test]
        fn finished_chapter_falls_through() {
            let mut s = active();
            s.current_micro_id = Some("docker_run_ports".to_string());
            complete(&mut s, "docker_run", "docker_run_ports");
            let snap = snapshot(Some(s.clone()), Vec::new());
            assert!(evaluate(&ResumeSession, &snap, &FixedRandom(1.0)).is_none());
            // The snapshot is untouched.
            assert_eq!(snap.session.unwrap(), s);
        }

        #[test]
        fn correct_answer_or_idle_session_does_not_resume() {
            let mut s = active();
            s.responses.push(ResponseRecord {
                session_id: s.id,
                item_id: "q1".to_string(),
                chapter: Some("docker_run".to_string()),
                micro_id: Some("docker_run_base".to_string()),
                correct: true,
                answered_at: now(),
            });
            assert!(evaluate(&ResumeSession, &snapshot(Some(s), Vec::new()), &FixedRandom(1.0)).is_none());

            let idle = session();
            assert!(evaluate(&ResumeSession, &snapshot(Some(idle), Vec::new()), &FixedRandom(1.0)).is_none());
        }
    }

    mod review_tests {
        use super::*;

        #[test]
        fn critical_review_respects_track() {
            let mut s = session();
            complete(&mut s, "kubectl_get_pods", "kubectl_get_pods_base");
            let snap = snapshot(Some(s), vec![mastery("kubectl_get_pods", 90.0, 30.0, 5)]);
            assert!(evaluate(&CriticalReview, &snap, &FixedRandom(1.0)).is_none());

            let mut any = snap.clone();
            any.track = Track::Any;
            assert!(evaluate(&CriticalReview, &any, &FixedRandom(1.0)).is_some());
        }

        #[test]
        fn critical_review_picks_worst() {
            let mut s = session();
            complete(&mut s, "docker_run", "docker_run_base");
            complete(&mut s, "docker_ps", "docker_ps_base");
            let snap = snapshot(
                Some(s),
                vec![mastery("docker_run", 80.0, 55.0, 3), mastery("docker_ps", 80.0, 41.0, 3)],
            );
            let decision = evaluate(&CriticalReview, &snap, &FixedRandom(1.0)).unwrap();
            assert_eq!(decision.recommendation.id, "review_docker_ps");
        }

        #[test]
        fn excluded_review_tries_next_critical_skill() {
            let mut s = session();
            complete(&mut s, "docker_run", "docker_run_base");
            complete(&mut s, "docker_ps", "docker_ps_base");
            let snap = snapshot(
                Some(s),
                vec![mastery("docker_run", 80.0, 55.0, 3), mastery("docker_ps", 80.0, 41.0, 3)],
            );
            let request = excluding(&["review_docker_ps"]);
            let decision = select_with(&snap, &request, &FixedRandom(1.0)).unwrap();
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::CriticalReview);
            assert_eq!(decision.recommendation.id, "review_docker_run");
        }

        #[test]
        fn batch_bundles_three_worst_moderate_skills() {
            let mut s = session();
            s.current_chapter = Some("docker_logs".to_string());
            let snap = snapshot(
                Some(s),
                vec![
                    mastery("docker_run", 90.0, 70.0, 2),
                    mastery("docker_ps", 90.0, 62.0, 2),
                    mastery("docker_stop", 90.0, 74.0, 2),
                    mastery("docker_logs", 90.0, 65.0, 2),
                    mastery("docker_exec", 90.0, 80.0, 2),
                ],
            );
            let decision = select(&snap);
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::BatchReview);
            assert_eq!(decision.recommendation.id, "batch_docker_ps+docker_logs+docker_run");
            assert_eq!(decision.effects, vec![SessionEffect::MarkBatchReview { position: 3 }]);
        }

        #[test]
        fn batch_waits_for_chapter_gap() {
            let mut s = session();
            s.current_chapter = Some("docker_logs".to_string());
            s.last_review_chapter_position = 1;
            let snap = snapshot(
                Some(s),
                vec![
                    mastery("docker_run", 90.0, 70.0, 2),
                    mastery("docker_ps", 90.0, 62.0, 2),
                    mastery("docker_logs", 90.0, 65.0, 2),
                ],
            );
            assert!(evaluate(&BatchReview, &snap, &FixedRandom(1.0)).is_none());
        }

        #[test]
        fn urgent_decay_needs_a_week_idle() {
            let snap = snapshot(Some(session()), vec![mastery("docker_stop", 60.0, 45.0, 8)]);
            let decision = select(&snap);
            assert_eq!(decision.recommendation.id, "urgent_docker_stop");
            assert_eq!(decision.recommendation.metadata["micro_id"], "docker_stop_base");

            let recent = snapshot(Some(session()), vec![mastery("docker_stop", 60.0, 45.0, 3)]);
            assert!(evaluate(&UrgentDecay, &recent, &FixedRandom(1.0)).is_none());
        }
    }

    mod lab_tests {
        use super::*;
        use crate::models::LabAttempt;

        fn at_chapter_five() -> LearnerSnapshot {
            let mut s = session();
            s.current_chapter = Some("docker_build".to_string());
            snapshot(
                Some(s),
                vec![mastery("docker_run", 80.0, 80.0, 1), mastery("docker_ps", 70.0, 70.0, 1)],
            )
        }

        #[test]
        fn milestone_lab_records_checkpoint() {
            let decision = select(&at_chapter_five());
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::ComprehensiveLab);
            assert_eq!(decision.recommendation.id, "lab_first_container");
            assert_eq!(decision.effects, vec![SessionEffect::MarkLab { position: 5 }]);
        }

        #[test]
        fn locked_lab_becomes_failed_skill_review() {
            let mut snap = at_chapter_five();
            snap.lab_attempts.push(LabAttempt {
                id: 9,
                learner_id: "ada".to_string(),
                lab_id: "lab_first_container".to_string(),
                passed: false,
                struggle_score: 0.7,
                failed_skills: vec!["docker_ps".to_string()],
                attempted_at: now() - Duration::minutes(30),
                retry_available_at: Some(now() + Duration::minutes(90)),
            });
            let decision = select(&snap);
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::ComprehensiveLab);
            assert_eq!(decision.recommendation.id, "lab_review_docker_ps");
            assert_eq!(decision.recommendation.kind, RecommendationType::QuickReview);
            assert!(decision.effects.is_empty());
        }

        #[test]
        fn lab_ready_needs_items_and_prerequisites() {
            let mut s = session();
            s.items_presented = 3;
            let snap = snapshot(
                Some(s.clone()),
                vec![mastery("docker_run", 70.0, 70.0, 0), mastery("docker_ps", 65.0, 65.0, 0)],
            );
            let decision = evaluate(&LabReady, &snap, &FixedRandom(1.0)).unwrap();
            assert_eq!(decision.recommendation.id, "lab_first_container");

            s.items_presented = 2;
            let early = snapshot(Some(s), snap.masteries.clone());
            assert!(evaluate(&LabReady, &early, &FixedRandom(1.0)).is_none());
        }

        #[test]
        fn labs_without_prerequisites_are_not_unlocked() {
            let mut s = session();
            s.items_presented = 5;
            let snap = snapshot(Some(s), Vec::new());
            assert!(evaluate(&LabReady, &snap, &FixedRandom(1.0)).is_none());
        }
    }

    mod drill_tests {
        use super::*;

        #[test]
        fn failed_recent_retries_other_session() {
            let mut snap = snapshot(Some(session()), Vec::new());
            snap.recent_responses = vec![answer(7, "q1", "docker_ps_all", false, 3)];
            let decision = select(&snap);
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::FailedRecent);
            assert_eq!(decision.recommendation.id, "retry_q1");
            assert_eq!(decision.recommendation.metadata["micro_id"], "docker_ps_all");
        }

        #[test]
        fn failed_recent_skips_recovered_and_fresh_sessions() {
            let mut snap = snapshot(Some(session()), Vec::new());
            snap.recent_responses = vec![
                answer(7, "q1", "docker_ps_all", true, 1),
                answer(7, "q1", "docker_ps_all", false, 3),
                answer(6, "q2", "docker_ps_base", false, 30),
            ];
            assert!(evaluate(&FailedRecent, &snap, &FixedRandom(1.0)).is_none());

            let mut fresh = session();
            fresh.started_at = now() - Duration::minutes(1);
            let mut snap = snapshot(Some(fresh), Vec::new());
            snap.recent_responses = vec![answer(7, "q1", "docker_ps_all", false, 3)];
            assert!(evaluate(&FailedRecent, &snap, &FixedRandom(1.0)).is_none());
        }

        #[test]
        fn stealth_fires_below_probability() {
            let snap = snapshot(Some(session()), vec![mastery("docker_ps", 75.0, 70.0, 2)]);
            let decision = evaluate(&StealthReview, &snap, &FixedRandom(0.0)).unwrap();
            assert_eq!(decision.recommendation.id, "stealth_docker_ps");
            assert_eq!(decision.recommendation.metadata["is_stealth_review"], true);

            let perfect = snapshot(Some(session()), vec![mastery("docker_ps", 100.0, 70.0, 2)]);
            assert!(evaluate(&StealthReview, &perfect, &FixedRandom(0.0)).is_none());
        }

        #[test]
        fn weakness_drills_lowest_raw_score() {
            let snap = snapshot(
                Some(session()),
                vec![mastery("docker_logs", 40.0, 55.0, 1), mastery("docker_ps", 50.0, 50.0, 1)],
            );
            let decision = select(&snap);
            assert_eq!(decision.recommendation.id, "weakness_docker_logs");

            let request = SelectionRequest {
                exclude_ids: BTreeSet::new(),
                last_correct: true,
            };
            let decision = select_with(&snap, &request, &FixedRandom(1.0)).unwrap();
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::LearningPath);
        }

        #[test]
        fn weakness_waits_for_session_to_settle() {
            let mut s = session();
            s.started_at = now() - Duration::minutes(3);
            let snap = snapshot(Some(s), vec![mastery("docker_logs", 40.0, 55.0, 1)]);
            assert!(evaluate(&WeaknessArea, &snap, &FixedRandom(1.0)).is_none());
        }
    }

    mod progression_tests {
        use super::*;

        fn learn(s: &mut SessionState, lib: &StaticLibrary, chapters: &[String]) {
            for chapter in chapters {
                for micro in lib.micros(chapter) {
                    complete(s, chapter, &micro.id);
                }
            }
        }

        #[test]
        fn practice_after_base_micro() {
            let mut s = session();
            complete(&mut s, "docker_run", "docker_run_base");
            let decision = evaluate(&LearningPathProgress, &snapshot(Some(s), Vec::new()), &FixedRandom(1.0))
                .unwrap();
            assert_eq!(decision.recommendation.kind, RecommendationType::Practice);
            assert_eq!(decision.recommendation.id, "lesson_docker_run_docker_run_ports");
        }

        #[test]
        fn new_content_reaches_chapters_off_the_path() {
            let lib = library();
            let mut s = session();
            learn(&mut s, &lib, &lib.learning_path().chapters());
            let snap = snapshot(Some(s), Vec::new());
            assert!(evaluate(&LearningPathProgress, &snap, &FixedRandom(1.0)).is_none());
            let decision = select(&snap);
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::NewContent);
            assert_eq!(decision.recommendation.subject(), Some("kubectl_get_pods"));
        }

        #[test]
        fn fallback_when_everything_is_learned() {
            let lib = library();
            let mut s = session();
            learn(&mut s, &lib, &lib.chapters());
            let decision = select(&snapshot(Some(s), Vec::new()));
            assert_eq!(decision.recommendation.priority_tier, PriorityTier::Fallback);
            assert_eq!(decision.recommendation.id, "fallback_docker_run");
        }

        #[test]
        fn empty_library_yields_nothing() {
            let lib = StaticLibrary::empty();
            let snap = snapshot(None, Vec::new());
            let request = SelectionRequest::default();
            let config = SelectorConfig::default();
            let random = FixedRandom(1.0);
            let ctx = SelectionContext::new(&snap, &request, &lib, &config, &random);
            assert!(PrioritySelector::default().select(&ctx).is_none());
        }
    }
}
