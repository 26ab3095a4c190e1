//! Struggle scoring for hands-on lab sessions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::StruggleConfig;

const DEFAULT_EXPECTED_MINUTES: f64 = 30.0;

// (pattern name, any of these substrings in the lowercased error log)
const ERROR_PATTERNS: &[(&str, &[&str])] = &[
    ("permission_errors", &["permission denied"]),
    ("syntax_errors", &["syntax error"]),
    ("command_not_found", &["command not found"]),
    ("network_errors", &["connection", "network"]),
    ("file_not_found", &["no such file"]),
    ("kubernetes_errors", &["kubernetes", "kubectl"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Started,
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub step_number: u32,
    pub status: StepStatus,
}

/// What was observed during one lab session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabSession {
    pub hints_used: u32,
    pub expected_minutes: f64,
    pub actual_minutes: f64,
    pub validation_results: Vec<bool>,
    pub error_logs: Vec<String>,
    pub total_steps: u32,
    pub steps_completed: u32,
    pub step_history: Vec<StepEvent>,
    pub current_step: Option<u32>,
}

impl Default for LabSession {
    fn default() -> Self {
        Self {
            hints_used: 0,
            expected_minutes: DEFAULT_EXPECTED_MINUTES,
            actual_minutes: 0.0,
            validation_results: Vec::new(),
            error_logs: Vec::new(),
            total_steps: 1,
            steps_completed: 0,
            step_history: Vec::new(),
            current_step: None,
        }
    }
}

impl LabSession {
    pub fn time_ratio(&self) -> f64 {
        if self.expected_minutes <= 0.0 {
            0.0
        } else {
            self.actual_minutes / self.expected_minutes
        }
    }

    pub fn validation_failures(&self) -> u32 {
        self.validation_results.iter().filter(|passed| !**passed).count() as u32
    }

    pub fn completion_ratio(&self) -> f64 {
        self.steps_completed as f64 / self.total_steps.max(1) as f64
    }

    pub fn error_patterns(&self) -> Vec<&'static str> {
        let text = self.error_logs.join("\n").to_lowercase();
        let mut patterns: Vec<&'static str> = ERROR_PATTERNS
            .iter()
            .filter(|(_, needles)| needles.iter().any(|n| text.contains(n)))
            .map(|(name, _)| *name)
            .collect();
        if text.contains("docker") && text.contains("error") {
            patterns.push("docker_errors");
        }
        patterns
    }

    /// The last three step events all touched the same step.
    pub fn stuck_on_step(&self) -> bool {
        let history = &self.step_history;
        if history.len() < 3 {
            return false;
        }
        let last = &history[history.len() - 3..];
        last.iter().all(|e| e.step_number == last[0].step_number)
    }

    fn failed_steps(&self) -> Vec<u32> {
        self.step_history
            .iter()
            .filter(|e| e.status == StepStatus::Failed)
            .map(|e| e.step_number)
            .collect()
    }
}

/// Bounded struggle score in [0, 1], rounded to two decimals.
pub fn score(
    hints: u32,
    time_ratio: f64,
    validation_failures: u32,
    error_pattern_count: usize,
    completion_ratio: f64,
) -> f64 {
    let hints = match hints {
        0 => 0.0,
        1 => 0.1,
        2 => 0.15,
        3 => 0.2,
        _ => 0.25,
    };
    let time = if time_ratio <= 1.0 {
        0.0
    } else if time_ratio <= 1.5 {
        0.1
    } else if time_ratio <= 2.0 {
        0.15
    } else if time_ratio <= 3.0 {
        0.2
    } else {
        0.25
    };
    let validation = match validation_failures {
        0 => 0.0,
        1..=2 => 0.1,
        3..=4 => 0.15,
        5..=6 => 0.2,
        _ => 0.25,
    };
    let errors = match error_pattern_count {
        0 => 0.0,
        1 => 0.05,
        2 => 0.1,
        _ => 0.15,
    };
    let completion = if completion_ratio >= 0.8 {
        0.0
    } else if completion_ratio >= 0.5 {
        0.03
    } else if completion_ratio >= 0.25 {
        0.07
    } else {
        0.1
    };

    let total: f64 = hints + time + validation + errors + completion;
    let total = (total.min(1.0) * 100.0).round() / 100.0;
    debug_assert!((0.0..=1.0).contains(&total));
    total
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PainPoint {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub severity: Severity,
    pub details: serde_json::Value,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intervention {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub priority: InterventionPriority,
    pub message: &'static str,
    pub actions: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StruggleReport {
    pub struggle_score: f64,
    pub struggling: bool,
    pub critical: bool,
    pub time_ratio: f64,
    pub validation_failures: u32,
    pub completion_ratio: f64,
    pub stuck_on_step: bool,
    pub error_patterns: Vec<&'static str>,
    pub pain_points: Vec<PainPoint>,
    pub interventions: Vec<Intervention>,
}

pub struct StruggleAnalyzer<'a> {
    session: &'a LabSession,
    config: &'a StruggleConfig,
}

impl<'a> StruggleAnalyzer<'a> {
    pub fn new(session: &'a LabSession, config: &'a StruggleConfig) -> Self {
        Self { session, config }
    }

    pub fn score(&self) -> f64 {
        score(
            self.session.hints_used,
            self.session.time_ratio(),
            self.session.validation_failures(),
            self.session.error_patterns().len(),
            self.session.completion_ratio(),
        )
    }

    pub fn is_struggling(&self) -> bool {
        self.score() >= self.config.struggling_threshold
    }

    pub fn is_critical(&self) -> bool {
        self.score() >= self.config.critical_threshold
    }

    pub fn identify_pain_points(&self) -> Vec<PainPoint> {
        let session = self.session;
        let mut points = Vec::new();

        let failed = session.failed_steps();
        if !failed.is_empty() {
            let steps = failed
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            points.push(PainPoint {
                kind: "step_failures",
                severity: if failed.len() > 2 {
                    Severity::High
                } else {
                    Severity::Medium
                },
                details: json!(failed),
                description: format!("Failed on steps: {}", steps),
            });
        }

        let failures = session.validation_failures();
        if failures > 3 {
            points.push(PainPoint {
                kind: "validation_failures",
                severity: Severity::High,
                details: json!({ "count": failures }),
                description: format!("Multiple validation failures ({})", failures),
            });
        }

        let ratio = session.time_ratio();
        if ratio > 2.0 {
            points.push(PainPoint {
                kind: "time_exceeded",
                severity: if ratio > 3.0 {
                    Severity::Critical
                } else {
                    Severity::High
                },
                details: json!({
                    "ratio": ratio,
                    "expected": session.expected_minutes,
                    "actual": session.actual_minutes,
                }),
                description: format!("Taking {:.1}x longer than expected", ratio),
            });
        }

        let patterns = session.error_patterns();
        if !patterns.is_empty() {
            points.push(PainPoint {
                kind: "error_patterns",
                severity: Severity::Medium,
                details: json!(patterns),
                description: "Recurring error patterns detected".to_string(),
            });
        }

        if session.stuck_on_step() {
            let step = session
                .current_step
                .or_else(|| session.step_history.last().map(|e| e.step_number));
            points.push(PainPoint {
                kind: "stuck_on_step",
                severity: Severity::High,
                details: json!({ "step": step }),
                description: match step {
                    Some(step) => format!("Stuck on step {}", step),
                    None => "Stuck on one step".to_string(),
                },
            });
        }

        points
    }

    pub fn recommended_interventions(&self) -> Vec<Intervention> {
        let mut interventions = Vec::new();

        if self.is_critical() {
            interventions.push(Intervention {
                kind: "break_recommended",
                priority: InterventionPriority::High,
                message: "Take a break and review the prerequisites",
                actions: vec![
                    "Take a 15-30 minute break",
                    "Review related concepts",
                    "Read the hints carefully",
                ],
            });
        } else if self.is_struggling() {
            interventions.push(Intervention {
                kind: "support_needed",
                priority: InterventionPriority::Medium,
                message: "Additional help may be useful",
                actions: vec![
                    "Request a hint",
                    "Re-read the lab instructions",
                    "Look at similar examples",
                ],
            });
        }

        let points = self.identify_pain_points();
        let has = |kind: &str| points.iter().any(|p| p.kind == kind);

        if has("validation_failures") {
            interventions.push(Intervention {
                kind: "validation_help",
                priority: InterventionPriority::Medium,
                message: "Review the validation requirements carefully",
                actions: vec![
                    "Check command syntax",
                    "Verify expected output",
                    "Review step instructions",
                ],
            });
        }
        if has("time_exceeded") {
            interventions.push(Intervention {
                kind: "time_management",
                priority: InterventionPriority::Low,
                message: "Break the problem into smaller steps",
                actions: vec!["Focus on one step at a time", "Use hints to stay on track"],
            });
        }
        if has("error_patterns") {
            interventions.push(Intervention {
                kind: "concept_review",
                priority: InterventionPriority::Medium,
                message: "Review the fundamental concepts",
                actions: vec![
                    "Go back to related lessons",
                    "Practice basic commands",
                    "Check documentation",
                ],
            });
        }

        interventions
    }

    /// When a failed attempt may be retried. Passed attempts have no cooldown.
    pub fn retry_available_at(&self, passed: bool, attempted_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if passed {
            return None;
        }
        let minutes = if self.is_critical() {
            self.config.critical_cooldown_minutes
        } else if self.is_struggling() {
            self.config.struggling_cooldown_minutes
        } else {
            self.config.base_cooldown_minutes
        };
        Some(attempted_at + Duration::minutes(minutes))
    }

    pub fn report(&self) -> StruggleReport {
        let struggle_score = self.score();
        StruggleReport {
            struggle_score,
            struggling: struggle_score >= self.config.struggling_threshold,
            critical: struggle_score >= self.config.critical_threshold,
            time_ratio: self.session.time_ratio(),
            validation_failures: self.session.validation_failures(),
            completion_ratio: self.session.completion_ratio(),
            stuck_on_step: self.session.stuck_on_step(),
            error_patterns: self.session.error_patterns(),
            pain_points: self.identify_pain_points(),
            interventions: self.recommended_interventions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rough_session() -> LabSession {
        LabSession {
            hints_used: 4,
            expected_minutes: 20.0,
            actual_minutes: 70.0,
            validation_results: vec![false, false, false, false, false, true],
            error_logs: vec![
                "bash: dockr: command not found".to_string(),
                "permission denied while trying to connect".to_string(),
            ],
            total_steps: 5,
            steps_completed: 1,
            step_history: vec![
                StepEvent { step_number: 1, status: StepStatus::Passed },
                StepEvent { step_number: 2, status: StepStatus::Failed },
                StepEvent { step_number: 2, status: StepStatus::Failed },
                StepEvent { step_number: 2, status: StepStatus::Failed },
            ],
            current_step: Some(2),
        }
    }

    mod score_tests {
        use super::*;

        #[test]
        fn calm_session_scores_zero() {
            assert_eq!(score(0, 0.8, 0, 0, 1.0), 0.0);
        }

        #[test]
        fn components_are_stepped() {
            assert_eq!(score(1, 1.0, 0, 0, 0.9), 0.1);
            assert_eq!(score(2, 1.4, 0, 0, 0.9), 0.25);
            assert_eq!(score(0, 0.0, 3, 1, 0.6), 0.23);
            assert_eq!(score(0, 0.0, 0, 0, 0.1), 0.1);
        }

        #[test]
        fn capped_at_one() {
            assert_eq!(score(9, 10.0, 20, 7, 0.0), 1.0);
        }

        #[test]
        fn bounded_across_inputs() {
            for hints in 0..6 {
                for failures in 0..9 {
                    for patterns in 0..5 {
                        let s = score(hints, failures as f64 * 0.5, failures, patterns, 0.3);
                        assert!((0.0..=1.0).contains(&s));
                    }
                }
            }
        }
    }

    mod analyzer_tests {
        use super::*;

        #[test]
        fn rough_session_is_critical() {
            let session = rough_session();
            let config = StruggleConfig::default();
            let analyzer = StruggleAnalyzer::new(&session, &config);

            // 0.25 hints + 0.25 time + 0.2 validation + 0.1 patterns + 0.1 completion
            assert_eq!(analyzer.score(), 0.9);
            assert!(analyzer.is_struggling());
            assert!(analyzer.is_critical());
        }

        #[test]
        fn pain_points_are_tagged() {
            let session = rough_session();
            let config = StruggleConfig::default();
            let analyzer = StruggleAnalyzer::new(&session, &config);

            let kinds: Vec<_> = analyzer.identify_pain_points().iter().map(|p| p.kind).collect();
            assert_eq!(
                kinds,
                vec![
                    "step_failures",
                    "validation_failures",
                    "time_exceeded",
                    "error_patterns",
                    "stuck_on_step"
                ]
            );
            let points = analyzer.identify_pain_points();
            assert_eq!(points[0].severity, Severity::High);
            assert_eq!(points[2].severity, Severity::Critical);
            assert_eq!(points[4].description, "Stuck on step 2");
        }

        #[test]
        fn interventions_follow_pain_points() {
            let session = rough_session();
            let config = StruggleConfig::default();
            let analyzer = StruggleAnalyzer::new(&session, &config);

            let kinds: Vec<_> = analyzer
                .recommended_interventions()
                .iter()
                .map(|i| i.kind)
                .collect();
            assert_eq!(
                kinds,
                vec![
                    "break_recommended",
                    "validation_help",
                    "time_management",
                    "concept_review"
                ]
            );
        }

        #[test]
        fn quiet_session_needs_nothing() {
            let session = LabSession {
                actual_minutes: 25.0,
                total_steps: 4,
                steps_completed: 4,
                ..LabSession::default()
            };
            let config = StruggleConfig::default();
            let analyzer = StruggleAnalyzer::new(&session, &config);
            assert!(analyzer.identify_pain_points().is_empty());
            assert!(analyzer.recommended_interventions().is_empty());
        }

        #[test]
        fn cooldown_scales_with_struggle() {
            let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
            let config = StruggleConfig::default();

            let rough = rough_session();
            let analyzer = StruggleAnalyzer::new(&rough, &config);
            assert_eq!(analyzer.retry_available_at(true, at), None);
            assert_eq!(
                analyzer.retry_available_at(false, at),
                Some(at + Duration::hours(24))
            );

            let calm = LabSession {
                steps_completed: 1,
                ..LabSession::default()
            };
            let analyzer = StruggleAnalyzer::new(&calm, &config);
            assert_eq!(
                analyzer.retry_available_at(false, at),
                Some(at + Duration::minutes(30))
            );
        }

        #[test]
        fn docker_errors_need_both_words() {
            let session = LabSession {
                error_logs: vec!["docker: Error response from daemon".to_string()],
                ..LabSession::default()
            };
            assert_eq!(session.error_patterns(), vec!["docker_errors"]);
        }
    }
}
