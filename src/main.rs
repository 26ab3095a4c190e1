use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cadence::canonical;
use cadence::config::{get_config_path, get_db_path, get_library_path, EngineConfig};
use cadence::content::{ContentLibrary, StaticLibrary};
use cadence::db::Database;
use cadence::engine::Engine;
use cadence::mastery::{AttemptContext, GateResult};
use cadence::models::{Grade, ItemKind, JsonOutput, LearningGoal, SkillItem, Track};
use cadence::scheduler::QueueOptions;
use cadence::selector::SelectionRequest;
use cadence::struggle::LabSession;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Adaptive review scheduling for hands-on command-line courses")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Learner to act for
    #[arg(long, short, global = true, default_value = "default")]
    learner: String,

    /// Course JSON to use instead of the bundled docker course
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and write a default config
    Init,

    /// Show or change the learner's goal and track
    Goal {
        /// exam_prep, standard or casual
        goal: Option<String>,

        /// docker, kubernetes or any
        #[arg(long, short)]
        track: Option<String>,
    },

    /// Grade a review of an item
    Grade {
        /// Item key or raw command
        item: String,

        /// again/hard/good/easy (or 1-4)
        grade: String,

        /// command, concept or lab
        #[arg(long, short, default_value = "command")]
        kind: String,

        /// Idempotency key; repeating it replays the first result
        #[arg(long)]
        key: Option<String>,
    },

    /// Show reviews ordered by urgency
    Queue {
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,

        /// Include items that are not due yet
        #[arg(long)]
        all: bool,

        #[arg(long, short)]
        kind: Option<String>,
    },

    /// Show review details for one item
    Item {
        key: String,
    },

    /// Show learning statistics
    Stats,

    /// Show upcoming review load
    Load,

    /// Send long-overdue items back to relearning
    ResetStale,

    /// Tune memory parameters to the learner's goal
    Optimize,

    /// Record a command attempt against skill mastery
    Attempt {
        /// Raw command as typed
        command: String,

        /// The attempt failed
        #[arg(long)]
        fail: bool,

        /// practice, quiz, lab, remedial or review
        #[arg(long, short, default_value = "practice")]
        context: String,
    },

    /// Check whether prerequisite skills are mastered
    Gate {
        /// Required skills (keys or raw commands)
        #[arg(required = true)]
        skills: Vec<String>,
    },

    /// Summarize mastery across all skills
    Mastery,

    /// Manage the learning session
    #[command(subcommand)]
    Session(SessionCommands),

    /// Record a finished lab from a session JSON file
    Lab {
        lab_id: String,

        /// Lab session JSON (hints, timings, validation results, step history)
        #[arg(long, short)]
        file: PathBuf,

        #[arg(long)]
        passed: bool,

        /// Comma-separated commands that failed
        #[arg(long, value_delimiter = ',')]
        failed: Vec<String>,
    },

    /// Pick the next thing to study
    Next {
        /// Comma-separated ids or keys to skip
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// The previous answer was correct
        #[arg(long)]
        last_correct: bool,

        /// Accept the pick and apply its session effects
        #[arg(long)]
        accept: bool,
    },

    /// Show canonical skill keys for a command or a pasted block of text
    Canon {
        command: String,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Start a new session, closing any open one
    Start,

    /// Close the open session
    Close,

    /// Move to a chapter (and optionally a micro); without one, the next
    /// unlearned chapter
    Goto {
        chapter: Option<String>,
        micro: Option<String>,
    },

    /// Mark a micro completed
    Complete {
        chapter: String,
        micro: String,
    },

    /// Record an answer to an item
    Answer {
        item: String,

        #[arg(long)]
        wrong: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli) {
        if cli.json {
            if let Ok(out) = serde_json::to_string(&JsonOutput::<()>::err(format!("{:#}", e))) {
                println!("{}", out);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "cadence=debug" } else { "cadence=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn open_engine(cli: &Cli) -> anyhow::Result<Engine<Database>> {
    let config_path = get_config_path();
    let config = EngineConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let db_path = get_db_path();
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let db = Database::open(&db_path)?;
    db.init()?;

    let library: Box<dyn ContentLibrary> = match cli.library.clone().or_else(get_library_path) {
        Some(path) => Box::new(
            StaticLibrary::load(&path)
                .with_context(|| format!("loading course from {}", path.display()))?,
        ),
        None => Box::new(StaticLibrary::builtin()?),
    };

    Ok(Engine::new(db, library, config)?)
}

fn print_json<T: Serialize>(data: T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(&JsonOutput::ok(data))?);
    Ok(())
}

fn parse_track(track: Option<&str>) -> anyhow::Result<Option<Track>> {
    match track {
        Some(t) => Track::from_str(t)
            .map(Some)
            .ok_or_else(|| anyhow!("Invalid track '{}'. Use: docker, kubernetes, or any", t)),
        None => Ok(None),
    }
}

/// Keys for a single command, or every command mentioned in a block of text.
fn canon_keys(text: &str) -> Vec<String> {
    match canonical::canonicalize(text) {
        Some(key) => vec![key],
        None => canonical::extract_commands(text),
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let now = Utc::now();
    let learner = cli.learner.as_str();

    if let Commands::Canon { command } = &cli.command {
        let keys = canon_keys(command);
        if cli.json {
            let data: Vec<_> = keys
                .iter()
                .map(|key| serde_json::json!({ "key": key, "category": canonical::category(key) }))
                .collect();
            print_json(serde_json::json!({ "command": command, "keys": data }))?;
        } else if keys.is_empty() {
            println!("Not a recognized command.");
        } else {
            for key in &keys {
                println!("{} ({})", key, canonical::category(key));
            }
        }
        return Ok(());
    }

    let engine = open_engine(cli)?;

    match &cli.command {
        Commands::Init => {
            let config_path = get_config_path();
            if !config_path.exists() {
                engine.config().save(&config_path)?;
            }
            if cli.json {
                print_json(())?;
            } else {
                println!("Database initialized at: {}", get_db_path().display());
                println!("Config: {}", config_path.display());
            }
        }

        Commands::Goal { goal, track } => {
            let goal = match goal {
                Some(g) => Some(LearningGoal::from_str(g).ok_or_else(|| {
                    anyhow!("Invalid goal '{}'. Use: exam_prep, standard, or casual", g)
                })?),
                None => None,
            };
            let track = parse_track(track.as_deref())?;
            let profile = if goal.is_some() || track.is_some() {
                engine.set_profile(learner, goal, track)?
            } else {
                engine.profile(learner)?
            };
            if cli.json {
                print_json(&profile)?;
            } else {
                println!("Learner: {}", profile.id);
                println!("Goal: {}", profile.goal.as_str());
                println!("Track: {}", profile.track.as_str());
            }
        }

        Commands::Grade {
            item,
            grade,
            kind,
            key,
        } => {
            let grade = Grade::parse(grade)?;
            let kind = ItemKind::from_str(kind)
                .ok_or_else(|| anyhow!("Invalid kind '{}'. Use: command, concept, or lab", kind))?;
            let item_key = match kind {
                ItemKind::Command => canonical::canonicalize(item).unwrap_or_else(|| item.clone()),
                _ => item.clone(),
            };
            let item = SkillItem {
                key: item_key,
                kind,
            };
            let result = engine.grade_review(learner, &item, grade, now, key.as_deref())?;
            if cli.json {
                print_json(&result)?;
            } else {
                if result.replayed {
                    println!("Already recorded; showing the original result.");
                }
                println!("Graded {} as {}.", item.key, grade.as_str());
                println!(
                    "Retention was {:.0}%. Tier: {}",
                    result.retention * 100.0,
                    result.tier.label()
                );
                println!(
                    "Next review in {} day(s): {}",
                    result.interval_days,
                    result.state.next_review_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        Commands::Queue { limit, all, kind } => {
            let kind = match kind {
                Some(k) => Some(
                    ItemKind::from_str(k)
                        .ok_or_else(|| anyhow!("Invalid kind '{}'", k))?,
                ),
                None => None,
            };
            let options = QueueOptions {
                limit: *limit,
                include_future: *all,
                kind,
            };
            let queue = engine.scheduler().review_queue(learner, &options, now)?;
            if cli.json {
                print_json(&queue)?;
            } else if queue.is_empty() {
                println!("Nothing due. Come back later!");
            } else {
                println!("{:<32} {:>8} {:>10} {:>9}", "ITEM", "URGENCY", "RECALL", "OVERDUE");
                println!("{}", "-".repeat(62));
                for entry in queue {
                    println!(
                        "{:<32} {:>8.2} {:>9.0}% {:>8.1}d",
                        truncate(&entry.item.key, 30),
                        entry.urgency,
                        entry.retrievability * 100.0,
                        entry.days_overdue
                    );
                }
            }
        }

        Commands::Item { key } => {
            let stats = engine.scheduler().item_stats(learner, key, now)?;
            match stats {
                Some(stats) if cli.json => print_json(&stats)?,
                Some(stats) => {
                    println!("Item: {} ({})", stats.item.key, stats.item.kind.as_str());
                    println!("Tier: {}", stats.tier.label());
                    println!(
                        "Reviews: {} ({} lapses, {:.0}% success)",
                        stats.review_count,
                        stats.lapse_count,
                        stats.success_rate * 100.0
                    );
                    println!("Stability: {:.2} days", stats.stability);
                    println!("Difficulty: {:.2}", stats.difficulty);
                    println!("Recall now: {:.0}%", stats.retrievability * 100.0);
                    println!("Next review: {}", stats.next_review_at.format("%Y-%m-%d %H:%M"));
                }
                None if cli.json => {
                    println!("{}", serde_json::to_string(&JsonOutput::<()>::err("Item not found"))?)
                }
                None => println!("Item not found."),
            }
        }

        Commands::Stats => {
            let stats = engine.store().get_stats(learner, now)?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!("=== Learning Statistics ===");
                println!("Tracked items: {}", stats.tracked_items);
                println!("Total reviews: {}", stats.total_reviews);
                println!("Due for review: {}", stats.due_now);
                println!("Tracked skills: {}", stats.tracked_skills);
                println!("Average proficiency: {:.1}/100", stats.avg_proficiency);
            }
        }

        Commands::Load => {
            let load = engine.scheduler().review_load(learner, now)?;
            if cli.json {
                print_json(&load)?;
            } else {
                println!("Due now: {}", load.due_now);
                println!("Within a day: {}", load.within_day);
                println!("Within a week: {}", load.within_week);
                println!("Tracked items: {}", load.total_items);
                println!("Suggested time today: {} min", load.recommended_minutes);
            }
        }

        Commands::ResetStale => {
            let reset = engine.scheduler().reset_stale_items(learner, now)?;
            if cli.json {
                print_json(serde_json::json!({ "reset": reset }))?;
            } else {
                println!("Reset {} stale item(s).", reset);
            }
        }

        Commands::Optimize => {
            let params = engine.scheduler().optimize_parameters(learner)?;
            if cli.json {
                print_json(&params)?;
            } else {
                println!("Target retention: {:.2}", params.target_retention);
                println!(
                    "Interval range: {:.0} - {:.0} days",
                    params.minimum_interval, params.maximum_interval
                );
            }
        }

        Commands::Attempt {
            command,
            fail,
            context,
        } => {
            let context = AttemptContext::from_str(context)
                .ok_or_else(|| anyhow!("Invalid context '{}'", context))?;
            let record = engine.record_attempt(learner, command, !fail, context, now)?;
            match record {
                Some(record) if cli.json => print_json(&record)?,
                Some(record) => println!(
                    "{}: {:.0}/100 after {} attempt(s)",
                    record.skill, record.proficiency_score, record.total_attempts
                ),
                None if cli.json => println!(
                    "{}",
                    serde_json::to_string(&JsonOutput::<()>::err("Not a recognized command"))?
                ),
                None => println!("Not a recognized command; nothing recorded."),
            }
        }

        Commands::Gate { skills } => {
            let skills: Vec<String> = skills
                .iter()
                .map(|s| canonical::canonicalize(s).unwrap_or_else(|| s.clone()))
                .collect();
            let result = engine.remedial_gate(learner, &skills, now)?;
            if cli.json {
                print_json(&result)?;
            } else {
                match result {
                    GateResult::Ok { skills } => {
                        println!("Ready. All {} skill(s) mastered.", skills.len())
                    }
                    GateResult::Blocked {
                        remedial_drills, ..
                    } => {
                        println!("Blocked. Practice these first:");
                        for drill in remedial_drills {
                            println!(
                                "  {:<28} {:>5.1}/100  ~{} more, {:?} hints",
                                drill.label,
                                drill.current_score,
                                drill.attempts_needed,
                                drill.hint_level
                            );
                        }
                    }
                }
            }
        }

        Commands::Mastery => {
            let summary = engine.mastery_summary(learner, now)?;
            if cli.json {
                print_json(&summary)?;
            } else if summary.total == 0 {
                println!("No skills practiced yet.");
            } else {
                println!(
                    "Mastered {}/{} ({:.1}%), {} need practice",
                    summary.mastered, summary.total, summary.mastery_percentage, summary.needs_practice
                );
                println!();
                println!("{:<32} {:>6} {:>8} RISK", "SKILL", "RAW", "CURRENT");
                println!("{}", "-".repeat(56));
                for skill in summary.skills {
                    println!(
                        "{:<32} {:>6.1} {:>8.1} {}",
                        truncate(&skill.label, 30),
                        skill.raw_score,
                        skill.decayed_score,
                        skill.risk.as_str()
                    );
                }
            }
        }

        Commands::Session(session_cmd) => match session_cmd {
            SessionCommands::Start => {
                let session = engine.start_session(learner, now)?;
                if cli.json {
                    print_json(&session)?;
                } else {
                    println!("Started session {}.", session.id);
                }
            }
            SessionCommands::Close => {
                let closed = engine.close_session(learner, now)?;
                if cli.json {
                    print_json(serde_json::json!({ "closed": closed }))?;
                } else if closed {
                    println!("Session closed.");
                } else {
                    println!("No open session.");
                }
            }
            SessionCommands::Goto { chapter, micro } => {
                let session = match chapter {
                    Some(chapter) => engine.goto(learner, chapter, micro.as_deref(), now)?,
                    None => engine.goto_next(learner, now)?,
                };
                if cli.json {
                    print_json(&session)?;
                } else {
                    println!(
                        "Now on {} / {}",
                        session.current_chapter.as_deref().unwrap_or("-"),
                        session.current_micro_id.as_deref().unwrap_or("-")
                    );
                }
            }
            SessionCommands::Complete { chapter, micro } => {
                let session = engine.complete_micro(learner, chapter, micro, now)?;
                if cli.json {
                    print_json(&session)?;
                } else {
                    println!("Completed {} / {}.", chapter, micro);
                }
            }
            SessionCommands::Answer { item, wrong } => {
                let response = engine.answer(learner, item, !wrong, now)?;
                if cli.json {
                    print_json(&response)?;
                } else {
                    println!(
                        "Recorded {} answer to {}.",
                        if response.correct { "correct" } else { "wrong" },
                        item
                    );
                }
            }
        },

        Commands::Lab {
            lab_id,
            file,
            passed,
            failed,
        } => {
            let raw = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let session: LabSession = serde_json::from_str(&raw)
                .with_context(|| format!("parsing lab session {}", file.display()))?;
            let (attempt, report) =
                engine.record_lab_attempt(learner, lab_id, &session, *passed, failed, now)?;
            if cli.json {
                print_json(serde_json::json!({ "attempt": attempt, "report": report }))?;
            } else {
                println!(
                    "Lab {} {}. Struggle score: {:.2}",
                    lab_id,
                    if attempt.passed { "passed" } else { "failed" },
                    report.struggle_score
                );
                if let Some(at) = attempt.retry_available_at {
                    println!("Retry available: {}", at.format("%Y-%m-%d %H:%M"));
                }
                for point in &report.pain_points {
                    println!("  - {}", point.description);
                }
                for intervention in &report.interventions {
                    println!("  > {}", intervention.message);
                }
            }
        }

        Commands::Next {
            exclude,
            last_correct,
            accept,
        } => {
            let request = SelectionRequest {
                exclude_ids: exclude.iter().cloned().collect(),
                last_correct: *last_correct,
            };
            let decision = engine.next_content(learner, &request, now)?;
            if *accept {
                if let Some(decision) = &decision {
                    engine.accept(learner, decision, now)?;
                }
            }
            if cli.json {
                print_json(&decision)?;
            } else if let Some(decision) = decision {
                let rec = &decision.recommendation;
                println!("=== Next Up ===");
                println!();
                println!(
                    "{} [{}]",
                    rec.payload
                        .get("title")
                        .and_then(|t| t.as_str())
                        .unwrap_or(&rec.id),
                    rec.kind.as_str()
                );
                println!(
                    "Why: {} (tier {})",
                    rec.priority_tier.as_str(),
                    rec.priority_tier.value()
                );
                println!("Id: {}", rec.id);
            } else {
                println!("Nothing to recommend. Is the course empty?");
            }
        }

        Commands::Canon { .. } => {}
    }
    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    mod truncate_tests {
        use super::*;

        #[test]
        fn truncate_short_string() {
            assert_eq!(truncate("docker_run", 20), "docker_run");
        }

        #[test]
        fn truncate_exact_length() {
            assert_eq!(truncate("docker_run", 10), "docker_run");
        }

        #[test]
        fn truncate_long_string() {
            assert_eq!(truncate("docker_compose_up", 12), "docker_co...");
        }
    }

    mod canon_tests {
        use super::*;

        #[test]
        fn single_command_gives_one_key() {
            assert_eq!(canon_keys("docker ps -a"), vec!["docker_ps".to_string()]);
        }

        #[test]
        fn lesson_text_gives_every_mentioned_key() {
            let keys = canon_keys("First run `docker run nginx`, then check it with `docker ps`.");
            assert_eq!(keys, vec!["docker_run".to_string(), "docker_ps".to_string()]);
        }
    }

    mod cli_parsing_tests {
        use super::*;

        #[test]
        fn parse_init_with_json() {
            let cli = Cli::try_parse_from(["cadence", "--json", "init"]).unwrap();
            assert!(cli.json);
            assert_eq!(cli.learner, "default");
            assert!(matches!(cli.command, Commands::Init));
        }

        #[test]
        fn parse_grade_with_key() {
            let cli = Cli::try_parse_from([
                "cadence", "-l", "ada", "grade", "docker ps -a", "good", "--key", "r-1",
            ])
            .unwrap();
            assert_eq!(cli.learner, "ada");
            match cli.command {
                Commands::Grade {
                    item,
                    grade,
                    kind,
                    key,
                } => {
                    assert_eq!(item, "docker ps -a");
                    assert_eq!(grade, "good");
                    assert_eq!(kind, "command");
                    assert_eq!(key.as_deref(), Some("r-1"));
                }
                _ => panic!("Expected Grade command"),
            }
        }

        #[test]
        fn parse_next_with_exclusions() {
            let cli = Cli::try_parse_from([
                "cadence",
                "next",
                "--exclude",
                "docker_run,review_docker_ps",
                "--accept",
            ])
            .unwrap();
            match cli.command {
                Commands::Next {
                    exclude,
                    last_correct,
                    accept,
                } => {
                    assert_eq!(exclude, vec!["docker_run", "review_docker_ps"]);
                    assert!(!last_correct);
                    assert!(accept);
                }
                _ => panic!("Expected Next command"),
            }
        }

        #[test]
        fn parse_session_answer() {
            let cli =
                Cli::try_parse_from(["cadence", "session", "answer", "q7", "--wrong"]).unwrap();
            match cli.command {
                Commands::Session(SessionCommands::Answer { item, wrong }) => {
                    assert_eq!(item, "q7");
                    assert!(wrong);
                }
                _ => panic!("Expected Session Answer command"),
            }
        }

        #[test]
        fn parse_lab_failed_list() {
            let cli = Cli::try_parse_from([
                "cadence",
                "lab",
                "lab_first_container",
                "--file",
                "run.json",
                "--failed",
                "docker ps,docker logs web",
            ])
            .unwrap();
            match cli.command {
                Commands::Lab {
                    lab_id,
                    file,
                    passed,
                    failed,
                } => {
                    assert_eq!(lab_id, "lab_first_container");
                    assert_eq!(file, PathBuf::from("run.json"));
                    assert!(!passed);
                    assert_eq!(failed, vec!["docker ps", "docker logs web"]);
                }
                _ => panic!("Expected Lab command"),
            }
        }

        #[test]
        fn parse_goto_without_chapter() {
            let cli = Cli::try_parse_from(["cadence", "session", "goto"]).unwrap();
            match cli.command {
                Commands::Session(SessionCommands::Goto { chapter, micro }) => {
                    assert!(chapter.is_none());
                    assert!(micro.is_none());
                }
                _ => panic!("Expected Session Goto command"),
            }
        }

        #[test]
        fn unknown_track_is_rejected() {
            let cli = Cli::try_parse_from(["cadence", "goal", "casual", "-t", "dockr"]).unwrap();
            match cli.command {
                Commands::Goal { goal, track } => {
                    assert_eq!(goal.as_deref(), Some("casual"));
                    assert!(parse_track(track.as_deref()).is_err());
                    assert_eq!(parse_track(Some("k8s")).unwrap(), Some(Track::Kubernetes));
                    assert_eq!(parse_track(None).unwrap(), None);
                }
                _ => panic!("Expected Goal command"),
            }
        }

        #[test]
        fn gate_requires_skills() {
            assert!(Cli::try_parse_from(["cadence", "gate"]).is_err());
        }
    }
}
