use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::memory::MemoryParams;
use crate::models::{
    Grade, ItemKind, LabAttempt, LearnerProfile, LearningGoal, MasteryRecord, ResponseRecord,
    ReviewPhase, ReviewState, ScheduleResult, SessionState, SkillItem, Track,
};
use crate::store::{
    LabAttemptStore, LearnerStore, MasteryStore, ReviewLogEntry, ReviewStateStore, SessionStore,
};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS learners (
                id TEXT PRIMARY KEY,
                goal TEXT NOT NULL DEFAULT 'standard' CHECK(goal IN ('exam_prep', 'standard', 'casual')),
                track TEXT NOT NULL DEFAULT 'any',
                params TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS review_states (
                learner_id TEXT NOT NULL,
                item_key TEXT NOT NULL,
                item_kind TEXT NOT NULL CHECK(item_kind IN ('command', 'concept', 'lab')),
                difficulty REAL NOT NULL CHECK(difficulty BETWEEN 1 AND 10),
                stability REAL NOT NULL CHECK(stability > 0),
                review_count INTEGER NOT NULL DEFAULT 0,
                lapse_count INTEGER NOT NULL DEFAULT 0,
                last_reviewed_at TEXT,
                next_review_at TEXT NOT NULL,
                last_grade TEXT NOT NULL,
                interval_days INTEGER NOT NULL,
                phase TEXT NOT NULL CHECK(phase IN ('learning', 'review', 'relearning')),
                version INTEGER NOT NULL,
                PRIMARY KEY (learner_id, item_key),
                CHECK(lapse_count <= review_count)
            );

            -- Append-only; doubles as the idempotency ledger
            CREATE TABLE IF NOT EXISTS review_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                learner_id TEXT NOT NULL,
                item_key TEXT NOT NULL,
                grade TEXT NOT NULL,
                reviewed_at TEXT NOT NULL,
                elapsed_days REAL NOT NULL,
                retrievability REAL NOT NULL,
                idempotency_key TEXT,
                result TEXT NOT NULL,
                UNIQUE (learner_id, idempotency_key)
            );

            CREATE TABLE IF NOT EXISTS masteries (
                learner_id TEXT NOT NULL,
                skill TEXT NOT NULL,
                category TEXT NOT NULL,
                proficiency_score REAL NOT NULL DEFAULT 0 CHECK(proficiency_score BETWEEN 0 AND 100),
                total_attempts INTEGER NOT NULL DEFAULT 0,
                successful_attempts INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                PRIMARY KEY (learner_id, skill)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                learner_id TEXT NOT NULL,
                current_chapter TEXT,
                current_micro_id TEXT,
                completed_micros TEXT NOT NULL DEFAULT '{}',
                last_review_chapter_position INTEGER NOT NULL DEFAULT 0,
                last_lab_chapter_position INTEGER NOT NULL DEFAULT 0,
                items_presented INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS session_responses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                item_id TEXT NOT NULL,
                chapter TEXT,
                micro_id TEXT,
                correct INTEGER NOT NULL,
                answered_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS lab_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                learner_id TEXT NOT NULL,
                lab_id TEXT NOT NULL,
                passed INTEGER NOT NULL,
                struggle_score REAL NOT NULL,
                failed_skills TEXT NOT NULL DEFAULT '[]',
                attempted_at TEXT NOT NULL,
                retry_available_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_review_states_due ON review_states(learner_id, next_review_at);
            CREATE INDEX IF NOT EXISTS idx_review_states_lapses ON review_states(learner_id, lapse_count);
            CREATE INDEX IF NOT EXISTS idx_review_log_learner ON review_log(learner_id);
            CREATE INDEX IF NOT EXISTS idx_masteries_score ON masteries(learner_id, proficiency_score);
            CREATE INDEX IF NOT EXISTS idx_sessions_learner ON sessions(learner_id, closed_at);
            CREATE INDEX IF NOT EXISTS idx_responses_session ON session_responses(session_id);
            CREATE INDEX IF NOT EXISTS idx_lab_attempts_learner ON lab_attempts(learner_id, attempted_at);
            "#,
        )?;
        Ok(())
    }

    pub fn get_stats(&self, learner_id: &str, now: DateTime<Utc>) -> Result<Stats> {
        let tracked_items: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM review_states WHERE learner_id = ?1",
            params![learner_id],
            |row| row.get(0),
        )?;

        let total_reviews: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM review_log WHERE learner_id = ?1",
            params![learner_id],
            |row| row.get(0),
        )?;

        let due_now: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM review_states WHERE learner_id = ?1 AND next_review_at <= ?2",
            params![learner_id, ts(now)],
            |row| row.get(0),
        )?;

        let tracked_skills: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM masteries WHERE learner_id = ?1",
            params![learner_id],
            |row| row.get(0),
        )?;

        let avg_proficiency: f64 = self.conn.query_row(
            "SELECT COALESCE(AVG(proficiency_score), 0) FROM masteries WHERE learner_id = ?1",
            params![learner_id],
            |row| row.get(0),
        )?;

        Ok(Stats {
            tracked_items,
            total_reviews,
            due_now,
            tracked_skills,
            avg_proficiency,
        })
    }

    fn load_responses(&self, session_id: i64) -> Result<Vec<ResponseRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, item_id, chapter, micro_id, correct, answered_at
            FROM session_responses
            WHERE session_id = ?1
            ORDER BY answered_at, id
            "#,
        )?;
        let rows = stmt.query_map(params![session_id], row_to_response)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn load_session(&self, sql: &str, key: &dyn rusqlite::ToSql) -> Result<Option<SessionState>> {
        let session = self
            .conn
            .query_row(sql, [key], row_to_session)
            .optional()?;

        match session {
            Some(mut s) => {
                s.responses = self.load_responses(s.id)?;
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Stats {
    pub tracked_items: i64,
    pub total_reviews: i64,
    pub due_now: i64,
    pub tracked_skills: i64,
    pub avg_proficiency: f64,
}

const REVIEW_STATE_COLUMNS: &str = "learner_id, item_key, item_kind, difficulty, stability, \
     review_count, lapse_count, last_reviewed_at, next_review_at, last_grade, interval_days, \
     phase, version";

const SESSION_COLUMNS: &str = "id, learner_id, current_chapter, current_micro_id, \
     completed_micros, last_review_chapter_position, last_lab_chapter_position, items_presented, \
     started_at, updated_at";

/// Fixed-width UTC timestamps so text comparison in SQL orders correctly.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unrecognized value '{}'", value).into(),
    )
}

fn parse_column<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, &raw))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_review_state(row: &Row) -> rusqlite::Result<ReviewState> {
    Ok(ReviewState {
        learner_id: row.get(0)?,
        item: SkillItem {
            key: row.get(1)?,
            kind: parse_column(row, 2, ItemKind::from_str)?,
        },
        difficulty: row.get(3)?,
        stability: row.get(4)?,
        review_count: row.get(5)?,
        lapse_count: row.get(6)?,
        last_reviewed_at: row.get(7)?,
        next_review_at: row.get(8)?,
        last_grade: parse_column(row, 9, Grade::from_str)?,
        interval_days: row.get(10)?,
        phase: parse_column(row, 11, ReviewPhase::from_str)?,
        version: row.get(12)?,
    })
}

fn row_to_mastery(row: &Row) -> rusqlite::Result<MasteryRecord> {
    Ok(MasteryRecord {
        learner_id: row.get(0)?,
        skill: row.get(1)?,
        category: row.get(2)?,
        proficiency_score: row.get(3)?,
        total_attempts: row.get(4)?,
        successful_attempts: row.get(5)?,
        consecutive_failures: row.get(6)?,
        last_used_at: row.get(7)?,
    })
}

fn row_to_session(row: &Row) -> rusqlite::Result<SessionState> {
    let completed_micros: BTreeMap<_, _> = json_column(row, 4)?;
    Ok(SessionState {
        id: row.get(0)?,
        learner_id: row.get(1)?,
        current_chapter: row.get(2)?,
        current_micro_id: row.get(3)?,
        completed_micros,
        last_review_chapter_position: row.get(5)?,
        last_lab_chapter_position: row.get(6)?,
        items_presented: row.get(7)?,
        started_at: row.get(8)?,
        updated_at: row.get(9)?,
        responses: vec![],
    })
}

fn row_to_response(row: &Row) -> rusqlite::Result<ResponseRecord> {
    Ok(ResponseRecord {
        session_id: row.get(0)?,
        item_id: row.get(1)?,
        chapter: row.get(2)?,
        micro_id: row.get(3)?,
        correct: row.get(4)?,
        answered_at: row.get(5)?,
    })
}

fn row_to_lab_attempt(row: &Row) -> rusqlite::Result<LabAttempt> {
    Ok(LabAttempt {
        id: row.get(0)?,
        learner_id: row.get(1)?,
        lab_id: row.get(2)?,
        passed: row.get(3)?,
        struggle_score: row.get(4)?,
        failed_skills: json_column(row, 5)?,
        attempted_at: row.get(6)?,
        retry_available_at: row.get(7)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl ReviewStateStore for Database {
    fn review_state(&self, learner_id: &str, item_key: &str) -> Result<Option<ReviewState>> {
        let sql = format!(
            "SELECT {} FROM review_states WHERE learner_id = ?1 AND item_key = ?2",
            REVIEW_STATE_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![learner_id, item_key], row_to_review_state)
            .optional()?)
    }

    fn review_states(&self, learner_id: &str, kind: Option<ItemKind>) -> Result<Vec<ReviewState>> {
        let sql = format!(
            "SELECT {} FROM review_states WHERE learner_id = ?1 AND (?2 IS NULL OR item_kind = ?2) ORDER BY item_key",
            REVIEW_STATE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![learner_id, kind.map(|k| k.as_str())],
            row_to_review_state,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn due_review_states(
        &self,
        learner_id: &str,
        until: DateTime<Utc>,
    ) -> Result<Vec<ReviewState>> {
        let sql = format!(
            "SELECT {} FROM review_states WHERE learner_id = ?1 AND next_review_at <= ?2 ORDER BY next_review_at, item_key",
            REVIEW_STATE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![learner_id, ts(until)], row_to_review_state)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn lapsed_review_states(&self, learner_id: &str, min_lapses: u32) -> Result<Vec<ReviewState>> {
        let sql = format!(
            "SELECT {} FROM review_states WHERE learner_id = ?1 AND lapse_count >= ?2 ORDER BY lapse_count DESC, item_key",
            REVIEW_STATE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![learner_id, min_lapses], row_to_review_state)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn commit_review(
        &self,
        result: &ScheduleResult,
        expected_version: u32,
        log: Option<&ReviewLogEntry>,
    ) -> Result<()> {
        let state = &result.state;
        let conflict = || EngineError::Conflict {
            learner: state.learner_id.clone(),
            item: state.item.key.clone(),
            expected: expected_version,
        };

        // Dropping the transaction without commit rolls it back.
        let tx = self.conn.unchecked_transaction()?;

        let written = if expected_version == 0 {
            tx.execute(
                r#"
                INSERT OR IGNORE INTO review_states (
                    learner_id, item_key, item_kind, difficulty, stability, review_count,
                    lapse_count, last_reviewed_at, next_review_at, last_grade, interval_days,
                    phase, version
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    state.learner_id,
                    state.item.key,
                    state.item.kind.as_str(),
                    state.difficulty,
                    state.stability,
                    state.review_count,
                    state.lapse_count,
                    state.last_reviewed_at.map(ts),
                    ts(state.next_review_at),
                    state.last_grade.as_str(),
                    state.interval_days,
                    state.phase.as_str(),
                    state.version,
                ],
            )?
        } else {
            tx.execute(
                r#"
                UPDATE review_states
                SET difficulty = ?3, stability = ?4, review_count = ?5, lapse_count = ?6,
                    last_reviewed_at = ?7, next_review_at = ?8, last_grade = ?9,
                    interval_days = ?10, phase = ?11, version = ?12
                WHERE learner_id = ?1 AND item_key = ?2 AND version = ?13
                "#,
                params![
                    state.learner_id,
                    state.item.key,
                    state.difficulty,
                    state.stability,
                    state.review_count,
                    state.lapse_count,
                    state.last_reviewed_at.map(ts),
                    ts(state.next_review_at),
                    state.last_grade.as_str(),
                    state.interval_days,
                    state.phase.as_str(),
                    state.version,
                    expected_version,
                ],
            )?
        };

        if written == 0 {
            return Err(conflict());
        }

        if let Some(entry) = log {
            let stored = serde_json::to_string(result)?;
            let inserted = tx.execute(
                r#"
                INSERT INTO review_log (
                    learner_id, item_key, grade, reviewed_at, elapsed_days, retrievability,
                    idempotency_key, result
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    entry.learner_id,
                    entry.item_key,
                    entry.grade.as_str(),
                    ts(entry.reviewed_at),
                    entry.elapsed_days,
                    entry.retrievability,
                    entry.idempotency_key,
                    stored,
                ],
            );
            match inserted {
                Ok(_) => {}
                // Same idempotency key committed by a concurrent writer.
                Err(e) if is_constraint_violation(&e) => return Err(conflict()),
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn replay(&self, learner_id: &str, idempotency_key: &str) -> Result<Option<ScheduleResult>> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT result FROM review_log WHERE learner_id = ?1 AND idempotency_key = ?2",
                params![learner_id, idempotency_key],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(json) => {
                let mut result: ScheduleResult = serde_json::from_str(&json)?;
                result.replayed = true;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    fn logged_review_count(&self, learner_id: &str) -> Result<u32> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM review_log WHERE learner_id = ?1",
            params![learner_id],
            |row| row.get(0),
        )?)
    }
}

impl MasteryStore for Database {
    fn mastery(&self, learner_id: &str, skill: &str) -> Result<Option<MasteryRecord>> {
        Ok(self
            .conn
            .query_row(
                r#"
                SELECT learner_id, skill, category, proficiency_score, total_attempts,
                       successful_attempts, consecutive_failures, last_used_at
                FROM masteries
                WHERE learner_id = ?1 AND skill = ?2
                "#,
                params![learner_id, skill],
                row_to_mastery,
            )
            .optional()?)
    }

    fn masteries(&self, learner_id: &str) -> Result<Vec<MasteryRecord>> {
        self.masteries_in_band(learner_id, 0.0, f64::INFINITY)
    }

    fn masteries_in_band(
        &self,
        learner_id: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<MasteryRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT learner_id, skill, category, proficiency_score, total_attempts,
                   successful_attempts, consecutive_failures, last_used_at
            FROM masteries
            WHERE learner_id = ?1 AND proficiency_score >= ?2 AND proficiency_score < ?3
            ORDER BY skill
            "#,
        )?;
        // SQLite has no infinity literal; 1e308 is above any stored score.
        let max = if max.is_finite() { max } else { 1e308 };
        let rows = stmt.query_map(params![learner_id, min, max], row_to_mastery)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn save_mastery(&self, record: &MasteryRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO masteries (
                learner_id, skill, category, proficiency_score, total_attempts,
                successful_attempts, consecutive_failures, last_used_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(learner_id, skill) DO UPDATE SET
                category = excluded.category,
                proficiency_score = excluded.proficiency_score,
                total_attempts = excluded.total_attempts,
                successful_attempts = excluded.successful_attempts,
                consecutive_failures = excluded.consecutive_failures,
                last_used_at = excluded.last_used_at
            "#,
            params![
                record.learner_id,
                record.skill,
                record.category,
                record.proficiency_score,
                record.total_attempts,
                record.successful_attempts,
                record.consecutive_failures,
                record.last_used_at.map(ts),
            ],
        )?;
        Ok(())
    }
}

impl SessionStore for Database {
    fn active_session(&self, learner_id: &str) -> Result<Option<SessionState>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE learner_id = ?1 AND closed_at IS NULL ORDER BY id DESC LIMIT 1",
            SESSION_COLUMNS
        );
        self.load_session(&sql, &learner_id)
    }

    fn session(&self, session_id: i64) -> Result<Option<SessionState>> {
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
        self.load_session(&sql, &session_id)
    }

    fn start_session(&self, learner_id: &str, now: DateTime<Utc>) -> Result<SessionState> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE sessions SET closed_at = ?2 WHERE learner_id = ?1 AND closed_at IS NULL",
            params![learner_id, ts(now)],
        )?;
        tx.execute(
            "INSERT INTO sessions (learner_id, started_at, updated_at) VALUES (?1, ?2, ?2)",
            params![learner_id, ts(now)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        self.session(id)?
            .ok_or_else(|| EngineError::Storage(rusqlite::Error::QueryReturnedNoRows))
    }

    fn save_session(&self, session: &SessionState) -> Result<()> {
        let completed = serde_json::to_string(&session.completed_micros)?;
        self.conn.execute(
            r#"
            UPDATE sessions
            SET current_chapter = ?2, current_micro_id = ?3, completed_micros = ?4,
                last_review_chapter_position = ?5, last_lab_chapter_position = ?6,
                items_presented = ?7, updated_at = ?8
            WHERE id = ?1
            "#,
            params![
                session.id,
                session.current_chapter,
                session.current_micro_id,
                completed,
                session.last_review_chapter_position,
                session.last_lab_chapter_position,
                session.items_presented,
                ts(session.updated_at),
            ],
        )?;
        Ok(())
    }

    fn close_session(&self, session_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE sessions SET closed_at = ?2 WHERE id = ?1 AND closed_at IS NULL",
            params![session_id, ts(now)],
        )?;
        Ok(rows > 0)
    }

    fn record_response(&self, response: &ResponseRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO session_responses (session_id, item_id, chapter, micro_id, correct, answered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                response.session_id,
                response.item_id,
                response.chapter,
                response.micro_id,
                response.correct,
                ts(response.answered_at),
            ],
        )?;
        Ok(())
    }

    fn responses_since(
        &self,
        learner_id: &str,
        since: DateTime<Utc>,
        exclude_session: Option<i64>,
    ) -> Result<Vec<ResponseRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT r.session_id, r.item_id, r.chapter, r.micro_id, r.correct, r.answered_at
            FROM session_responses r
            JOIN sessions s ON s.id = r.session_id
            WHERE s.learner_id = ?1
              AND r.answered_at >= ?2
              AND (?3 IS NULL OR r.session_id != ?3)
            ORDER BY r.answered_at DESC, r.id DESC
            "#,
        )?;
        let rows = stmt.query_map(
            params![learner_id, ts(since), exclude_session],
            row_to_response,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl LabAttemptStore for Database {
    fn record_lab_attempt(&self, attempt: &LabAttempt) -> Result<i64> {
        let failed_skills = serde_json::to_string(&attempt.failed_skills)?;
        self.conn.execute(
            r#"
            INSERT INTO lab_attempts (
                learner_id, lab_id, passed, struggle_score, failed_skills, attempted_at,
                retry_available_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                attempt.learner_id,
                attempt.lab_id,
                attempt.passed,
                attempt.struggle_score,
                failed_skills,
                ts(attempt.attempted_at),
                attempt.retry_available_at.map(ts),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn lab_attempts(&self, learner_id: &str) -> Result<Vec<LabAttempt>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, learner_id, lab_id, passed, struggle_score, failed_skills, attempted_at,
                   retry_available_at
            FROM lab_attempts
            WHERE learner_id = ?1
            ORDER BY attempted_at DESC, id DESC
            "#,
        )?;
        let rows = stmt.query_map(params![learner_id], row_to_lab_attempt)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl LearnerStore for Database {
    fn learner(&self, learner_id: &str) -> Result<Option<LearnerProfile>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, goal, track FROM learners WHERE id = ?1",
                params![learner_id],
                |row| {
                    Ok(LearnerProfile {
                        id: row.get(0)?,
                        goal: parse_column(row, 1, LearningGoal::from_str)?,
                        track: parse_column(row, 2, Track::from_str)?,
                    })
                },
            )
            .optional()?)
    }

    fn save_learner(&self, profile: &LearnerProfile) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO learners (id, goal, track) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET goal = excluded.goal, track = excluded.track
            "#,
            params![profile.id, profile.goal.as_str(), profile.track.as_str()],
        )?;
        Ok(())
    }

    fn learner_params(&self, learner_id: &str) -> Result<Option<MemoryParams>> {
        let stored: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT params FROM learners WHERE id = ?1",
                params![learner_id],
                |row| row.get(0),
            )
            .optional()?;

        match stored.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn save_learner_params(&self, learner_id: &str, params: &MemoryParams) -> Result<()> {
        let json = serde_json::to_string(params)?;
        self.conn.execute(
            r#"
            INSERT INTO learners (id, params) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET params = excluded.params
            "#,
            params![learner_id, json],
        )?;
        Ok(())
    }
}
