//! Content library: chapters, micro lessons, labs and the learning path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

const BUILTIN_COURSE: &str = include_str!("../courses/docker.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Micro {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: Value,
}

impl Micro {
    /// Base micros are the first teaching unit of a chapter.
    pub fn is_base(&self) -> bool {
        self.id.ends_with("_base")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub title: String,
    pub micros: Vec<Micro>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabStep {
    pub instruction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default = "default_lab_minutes")]
    pub estimated_minutes: u32,
    #[serde(default)]
    pub steps: Vec<LabStep>,
    /// Canonical skill keys that must reach the minimum mastery first.
    #[serde(default)]
    pub requires_mastery: Vec<String>,
}

fn default_lab_minutes() -> u32 {
    15
}

impl LabSummary {
    pub fn first_instruction(&self) -> Option<&str> {
        self.steps.first().map(|s| s.instruction.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathModule {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub items: Vec<String>,
}

/// Chapter order, either flat or grouped into modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LearningPath {
    Flat(Vec<String>),
    Modules(Vec<PathModule>),
}

impl LearningPath {
    pub fn chapters(&self) -> Vec<String> {
        match self {
            LearningPath::Flat(chapters) => chapters.clone(),
            LearningPath::Modules(modules) => {
                modules.iter().flat_map(|m| m.items.iter().cloned()).collect()
            }
        }
    }
}

pub trait ContentLibrary {
    /// All chapters in catalog order.
    fn chapters(&self) -> Vec<String>;

    /// Micros of a chapter in teaching order; empty for unknown chapters.
    fn micros(&self, chapter: &str) -> Vec<Micro>;

    fn labs(&self) -> Vec<LabSummary>;

    fn learning_path(&self) -> LearningPath {
        LearningPath::Flat(self.chapters())
    }

    fn micro(&self, chapter: &str, micro_id: &str) -> Option<Micro> {
        self.micros(chapter).into_iter().find(|m| m.id == micro_id)
    }

    fn first_micro(&self, chapter: &str) -> Option<Micro> {
        self.micros(chapter).into_iter().next()
    }

    fn next_micro(&self, chapter: &str, micro_id: &str) -> Option<Micro> {
        let micros = self.micros(chapter);
        let index = micros.iter().position(|m| m.id == micro_id)?;
        micros.into_iter().nth(index + 1)
    }

    /// A chapter is learned once every one of its micros is completed.
    fn is_learned(&self, chapter: &str, progress: &BTreeMap<String, BTreeSet<String>>) -> bool {
        let micros = self.micros(chapter);
        let done = match progress.get(chapter) {
            Some(done) => done,
            None => return false,
        };
        !micros.is_empty() && micros.iter().all(|m| done.contains(&m.id))
    }

    /// First path chapter that has content and is not learned yet, else the
    /// first path chapter.
    fn next_chapter(&self, progress: &BTreeMap<String, BTreeSet<String>>) -> Option<String> {
        let path = self.learning_path().chapters();
        path.iter()
            .find(|chapter| {
                !self.micros(chapter).is_empty() && !self.is_learned(chapter, progress)
            })
            .or_else(|| path.first())
            .cloned()
    }

    /// Labs whose every prerequisite has a score at or above `min_mastery`.
    fn eligible_labs(&self, scores: &HashMap<String, f64>, min_mastery: f64) -> Vec<LabSummary> {
        self.labs()
            .into_iter()
            .filter(|lab| {
                lab.requires_mastery
                    .iter()
                    .all(|skill| scores.get(skill).map_or(false, |s| *s >= min_mastery))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CourseFile {
    #[serde(default)]
    path: Option<LearningPath>,
    chapters: Vec<Chapter>,
    #[serde(default)]
    labs: Vec<LabSummary>,
}

/// A course held in memory, loaded from JSON.
#[derive(Debug, Clone)]
pub struct StaticLibrary {
    chapters: Vec<Chapter>,
    labs: Vec<LabSummary>,
    path: Option<LearningPath>,
}

impl StaticLibrary {
    pub fn new(chapters: Vec<Chapter>, labs: Vec<LabSummary>, path: Option<LearningPath>) -> Result<Self> {
        let library = Self {
            chapters,
            labs,
            path,
        };
        library.validate()?;
        Ok(library)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: CourseFile = serde_json::from_str(json)?;
        Self::new(file.chapters, file.labs, file.path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// The bundled docker course.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_COURSE)
    }

    pub fn empty() -> Self {
        Self {
            chapters: Vec::new(),
            labs: Vec::new(),
            path: None,
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for chapter in &self.chapters {
            if !seen.insert(chapter.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate chapter '{}'",
                    chapter.id
                )));
            }
        }
        if let Some(path) = &self.path {
            for chapter in path.chapters() {
                if !seen.contains(chapter.as_str()) {
                    return Err(EngineError::Config(format!(
                        "learning path references unknown chapter '{}'",
                        chapter
                    )));
                }
            }
        }
        Ok(())
    }

    fn chapter(&self, id: &str) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.id == id)
    }
}

impl ContentLibrary for StaticLibrary {
    fn chapters(&self) -> Vec<String> {
        self.chapters.iter().map(|c| c.id.clone()).collect()
    }

    fn micros(&self, chapter: &str) -> Vec<Micro> {
        self.chapter(chapter)
            .map(|c| c.micros.clone())
            .unwrap_or_default()
    }

    fn labs(&self) -> Vec<LabSummary> {
        self.labs.clone()
    }

    fn learning_path(&self) -> LearningPath {
        self.path
            .clone()
            .unwrap_or_else(|| LearningPath::Flat(self.chapters()))
    }
}
