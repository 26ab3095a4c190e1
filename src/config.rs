use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::memory::MemoryParams;

/// Top-level engine configuration. Every section falls back to its defaults,
/// so a config file only needs the keys it overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub memory: MemoryParams,
    pub selector: SelectorConfig,
    pub gate: GateConfig,
    pub decay: DecayConfig,
    pub struggle: StruggleConfig,
}

/// Thresholds and cooldowns for the recommendation cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub resume_window_minutes: i64,
    /// Decayed score below which a completed skill needs a critical review.
    pub critical_threshold: f64,
    /// Upper edge of the moderate decay band used by batch reviews.
    pub moderate_threshold: f64,
    pub urgent_threshold: f64,
    pub urgent_min_idle_days: i64,
    pub weakness_threshold: f64,
    pub weakness_grace_minutes: i64,
    pub min_chapters_for_lab: usize,
    pub lab_interval_chapters: usize,
    pub lab_min_mastery: f64,
    pub batch_interval_chapters: usize,
    pub min_skills_for_batch: usize,
    pub batch_size: usize,
    pub failed_recent_window_hours: i64,
    pub failed_recent_grace_minutes: i64,
    pub stealth_probability: f64,
    pub stealth_min_idle_days: i64,
    pub stealth_score_ceiling: f64,
    pub max_proficiency: f64,
    pub lab_ready_min_items: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            resume_window_minutes: 5,
            critical_threshold: 60.0,
            moderate_threshold: 75.0,
            urgent_threshold: 50.0,
            urgent_min_idle_days: 7,
            weakness_threshold: 60.0,
            weakness_grace_minutes: 5,
            min_chapters_for_lab: 5,
            lab_interval_chapters: 5,
            lab_min_mastery: 60.0,
            batch_interval_chapters: 3,
            min_skills_for_batch: 3,
            batch_size: 3,
            failed_recent_window_hours: 24,
            failed_recent_grace_minutes: 2,
            stealth_probability: 0.20,
            stealth_min_idle_days: 1,
            stealth_score_ceiling: 80.0,
            max_proficiency: 100.0,
            lab_ready_min_items: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub mastery_threshold: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            mastery_threshold: 100.0,
        }
    }
}

/// Parameters of the default proficiency decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    pub strength_days: f64,
    pub muscle_memory_floor: f64,
    pub grace_minutes: i64,
    pub success_gain: f64,
    pub failure_penalty: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            strength_days: 7.0,
            muscle_memory_floor: 40.0,
            grace_minutes: 60,
            success_gain: 25.0,
            failure_penalty: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StruggleConfig {
    pub struggling_threshold: f64,
    pub critical_threshold: f64,
    pub base_cooldown_minutes: i64,
    pub struggling_cooldown_minutes: i64,
    pub critical_cooldown_minutes: i64,
}

impl Default for StruggleConfig {
    fn default() -> Self {
        Self {
            struggling_threshold: 0.6,
            critical_threshold: 0.8,
            base_cooldown_minutes: 30,
            struggling_cooldown_minutes: 120,
            critical_cooldown_minutes: 24 * 60,
        }
    }
}

impl EngineConfig {
    /// Load from `path`, or return defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.memory;
        if !(m.target_retention > 0.0 && m.target_retention < 1.0) {
            return Err(invalid(format!(
                "memory.target_retention must be in (0, 1), got {}",
                m.target_retention
            )));
        }
        if m.minimum_interval <= 0.0 || m.minimum_interval > m.maximum_interval {
            return Err(invalid(format!(
                "memory interval range [{}, {}] is empty",
                m.minimum_interval, m.maximum_interval
            )));
        }
        if m.minimum_stability <= 0.0 || m.initial_stability.iter().any(|s| *s <= 0.0) {
            return Err(invalid("stabilities must be positive".to_string()));
        }

        let s = &self.selector;
        if s.critical_threshold >= s.moderate_threshold {
            return Err(invalid(format!(
                "selector.critical_threshold ({}) must be below moderate_threshold ({})",
                s.critical_threshold, s.moderate_threshold
            )));
        }
        if !(0.0..=1.0).contains(&s.stealth_probability) {
            return Err(invalid(format!(
                "selector.stealth_probability must be in [0, 1], got {}",
                s.stealth_probability
            )));
        }
        if s.batch_size == 0 || s.min_skills_for_batch == 0 {
            return Err(invalid("batch sizes must be at least 1".to_string()));
        }

        if !(0.0..=100.0).contains(&self.gate.mastery_threshold) {
            return Err(invalid(format!(
                "gate.mastery_threshold must be in [0, 100], got {}",
                self.gate.mastery_threshold
            )));
        }
        if self.decay.strength_days <= 0.0 {
            return Err(invalid("decay.strength_days must be positive".to_string()));
        }

        let st = &self.struggle;
        if st.struggling_threshold > st.critical_threshold {
            return Err(invalid(
                "struggle.struggling_threshold must not exceed critical_threshold".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> EngineError {
    EngineError::Config(msg)
}

fn app_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cadence")
}

pub fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CADENCE_CONFIG") {
        return PathBuf::from(path);
    }
    app_dir().join("cadence.toml")
}

pub fn get_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("CADENCE_DB") {
        return PathBuf::from(path);
    }
    app_dir().join("cadence.db")
}

pub fn get_library_path() -> Option<PathBuf> {
    std::env::var("CADENCE_LIBRARY").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.selector.critical_threshold, 60.0);
        assert_eq!(config.gate.mastery_threshold, 100.0);
        assert_eq!(config.memory.maximum_interval, 365.0);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cadence.toml");
        std::fs::write(
            &path,
            "[selector]\nstealth_probability = 0.0\n\n[memory]\ntarget_retention = 0.85\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.selector.stealth_probability, 0.0);
        assert_eq!(config.selector.critical_threshold, 60.0);
        assert_eq!(config.memory.target_retention, 0.85);
        assert_eq!(config.memory.initial_stability, [0.4, 0.6, 2.4, 5.8]);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cadence.toml");
        let mut config = EngineConfig::default();
        config.gate.mastery_threshold = 90.0;
        config.save(&path).unwrap();

        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = EngineConfig::default();
        config.selector.critical_threshold = 80.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("critical_threshold"));
    }

    #[test]
    fn rejects_bad_probability_and_retention() {
        let mut config = EngineConfig::default();
        config.selector.stealth_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.memory.target_retention = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_file_is_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cadence.toml");
        std::fs::write(&path, "[memory]\nminimum_interval = 400.0\n").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::Config(_))
        ));

        std::fs::write(&path, "[memory\n").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::ConfigParse(_))
        ));
    }
}
