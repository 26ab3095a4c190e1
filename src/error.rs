use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid grade '{0}': expected again, hard, good or easy")]
    InvalidGrade(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Another writer committed between our read and write. Safe to retry.
    #[error("concurrent update on {learner}/{item}: expected version {expected}")]
    Conflict {
        learner: String,
        item: String,
        expected: u32,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to write configuration: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. }
                | EngineError::Storage(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error {
                        code: rusqlite::ErrorCode::DatabaseBusy
                            | rusqlite::ErrorCode::DatabaseLocked,
                        ..
                    },
                    _,
                ))
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
