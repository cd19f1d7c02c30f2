use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstigateError {
    #[error("instigator not found: {0}")]
    NotFound(String),

    #[error("tick not found: {0}")]
    TickNotFound(String),

    #[error("invalid name '{0}': use letters, digits, '_' or '-' (max 128 chars)")]
    InvalidName(String),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid schedule '{cron}': {reason}")]
    InvalidSchedule { cron: String, reason: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("tick {0} is not STARTED")]
    TickNotStarted(String),

    #[error("a tick is in progress for {0}")]
    TickInProgress(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for InstigateError {
    fn from(e: rusqlite::Error) -> Self {
        InstigateError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InstigateError>;
