use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("credential store error: {0}")]
    Credential(String),
    #[error("calendar authorization required: {0}")]
    AuthRequired(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("calendar provider error: {0}")]
    Provider(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("job scheduler error: {0}")]
    Scheduler(String),
}

impl InfraError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<crate::domain::reminders::ReminderError> for InfraError {
    fn from(error: crate::domain::reminders::ReminderError) -> Self {
        Self::Validation(error.to_string())
    }
}
