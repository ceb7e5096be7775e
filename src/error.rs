//! Error types shared by every fleet component.
//!
//! [`FleetError`] is what library operations return. Each variant maps to a
//! machine-distinguishable [`ErrorKind`] so transports and job results can
//! report failures without parsing messages.

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, FleetError>;

/// Machine-readable error classification carried by job results and
/// operation responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    ValidationError,
    BackendFailure,
    PartialFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::BackendFailure => "backend_failure",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_found" => Some(ErrorKind::NotFound),
            "conflict" => Some(ErrorKind::Conflict),
            "validation_error" => Some(ErrorKind::ValidationError),
            "backend_failure" => Some(ErrorKind::BackendFailure),
            "partial_failure" => Some(ErrorKind::PartialFailure),
            "internal" => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate job target, a held write-mode lease, an existing alias,
    /// or a composite that would be left with fewer than two members.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        existing_job_id: Option<String>,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    /// Git, network, or index engine failure.
    #[error("backend failure: {message}")]
    Backend {
        message: String,
        code: Option<String>,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FleetError {
    pub fn not_found(message: impl Into<String>) -> Self {
        FleetError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        FleetError::Conflict {
            message: message.into(),
            existing_job_id: None,
        }
    }

    pub fn job_conflict(message: impl Into<String>, existing_job_id: impl Into<String>) -> Self {
        FleetError::Conflict {
            message: message.into(),
            existing_job_id: Some(existing_job_id.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        FleetError::Validation(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        FleetError::Backend {
            message: message.into(),
            code: None,
        }
    }

    pub fn backend_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        FleetError::Backend {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::NotFound(_) => ErrorKind::NotFound,
            FleetError::Conflict { .. } => ErrorKind::Conflict,
            FleetError::Validation(_) => ErrorKind::ValidationError,
            FleetError::Backend { .. } | FleetError::Database(_) | FleetError::Io(_) => {
                ErrorKind::BackendFailure
            }
            FleetError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Structured code, where one can be derived.
    pub fn code(&self) -> Option<String> {
        match self {
            FleetError::Backend { code, .. } => code.clone(),
            FleetError::Database(_) => Some("database".to_string()),
            FleetError::Io(err) => Some(format!("io:{:?}", err.kind()).to_lowercase()),
            _ => None,
        }
    }

    /// The id of the already-active job when this is a scheduler conflict.
    pub fn existing_job_id(&self) -> Option<&str> {
        match self {
            FleetError::Conflict {
                existing_job_id, ..
            } => existing_job_id.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Internal(format!("json: {}", err))
    }
}

impl From<globset::Error> for FleetError {
    fn from(err: globset::Error) -> Self {
        FleetError::Validation(format!("invalid glob pattern: {}", err))
    }
}

impl From<tokio::task::JoinError> for FleetError {
    fn from(err: tokio::task::JoinError) -> Self {
        FleetError::Internal(format!("task failed: {}", err))
    }
}
