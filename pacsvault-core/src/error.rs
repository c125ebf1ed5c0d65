use thiserror::Error;

#[derive(Error, Debug)]
pub enum PacsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Model error: {0}")]
    Model(#[from] pacsvault_model::ModelError),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store was reachable but refused or failed the operation.
    #[error("Store error: {0}")]
    Store(String),

    /// An image object could not be parsed.
    #[error("Invalid image object {path}: {reason}")]
    Format { path: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The study's data lives on archive media; `restore_requested` tells the
    /// caller whether to postpone or fail.
    #[error("Study {study_uid} is nearline (restore requested: {restore_requested})")]
    StudyNearline {
        study_uid: String,
        restore_requested: bool,
    },

    #[error("Study is locked: {0}")]
    LockContention(String),

    /// Persistent state that needs an operator to repair.
    #[error("Inconsistent study state: {0}")]
    Inconsistent(String),

    #[error("Command batch '{description}' failed: {reason}")]
    BatchFailed { description: String, reason: String },

    #[error("Worker pool is saturated ({active}/{limit})")]
    PoolSaturated { active: usize, limit: usize },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PacsError {
    /// Short type tag used when recording a failure description.
    pub fn kind(&self) -> &'static str {
        match self {
            PacsError::Io(_) => "Io",
            PacsError::Serialization(_) => "Serialization",
            PacsError::Model(_) => "Model",
            #[cfg(feature = "postgres")]
            PacsError::Database(_) => "Database",
            PacsError::Store(_) => "Store",
            PacsError::Format { .. } => "Format",
            PacsError::NotFound(_) => "NotFound",
            PacsError::StudyNearline { .. } => "StudyNearline",
            PacsError::LockContention(_) => "LockContention",
            PacsError::Inconsistent(_) => "Inconsistent",
            PacsError::BatchFailed { .. } => "BatchFailed",
            PacsError::PoolSaturated { .. } => "PoolSaturated",
            PacsError::Cancelled(_) => "Cancelled",
            PacsError::Internal(_) => "Internal",
        }
    }

    pub fn is_nearline(&self) -> bool {
        matches!(self, PacsError::StudyNearline { .. })
    }

    pub fn format(path: &std::path::Path, reason: impl Into<String>) -> Self {
        PacsError::Format {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PacsError>;
