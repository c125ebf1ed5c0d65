use std::fmt::{self, Display};

/// Errors produced by model constructors and parsing routines.
#[derive(Debug)]
pub enum ModelError {
    UnknownVariant { kind: &'static str, value: String },
    InvalidOptions(serde_json::Error),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownVariant { kind, value } => {
                write!(f, "unknown {kind}: {value}")
            }
            ModelError::InvalidOptions(err) => {
                write!(f, "invalid processing options: {err}")
            }
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::UnknownVariant { .. } => None,
            ModelError::InvalidOptions(err) => Some(err),
        }
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::InvalidOptions(err)
    }
}

impl ModelError {
    pub(crate) fn unknown(kind: &'static str, value: &str) -> Self {
        ModelError::UnknownVariant {
            kind,
            value: value.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
