use std::fmt;

use thiserror::Error;

/// A single field-level validation failure, addressed by its path in the
/// object (`spec.clusterIPs[1]`, `spec.ports[0].nodePort`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        FieldError { path: path.into(), message: message.into() }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Service {name:?} is invalid: {}", join_errors(.errors))]
    Invalid { name: String, errors: Vec<FieldError> },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("try again later: {0}")]
    ServerTimeout(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl Error {
    pub fn invalid(name: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Error::Invalid { name: name.into(), errors }
    }

    pub fn invalid_field(
        name: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Invalid { name: name.into(), errors: vec![FieldError::new(path, message)] }
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Error::Invalid { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// The field path of the first validation failure, if this is an
    /// `Invalid` error.
    pub fn first_invalid_path(&self) -> Option<&str> {
        match self {
            Error::Invalid { errors, .. } => errors.first().map(|e| e.path.as_str()),
            _ => None,
        }
    }
}

fn join_errors(errors: &[FieldError]) -> String {
    errors.iter().map(FieldError::to_string).collect::<Vec<_>>().join(", ")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
