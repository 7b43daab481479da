//! Error taxonomy shared by every component.
//!
//! Each component returns its own kind; orchestrators translate at the
//! boundary. Reranker failures never reach callers (the retrieval engine
//! degrades), the cache never surfaces errors, and the generation engine
//! passes provider failures through unchanged.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    /// Malformed input at the boundary. Never recovered; surfaced
    /// immediately with the offending field and an action hint.
    #[error("{message}")]
    Validation {
        field: Option<String>,
        message: String,
        action: Option<String>,
        invalid_programs: Vec<String>,
        valid_programs: Vec<String>,
    },

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Uniqueness or state-machine violation (duplicate program name,
    /// deleting a referenced program without force).
    #[error("{message}")]
    Conflict { message: String },

    /// A backing service is down. Retries at this layer will not help.
    #[error("{dependency} unavailable: {message}")]
    DependencyUnavailable {
        dependency: &'static str,
        message: String,
    },

    /// Timeout, rate limit, or temporary provider error. The caller may
    /// retry; the core does not retry internally.
    #[error("transient failure in {operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },

    /// The caller cancelled the request. Partial work is discarded and
    /// no cache entry is written.
    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RagError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            field: None,
            message: message.into(),
            action: None,
            invalid_programs: Vec::new(),
            valid_programs: Vec::new(),
        }
    }

    pub fn validation_field(
        field: impl Into<String>,
        message: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: Some(field.into()),
            message: message.into(),
            action: Some(action.into()),
            invalid_programs: Vec::new(),
            valid_programs: Vec::new(),
        }
    }

    /// Structured program-validation failure listing both the rejected
    /// names and the currently valid set.
    pub fn invalid_programs(invalid: Vec<String>, valid: Vec<String>) -> Self {
        Self::Validation {
            field: Some("programs".to_string()),
            message: format!(
                "Invalid program(s): {}. Valid programs: {}",
                invalid.join(", "),
                valid.join(", ")
            ),
            action: Some("Choose programs from the valid set or ask an admin to add them".to_string()),
            invalid_programs: invalid,
            valid_programs: valid,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn dependency(dependency: &'static str, message: impl Into<String>) -> Self {
        Self::DependencyUnavailable {
            dependency,
            message: message.into(),
        }
    }

    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            operation,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(anyhow::anyhow!(message.into()))
    }

    pub fn cancelled(operation: &'static str) -> Self {
        Self::Cancelled { operation }
    }

    /// Stable kind tag used by telemetry counters and the HTTP edge.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::DependencyUnavailable { .. } => "dependency_unavailable",
            Self::Transient { .. } => "transient",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound {
                resource: "row",
                id: String::new(),
            },
            sqlx::Error::PoolTimedOut => Self::transient("metadata_store", "connection pool timed out"),
            sqlx::Error::Io(io) => Self::dependency("metadata_store", io.to_string()),
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(RagError::validation("x").kind(), "validation_error");
        assert_eq!(
            RagError::NotFound {
                resource: "document",
                id: "abc".into()
            }
            .kind(),
            "not_found"
        );
        assert_eq!(RagError::conflict("dup").kind(), "conflict");
        assert_eq!(RagError::dependency("qdrant", "down").kind(), "dependency_unavailable");
        assert_eq!(RagError::transient("embed", "timeout").kind(), "transient");
    }

    #[test]
    fn invalid_programs_carries_both_sets() {
        let err = RagError::invalid_programs(
            vec!["Nonexistent".into()],
            vec!["Education".into(), "Health".into()],
        );
        match err {
            RagError::Validation {
                invalid_programs,
                valid_programs,
                field,
                ..
            } => {
                assert_eq!(invalid_programs, vec!["Nonexistent".to_string()]);
                assert_eq!(valid_programs.len(), 2);
                assert_eq!(field.as_deref(), Some("programs"));
            }
            other => panic!("expected validation error, got {}", other.kind()),
        }
    }
}
