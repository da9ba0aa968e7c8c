//! Error types for the Kindstore engine.

use thiserror::Error;

/// All possible errors from the Kindstore engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    // Input errors
    #[error("decode error: {0}")]
    Decode(String),

    #[error("field required: {0}")]
    FieldRequired(String),

    #[error("invalid value for field '{field}': expected {expected}, got {got}")]
    FieldTypeInvalid {
        field: String,
        expected: String,
        got: String,
    },

    #[error("field not settable: {0}")]
    FieldNotSettable(String),

    // Patch errors
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("test failed at path: {0}")]
    TestFailed(String),

    // Key and persistence errors
    #[error("entity already exists: {0}")]
    AlreadyExists(String),

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("incomplete key: {0}")]
    IncompleteKey(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("kind mismatch: expected {expected}, got {got}")]
    KindMismatch { expected: String, got: String },

    // Query errors
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("conflicting query parameters: {}", .0.join("; "))]
    ConflictingParameters(Vec<String>),

    // Backend errors
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Whether the failed operation may succeed when run again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub(crate) fn type_invalid(
        field: impl Into<String>,
        expected: impl ToString,
        got: impl Into<String>,
    ) -> Self {
        Error::FieldTypeInvalid {
            field: field.into(),
            expected: expected.to_string(),
            got: got.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::NotFound("/Article,'a'".into());
        assert_eq!(err.to_string(), "entity not found: /Article,'a'");

        let err = Error::FieldTypeInvalid {
            field: "age".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for field 'age': expected Int, got String"
        );

        let err = Error::ConflictingParameters(vec![
            "id cannot be combined with order".into(),
            "id cannot be combined with limit".into(),
        ]);
        assert_eq!(
            err.to_string(),
            "conflicting query parameters: id cannot be combined with order; id cannot be combined with limit"
        );
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(Error::Conflict("row".into()).is_retryable());
        assert!(!Error::AlreadyExists("row".into()).is_retryable());
        assert!(!Error::DeadlineExceeded.is_retryable());
    }
}
