//! Error types for constraint parsing.

use thiserror::Error;

/// Errors raised while turning a wire query object into a [`Constraint`](crate::Constraint).
///
/// These are contract violations with the backend: callers propagate them
/// instead of recovering locally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    /// The object has no `type` discriminator.
    #[error("constraint object has no type: {0}")]
    MissingType(String),

    /// A field required by the constraint type is absent.
    #[error("missing field '{field}' in '{type_name}' constraint")]
    MissingField {
        /// The constraint type being parsed.
        type_name: String,
        /// The absent field.
        field: String,
    },

    /// A field is present but has the wrong shape.
    #[error("invalid field '{field}': {message}")]
    InvalidField {
        /// The offending field.
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// The `type` discriminator is not one the parser understands.
    #[error("unknown constraint type: {0}")]
    UnknownType(String),

    /// A subselection over a dimension other than `patient`.
    #[error("unsupported subselection dimension: {0}")]
    UnsupportedDimension(String),
}

impl ConstraintError {
    /// Creates a missing-field error.
    pub fn missing(type_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            type_name: type_name.into(),
            field: field.into(),
        }
    }

    /// Creates an invalid-field error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result type for constraint operations.
pub type ConstraintResult<T> = std::result::Result<T, ConstraintError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_missing_field() {
        let err = ConstraintError::missing("study_name", "studyId");
        assert_eq!(
            err.to_string(),
            "missing field 'studyId' in 'study_name' constraint"
        );
    }

    #[test]
    fn test_error_display_unsupported_dimension() {
        let err = ConstraintError::UnsupportedDimension("study".to_string());
        assert_eq!(err.to_string(), "unsupported subselection dimension: study");
    }
}
