use std::fmt;

use serde::Serialize;

use super::domain::StaffId;
use super::repository::RepositoryError;

/// A single failing input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Accumulates every failing field so callers see all problems at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.push(field, message);
        errors
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|error| error.field == field)
    }

    /// `Ok(())` when nothing failed, otherwise the collected errors.
    pub fn into_result(self) -> Result<(), BookingError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(BookingError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|error| format!("{}: {}", error.field, error.message))
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

/// Alternative staff member offered when a capacity check rejects a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaffSuggestion {
    pub staff_id: StaffId,
    pub name: String,
    pub current_load: usize,
    pub limit: u32,
}

/// Coarse error class, used for status-code mapping at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Capacity,
    Conflict,
    IllegalTransition,
    Forbidden,
    Internal,
}

/// Error raised by every engine operation.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{message}")]
    Capacity {
        message: String,
        suggestion: Option<StaffSuggestion>,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{entity} cannot move from {from} to {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::Validation(_) => ErrorKind::Validation,
            BookingError::NotFound { .. } => ErrorKind::NotFound,
            BookingError::Capacity { .. } => ErrorKind::Capacity,
            BookingError::Conflict(_) => ErrorKind::Conflict,
            BookingError::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            BookingError::Forbidden { .. } => ErrorKind::Forbidden,
            BookingError::Repository(RepositoryError::NotFound) => ErrorKind::NotFound,
            BookingError::Repository(RepositoryError::Conflict) => ErrorKind::Conflict,
            BookingError::Repository(RepositoryError::Unavailable(_)) => ErrorKind::Internal,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn illegal(
        entity: &'static str,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::IllegalTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(ValidationErrors::single(field, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_list_every_field() {
        let mut errors = ValidationErrors::new();
        errors.push("sample_types", "must not be empty");
        errors.push("person_info", "count must match sample_types");

        let err = errors.into_result().expect_err("errors collected");
        let message = err.to_string();
        assert!(message.contains("sample_types"));
        assert!(message.contains("person_info"));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn illegal_transition_names_both_statuses() {
        let err = BookingError::illegal("appointment", "completed", "confirmed");
        assert_eq!(
            err.to_string(),
            "appointment cannot move from completed to confirmed"
        );
    }
}
