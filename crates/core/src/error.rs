//! Spec validation errors.

use thiserror::Error;

use crate::id::JobId;

/// Result type used when building or validating specs.
pub type SpecResult<T> = Result<T, SpecError>;

/// A persisted row (or bundle of rows) is malformed.
///
/// These are deterministic input failures; they never depend on storage state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// A job id was empty.
    #[error("job id must not be empty")]
    EmptyId,

    /// A job or constraint factory key was empty.
    #[error("factory key must not be empty (job {0})")]
    EmptyFactoryKey(JobId),

    /// A constraint or dependency row was attached to the wrong job.
    #[error("row for job {found} attached to job {expected}")]
    MismatchedJobId { expected: JobId, found: JobId },

    /// A job declared a dependency on itself.
    #[error("job {0} depends on itself")]
    SelfDependency(JobId),

    /// `run_attempt` is negative or a time field is out of range.
    #[error("invalid field `{field}` on job {id}: {reason}")]
    InvalidField {
        id: JobId,
        field: &'static str,
        reason: String,
    },
}

impl SpecError {
    pub fn invalid_field(id: &JobId, field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            id: id.clone(),
            field,
            reason: reason.into(),
        }
    }
}
