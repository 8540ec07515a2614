//! Error types for range planning and import.

use thiserror::Error;

/// A malformed range or range-operation argument.
///
/// These are programmer errors: they are never retried and never silently
/// corrected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("Range is invalid: from {from} > to {to}")]
    Invalid { from: String, to: String },

    #[error("Maximum range length must be positive")]
    ZeroLength,
}

/// Errors raised by the batch planner before any planning happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Duplicate import states for entity keys: {}", .keys.join(", "))]
    DuplicateEntityKey { keys: Vec<String> },

    #[error("Entity key must not be empty")]
    EmptyEntityKey,

    #[error("Invalid planner option '{name}': {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error(transparent)]
    Range(#[from] RangeError),
}

impl PlanError {
    pub(crate) fn option(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            name,
            reason: reason.into(),
        }
    }
}

/// Errors that stop an import run.
///
/// A failing query is not one of them: its range is recorded for retry and
/// the run continues.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown entity key '{0}' in query plan")]
    UnknownEntity(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Range(#[from] RangeError),
}

impl ImportError {
    /// Returns `true` if this error comes from a caller bug rather than the
    /// environment.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, Self::Plan(_) | Self::Range(_) | Self::UnknownEntity(_))
    }
}
