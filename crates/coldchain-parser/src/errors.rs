use std::fmt;

use thiserror::Error;

/// A single record that was skipped while parsing a tenant payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// 1-based CSV line or readings-array position.
    pub index: usize,
    pub message: String,
}

impl RejectedRecord {
    pub fn new(index: usize, message: impl Into<String>) -> Self {
        Self {
            index,
            message: message.into(),
        }
    }
}

impl fmt::Display for RejectedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {}: {}", self.index, self.message)
    }
}

/// Errors that reject a whole payload. Row-level problems never surface here;
/// they are collected as [`RejectedRecord`]s instead.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("{parser} header invalid: {message}")]
    InvalidHeader {
        parser: &'static str,
        message: String,
    },

    #[error("{parser} missing required columns: {}", columns.join(", "))]
    MissingColumns {
        parser: &'static str,
        columns: Vec<&'static str>,
    },

    #[error("{parser} body is not valid JSON: {source}")]
    Json {
        parser: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{parser} validation error: {message}")]
    Validation {
        parser: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("missing required field '{0}'")]
    Missing(&'static str),

    #[error("field '{field}' has invalid value '{value}': {reason}")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },
}

impl FieldError {
    pub(crate) fn invalid(
        field: &'static str,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        FieldError::Invalid {
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }
}
