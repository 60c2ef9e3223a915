//! Activity error type.

use serde::{Deserialize, Serialize};

/// Error raised by an activity function.
///
/// `kind_tag` is the stable string the retry layer matches against
/// `RetryPolicy::non_retryable_error_types` (SPEC_FULL §4.1) — Rust has no
/// runtime type-name reflection equivalent to `type(e).__name__`, so
/// activity authors opt into a classifier tag explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub message: String,
    pub kind_tag: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind_tag: None,
            details: None,
        }
    }

    pub fn with_kind(mut self, kind_tag: impl Into<String>) -> Self {
        self.kind_tag = Some(kind_tag.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The classifier string the retry policy compares against
    /// `non_retryable_error_types`. Falls back to `"error"` when the
    /// activity didn't tag its failure.
    pub fn kind_tag(&self) -> &str {
        self.kind_tag.as_deref().unwrap_or("error")
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Raised internally when a task's activity name has no registry entry.
/// Per SPEC_FULL §4.6/§7, this is never retried regardless of policy.
#[derive(Debug, Clone)]
pub struct UnknownActivityError(pub String);

impl std::fmt::Display for UnknownActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown activity: {}", self.0)
    }
}

impl std::error::Error for UnknownActivityError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_kind_tag_is_error() {
        let err = ActivityError::new("boom");
        assert_eq!(err.kind_tag(), "error");
    }

    #[test]
    fn explicit_kind_tag_round_trips() {
        let err = ActivityError::new("bad input").with_kind("ValidationError");
        assert_eq!(err.kind_tag(), "ValidationError");
    }

    #[test]
    fn serialization_round_trips() {
        let err = ActivityError::new("boom")
            .with_kind("Transient")
            .with_details(serde_json::json!({"retry_after": 5}));
        let json = serde_json::to_string(&err).unwrap();
        let parsed: ActivityError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, parsed);
    }
}
