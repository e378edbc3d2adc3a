use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The expression is malformed or names something that cannot be found.
    #[error("cannot resolve '{expression}': {reason}")]
    ReferenceResolution { expression: String, reason: String },

    /// The field exists but the instrumented class may not read it.
    #[error("{access} field '{field}' declared in {declaring} is not accessible from {caller}")]
    AccessibilityViolation {
        field: String,
        access: &'static str,
        declaring: String,
        caller: String,
    },
}

impl ResolveError {
    pub(crate) fn resolution(expression: &str, reason: impl Into<String>) -> Self {
        ResolveError::ReferenceResolution {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}
