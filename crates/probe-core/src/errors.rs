//! Error taxonomy for probe processing.
//!
//! Only [`ProbeError::SpecParse`] on a whole document and
//! [`ProbeError::BytecodeVerification`] / [`ProbeError::ClassFormat`] on a
//! whole class ever reach the host. Everything else is attribute level: the
//! attribute is dropped, a warning is logged and instrumentation continues.

use probe_resolver::ResolveError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Malformed probe document or probe definition.
    #[error("invalid probe definition{}: {message}", probe_suffix(.probe))]
    SpecParse {
        /// Probe id, when the failure is local to one probe
        probe: Option<String>,
        message: String,
    },

    /// Two probes on one class would generate the same event class.
    #[error("probe '{probe}' on {class} duplicates event class {event_class}")]
    DuplicateEventName {
        probe: String,
        class: String,
        event_class: String,
    },

    /// A field expression names something that does not exist.
    #[error("cannot resolve '{expression}': {reason}")]
    ReferenceResolution { expression: String, reason: String },

    /// A field exists but the instrumented class may not read it.
    #[error("{access} field '{field}' declared in {declaring} is not accessible from {caller}")]
    AccessibilityViolation {
        field: String,
        access: &'static str,
        declaring: String,
        caller: String,
    },

    /// The attribute's type cannot be recorded and stringification is off.
    #[error("attribute '{attribute}' of type {type_name} cannot be recorded")]
    UnsupportedAttributeType { attribute: String, type_name: String },

    /// A converter reference does not resolve to a usable static method.
    #[error("converter '{converter}' is unusable: {reason}")]
    MalformedConverter { converter: String, reason: String },

    /// The rewritten method would not pass verification.
    #[error("rewritten {class}.{method} fails verification: {reason}")]
    BytecodeVerification {
        class: String,
        method: String,
        reason: String,
    },

    /// The class bytes could not be read or written.
    #[error("class {class} could not be processed: {reason}")]
    ClassFormat { class: String, reason: String },
}

fn probe_suffix(probe: &Option<String>) -> String {
    probe
        .as_ref()
        .map(|id| format!(" '{id}'"))
        .unwrap_or_default()
}

impl ProbeError {
    pub fn spec(message: impl Into<String>) -> Self {
        ProbeError::SpecParse {
            probe: None,
            message: message.into(),
        }
    }

    pub fn spec_for(probe: &str, message: impl Into<String>) -> Self {
        ProbeError::SpecParse {
            probe: Some(probe.to_string()),
            message: message.into(),
        }
    }

    /// Whether the failure only costs one attribute.
    pub fn is_attribute_level(&self) -> bool {
        matches!(
            self,
            ProbeError::ReferenceResolution { .. }
                | ProbeError::AccessibilityViolation { .. }
                | ProbeError::UnsupportedAttributeType { .. }
                | ProbeError::MalformedConverter { .. }
        )
    }
}

impl From<ResolveError> for ProbeError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::ReferenceResolution { expression, reason } => {
                ProbeError::ReferenceResolution { expression, reason }
            }
            ResolveError::AccessibilityViolation {
                field,
                access,
                declaring,
                caller,
            } => ProbeError::AccessibilityViolation {
                field,
                access,
                declaring,
                caller,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            ProbeError::spec("missing class").to_string(),
            "invalid probe definition: missing class"
        );
        assert_eq!(
            ProbeError::spec_for("p1", "missing class").to_string(),
            "invalid probe definition 'p1': missing class"
        );
    }

    #[test]
    fn test_resolve_errors_map_to_attribute_level() {
        let err: ProbeError = ResolveError::ReferenceResolution {
            expression: "a.b".into(),
            reason: "no such field".into(),
        }
        .into();
        assert!(err.is_attribute_level());
        assert!(!ProbeError::spec("x").is_attribute_level());
    }
}
