//! Probe descriptors and attribute bindings.
//!
//! A [`ProbeDescriptor`] is the parsed, validated form of one `event` block of a
//! probe document: which method to instrument, which values to capture and how
//! the generated event should be described.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::descriptor::{identifier_part, package_of, DescriptorError, MethodType};

/// Event class name prefix used when the document does not configure one.
pub const DEFAULT_CLASS_PREFIX: &str = "__JFREvent";

/// Prefix of every generated record field name.
const RECORD_FIELD_PREFIX: &str = "field";

/// The method a probe is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodTarget {
    pub name: String,
    pub descriptor: String,
}

impl MethodTarget {
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }

    pub fn method_type(&self) -> Result<MethodType, DescriptorError> {
        MethodType::parse(&self.descriptor)
    }
}

impl fmt::Display for MethodTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor)
    }
}

// =============================================================================
// Attribute Bindings
// =============================================================================

/// Shape shared by every captured value: parameters, fields and return values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeBinding {
    /// Human readable attribute name, also the source of the record field name
    pub name: String,
    pub description: Option<String>,
    /// Content type annotation, as a qualified annotation class name
    pub content_type: Option<String>,
    pub relation_key: Option<String>,
    /// Converter reference: `com.x.Conv` or `com.x.Conv.method(desc)`
    pub converter: Option<String>,
}

impl AttributeBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            content_type: None,
            relation_key: None,
            converter: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_relation_key(mut self, relation_key: impl Into<String>) -> Self {
        self.relation_key = Some(relation_key.into());
        self
    }

    pub fn with_converter(mut self, converter: impl Into<String>) -> Self {
        self.converter = Some(converter.into());
        self
    }

    /// Name of the field holding this attribute in the generated record.
    pub fn record_field_name(&self) -> String {
        format!("{}{}", RECORD_FIELD_PREFIX, identifier_part(&self.name))
    }
}

/// Capture of a method argument, by argument index (not slot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterBinding {
    pub index: usize,
    #[serde(flatten)]
    pub attribute: AttributeBinding,
}

/// Capture of a value reachable through a dotted field expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBinding {
    pub expression: String,
    #[serde(flatten)]
    pub attribute: AttributeBinding,
}

/// Capture of the method's return value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnBinding {
    #[serde(flatten)]
    pub attribute: AttributeBinding,
}

// =============================================================================
// Probe Descriptor
// =============================================================================

/// Per-probe emission policy and event metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Stringify attributes whose type cannot be recorded directly
    pub allow_to_string: bool,
    /// Honour `converter` references on attributes
    pub allow_converter: bool,
    /// Wrap the body in one catch-all handler instead of instrumenting each throw
    pub use_rethrow: bool,
    /// Commit the event when the method completes abruptly. Without
    /// `use_rethrow` the exception is then swallowed and the method returns
    /// the zero value of its return type.
    pub emit_on_exception: bool,
    pub record_stack_trace: bool,
    pub event_label: String,
    pub event_path: Option<String>,
    pub event_description: Option<String>,
    pub class_prefix: String,
}

impl ProbeConfig {
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            allow_to_string: false,
            allow_converter: false,
            use_rethrow: false,
            emit_on_exception: false,
            record_stack_trace: true,
            event_label: label.into(),
            event_path: None,
            event_description: None,
            class_prefix: DEFAULT_CLASS_PREFIX.to_string(),
        }
    }
}

/// A validated probe bound to one method of one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeDescriptor {
    pub id: String,
    /// Target class in internal form (`com/x/Foo`)
    pub class_name: String,
    pub method: MethodTarget,
    pub parameters: Vec<ParameterBinding>,
    pub fields: Vec<FieldBinding>,
    pub return_value: Option<ReturnBinding>,
    pub config: ProbeConfig,
}

impl ProbeDescriptor {
    pub fn new(
        id: impl Into<String>,
        class_name: impl Into<String>,
        method: MethodTarget,
    ) -> Self {
        let id = id.into();
        Self {
            config: ProbeConfig::labelled(id.clone()),
            id,
            class_name: class_name.into(),
            method,
            parameters: Vec::new(),
            fields: Vec::new(),
            return_value: None,
        }
    }

    /// Internal name of the record class generated for this probe. It lives in
    /// the target class's package so package-private access keeps working.
    pub fn event_class_name(&self) -> String {
        let package = package_of(&self.class_name);
        let simple = format!("{}{}", self.config.class_prefix, identifier_part(&self.id));
        if package.is_empty() {
            simple
        } else {
            format!("{}/{}", package, simple)
        }
    }
}

impl fmt::Display for ProbeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "probe '{}' on {}.{} ({} parameter(s), {} field(s){})",
            self.id,
            self.class_name,
            self.method,
            self.parameters.len(),
            self.fields.len(),
            if self.return_value.is_some() {
                ", return value"
            } else {
                ""
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_class_name_uses_target_package() {
        let probe = ProbeDescriptor::new("p1", "com/x/Foo", MethodTarget::new("bar", "(I)V"));
        assert_eq!(probe.event_class_name(), "com/x/__JFREventP1");

        let mut unpackaged = ProbeDescriptor::new("demo.event", "Foo", MethodTarget::new("bar", "()V"));
        unpackaged.config.class_prefix = "Ev".to_string();
        assert_eq!(unpackaged.event_class_name(), "EvDemoevent");
    }

    #[test]
    fn test_record_field_name() {
        assert_eq!(AttributeBinding::new("arg0").record_field_name(), "fieldArg0");
        assert_eq!(
            AttributeBinding::new("param 0").record_field_name(),
            "fieldParam0"
        );
    }

    #[test]
    fn test_flattened_serialization() {
        let param = ParameterBinding {
            index: 2,
            attribute: AttributeBinding::new("count").with_description("items"),
        };
        let json = serde_json::to_value(&param).unwrap();
        assert_eq!(json["index"], 2);
        assert_eq!(json["name"], "count");
        assert_eq!(json["description"], "items");
    }
}
