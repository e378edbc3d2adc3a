//! Code generation settings shared by every transform.

use probe_agent_types::env_utils::{env_string, env_var_or};
use serde::{Deserialize, Serialize};

/// Annotation type descriptors placed on generated event classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAnnotations {
    pub name: String,
    pub label: String,
    pub description: String,
    pub category: String,
    pub stack_trace: String,
    pub relational: String,
}

impl Default for EventAnnotations {
    fn default() -> Self {
        Self {
            name: "Ljdk/jfr/Name;".to_string(),
            label: "Ljdk/jfr/Label;".to_string(),
            description: "Ljdk/jfr/Description;".to_string(),
            category: "Ljdk/jfr/Category;".to_string(),
            stack_trace: "Ljdk/jfr/StackTrace;".to_string(),
            relational: "Ljdk/jfr/Relational;".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Superclass of generated event classes; provides `begin`, `end`, `commit`
    pub event_base_class: String,
    /// Static method turning any reference into a string:
    /// `owner`, `name`, with descriptor `(Ljava/lang/Object;)Ljava/lang/String;`
    pub stringify_owner: String,
    pub stringify_method: String,
    /// Class file major version of generated event classes
    pub record_class_version: u16,
    pub annotations: EventAnnotations,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            event_base_class: "jdk/jfr/Event".to_string(),
            stringify_owner: "java/lang/String".to_string(),
            stringify_method: "valueOf".to_string(),
            record_class_version: 55,
            annotations: EventAnnotations::default(),
        }
    }
}

impl TransformConfig {
    pub const STRINGIFY_DESCRIPTOR: &'static str = "(Ljava/lang/Object;)Ljava/lang/String;";

    /// Defaults, overridden by `PROBE_AGENT_EVENT_BASE_CLASS`,
    /// `PROBE_AGENT_STRINGIFY` (`owner.method`, dotted or internal form) and
    /// `PROBE_AGENT_RECORD_CLASS_VERSION`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base) = env_string("PROBE_AGENT_EVENT_BASE_CLASS") {
            config.event_base_class = probe_agent_types::to_internal_name(&base);
        }
        if let Some(stringify) = env_string("PROBE_AGENT_STRINGIFY") {
            if let Some((owner, method)) = stringify.trim().rsplit_once(['.', '/']) {
                if !owner.is_empty() && !method.is_empty() {
                    config.stringify_owner = probe_agent_types::to_internal_name(owner);
                    config.stringify_method = method.to_string();
                }
            }
        }
        config.record_class_version =
            env_var_or("PROBE_AGENT_RECORD_CLASS_VERSION", config.record_class_version);
        config
    }

    pub fn with_event_base_class(mut self, base: impl Into<String>) -> Self {
        self.event_base_class = base.into();
        self
    }
}
