//! Attribute converters.
//!
//! A converter is a public static single-argument method that turns a value
//! the event cannot store into one it can (a primitive or a string). Probe
//! documents reference converters as `com.x.Conv`, meaning the method
//! `convert` whose parameter fits the attribute, or as
//! `com.x.Conv.method(Lcom/x/Value;)I` for one specific method.
//!
//! The host registers the converter classes it has available; lookups happen
//! once per attribute at transform time.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use probe_agent_types::{is_valid_class_name, to_internal_name, JavaType, MethodType};
use probe_classfile::{access, ClassFile};
use probe_resolver::{is_assignable_to, ClassHierarchy};

use crate::errors::ProbeError;

pub const DEFAULT_CONVERTER_METHOD: &str = "convert";

/// A resolved converter, ready to be called with `invokestatic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConverterMethod {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub parameter: JavaType,
    pub return_type: JavaType,
}

#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    descriptor: String,
    parameter: JavaType,
    return_type: JavaType,
}

#[derive(Debug, Clone, Default)]
pub struct ConverterRegistry {
    classes: HashMap<String, Vec<Candidate>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `class` has a public static method `name` with
    /// `descriptor`. Only single-argument methods can be converters.
    pub fn register(&mut self, class: &str, name: &str, descriptor: &str) -> Result<()> {
        let method_type = MethodType::parse(descriptor)
            .with_context(|| format!("converter {class}.{name}{descriptor}"))?;
        let [parameter] = method_type.params.as_slice() else {
            anyhow::bail!(
                "converter {class}.{name}{descriptor} must take exactly one argument"
            );
        };
        self.classes
            .entry(to_internal_name(class))
            .or_default()
            .push(Candidate {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                parameter: parameter.clone(),
                return_type: method_type.ret.clone(),
            });
        Ok(())
    }

    /// Register every public static single-argument method of a class file.
    /// Returns how many were registered.
    pub fn register_class_file(&mut self, bytes: &[u8]) -> Result<usize> {
        let class = ClassFile::parse(bytes).context("parsing converter class")?;
        let class_name = class.this_class_name()?.to_string();
        let pool = &class.constant_pool;
        let mut registered = 0;
        for method in &class.methods {
            if method.access_flags & access::PUBLIC == 0 || !method.is_static() {
                continue;
            }
            let name = method.name(pool)?;
            let descriptor = method.descriptor(pool)?;
            if name.starts_with('<') {
                continue;
            }
            if self.register(&class_name, name, descriptor).is_ok() {
                registered += 1;
            }
        }
        debug!(class = %class_name, registered, "registered converter class");
        Ok(registered)
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Resolve `reference` for a value of `value_type`. An exact parameter
    /// match wins over an assignable one.
    pub fn resolve(
        &self,
        reference: &str,
        value_type: &JavaType,
        hierarchy: &dyn ClassHierarchy,
    ) -> Result<ConverterMethod, ProbeError> {
        let reference = reference.trim();
        let malformed = |reason: String| ProbeError::MalformedConverter {
            converter: reference.to_string(),
            reason,
        };

        let (class, method, descriptor) = match reference.find('(') {
            Some(paren) => {
                let (head, descriptor) = reference.split_at(paren);
                let Some((class, method)) = head.rsplit_once(['.', '/']) else {
                    return Err(malformed("expected class.method(descriptor)".into()));
                };
                (class, method, Some(descriptor))
            }
            None => (reference, DEFAULT_CONVERTER_METHOD, None),
        };
        if !is_valid_class_name(class) {
            return Err(malformed(format!("'{class}' is not a class name")));
        }
        let class = to_internal_name(class);
        let Some(candidates) = self.classes.get(&class) else {
            return Err(malformed(format!("converter class {class} is not available")));
        };

        let named: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.name == method && descriptor.map_or(true, |d| c.descriptor == d))
            .collect();
        if named.is_empty() {
            return Err(malformed(match descriptor {
                Some(d) => format!("{class} has no method {method}{d}"),
                None => format!("{class} has no method {method}"),
            }));
        }

        let chosen = named
            .iter()
            .find(|c| &c.parameter == value_type)
            .or_else(|| {
                named
                    .iter()
                    .find(|c| accepts(hierarchy, &c.parameter, value_type))
            })
            .ok_or_else(|| malformed(format!("no {method} method of {class} accepts {value_type}")))?;

        if !(chosen.return_type.is_primitive() || chosen.return_type.is_string()) {
            return Err(malformed(format!(
                "{method} returns {}, expected a primitive or java.lang.String",
                chosen.return_type
            )));
        }

        Ok(ConverterMethod {
            owner: class,
            name: chosen.name.clone(),
            descriptor: chosen.descriptor.clone(),
            parameter: chosen.parameter.clone(),
            return_type: chosen.return_type.clone(),
        })
    }
}

/// Whether a converter parameter of type `parameter` accepts `value`.
fn accepts(hierarchy: &dyn ClassHierarchy, parameter: &JavaType, value: &JavaType) -> bool {
    match (parameter, value) {
        (JavaType::Object(to), JavaType::Object(from)) => is_assignable_to(hierarchy, from, to),
        (JavaType::Object(to), JavaType::Array(_)) => to == probe_agent_types::OBJECT_INTERNAL_NAME,
        _ => parameter == value,
    }
}
