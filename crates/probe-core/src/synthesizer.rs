//! Event record synthesis.
//!
//! Turns a probe's bindings into the field layout of the event class that
//! will carry them. Every binding is checked on its own: one that cannot be
//! represented is dropped with a warning and the rest of the record is kept.
//!
//! Type policy, in order:
//!
//! 1. converter (when allowed and resolvable): written as the converter's
//!    return type
//! 2. primitives, `String`, `Thread` and `Class`: written as-is
//! 3. anything else: written as a `String` when stringification is allowed,
//!    dropped otherwise

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use probe_agent_types::{
    AttributeBinding, JavaType, MethodType, ProbeDescriptor, CLASS_INTERNAL_NAME,
    STRING_INTERNAL_NAME, THREAD_INTERNAL_NAME,
};
use probe_resolver::{ClassHierarchy, ReferenceChainResolver, ResolvedReferenceChain};

use crate::converter::{ConverterMethod, ConverterRegistry};
use crate::errors::ProbeError;

/// Where a record field's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeSource {
    /// Method argument `index`, held in local `slot`
    Parameter { index: usize, slot: u16 },
    /// A normalized reference chain
    Field { chain: ResolvedReferenceChain },
    ReturnValue,
}

/// How the source value becomes the written value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Conversion {
    None,
    Stringify,
    Converter(ConverterMethod),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMetadata {
    pub label: String,
    pub description: Option<String>,
    pub content_type: Option<String>,
    pub relation_key: Option<String>,
}

impl From<&AttributeBinding> for FieldMetadata {
    fn from(attribute: &AttributeBinding) -> Self {
        Self {
            label: attribute.name.clone(),
            description: attribute.description.clone(),
            content_type: attribute.content_type.clone(),
            relation_key: attribute.relation_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordField {
    /// Field name in the generated class
    pub name: String,
    /// Type of the value before conversion
    pub source_type: JavaType,
    /// Type of the generated field
    pub field_type: JavaType,
    #[serde(skip)]
    pub source: AttributeSource,
    pub conversion: Conversion,
    pub metadata: FieldMetadata,
}

/// Layout and metadata of one generated event class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SynthesizedEventRecord {
    /// Internal name of the generated class
    pub class_name: String,
    /// Event name seen by recording consumers, the probe id
    pub name: String,
    pub fields: Vec<RecordField>,
    pub label: String,
    pub description: Option<String>,
    pub path: Option<String>,
    pub record_stack_trace: bool,
}

impl SynthesizedEventRecord {
    pub fn chain_fields(&self) -> impl Iterator<Item = &RecordField> {
        self.fields
            .iter()
            .filter(|f| matches!(f.source, AttributeSource::Field { .. }))
    }

    pub fn return_field(&self) -> Option<&RecordField> {
        self.fields
            .iter()
            .find(|f| f.source == AttributeSource::ReturnValue)
    }

    pub fn descriptor(&self) -> String {
        format!("L{};", self.class_name)
    }
}

/// Whether the tracing runtime can store values of `ty` directly.
pub fn is_recordable(ty: &JavaType) -> bool {
    match ty {
        JavaType::Object(name) => {
            name == STRING_INTERNAL_NAME || name == THREAD_INTERNAL_NAME || name == CLASS_INTERNAL_NAME
        }
        JavaType::Array(_) | JavaType::Void => false,
        _ => true,
    }
}

pub struct EventRecordSynthesizer<'a> {
    hierarchy: &'a dyn ClassHierarchy,
    converters: &'a ConverterRegistry,
}

impl<'a> EventRecordSynthesizer<'a> {
    pub fn new(hierarchy: &'a dyn ClassHierarchy, converters: &'a ConverterRegistry) -> Self {
        Self {
            hierarchy,
            converters,
        }
    }

    /// Resolve and normalize every field expression of `descriptor`, in
    /// binding order.
    pub fn resolve_fields(
        &self,
        descriptor: &ProbeDescriptor,
    ) -> Vec<Result<ResolvedReferenceChain, ProbeError>> {
        let resolver = ReferenceChainResolver::new(self.hierarchy);
        descriptor
            .fields
            .iter()
            .map(|field| {
                resolver
                    .resolve(&descriptor.class_name, &field.expression)
                    .map(|chain| chain.normalize())
                    .map_err(ProbeError::from)
            })
            .collect()
    }

    /// Build the record layout. `chains` holds one entry per field binding,
    /// as returned by [`resolve_fields`](Self::resolve_fields).
    pub fn synthesize(
        &self,
        descriptor: &ProbeDescriptor,
        method_type: &MethodType,
        is_static: bool,
        chains: &[Result<ResolvedReferenceChain, ProbeError>],
    ) -> SynthesizedEventRecord {
        let mut fields = Vec::new();
        let mut names = HashSet::new();

        for parameter in &descriptor.parameters {
            let attribute = &parameter.attribute;
            let (Some(ty), Some(slot)) = (
                method_type.params.get(parameter.index),
                method_type.arg_slot(parameter.index, is_static),
            ) else {
                self.drop_attribute(
                    descriptor,
                    attribute,
                    &format!(
                        "parameter index {} out of range for {}",
                        parameter.index, descriptor.method
                    ),
                );
                continue;
            };
            let source = AttributeSource::Parameter {
                index: parameter.index,
                slot,
            };
            self.push_field(descriptor, attribute, ty, source, &mut fields, &mut names);
        }

        for (binding, chain) in descriptor.fields.iter().zip(chains) {
            let attribute = &binding.attribute;
            let chain = match chain {
                Ok(chain) => chain,
                Err(err) => {
                    self.drop_attribute(descriptor, attribute, &err.to_string());
                    continue;
                }
            };
            if is_static && (chain.is_empty() || chain.requires_receiver()) {
                self.drop_attribute(
                    descriptor,
                    attribute,
                    &format!(
                        "'{}' needs an instance but {} is static",
                        binding.expression, descriptor.method
                    ),
                );
                continue;
            }
            let source = AttributeSource::Field {
                chain: chain.clone(),
            };
            let ty = chain.chain_type();
            self.push_field(descriptor, attribute, &ty, source, &mut fields, &mut names);
        }

        if let Some(return_value) = &descriptor.return_value {
            let attribute = &return_value.attribute;
            if method_type.ret == JavaType::Void {
                self.drop_attribute(
                    descriptor,
                    attribute,
                    &format!("{} returns void", descriptor.method),
                );
            } else {
                let ret = method_type.ret.clone();
                self.push_field(
                    descriptor,
                    attribute,
                    &ret,
                    AttributeSource::ReturnValue,
                    &mut fields,
                    &mut names,
                );
            }
        }

        let config = &descriptor.config;
        SynthesizedEventRecord {
            class_name: descriptor.event_class_name(),
            name: descriptor.id.clone(),
            fields,
            label: config.event_label.clone(),
            description: config.event_description.clone(),
            path: config.event_path.clone(),
            record_stack_trace: config.record_stack_trace,
        }
    }

    fn push_field(
        &self,
        descriptor: &ProbeDescriptor,
        attribute: &AttributeBinding,
        source_type: &JavaType,
        source: AttributeSource,
        fields: &mut Vec<RecordField>,
        names: &mut HashSet<String>,
    ) {
        let name = attribute.record_field_name();
        if names.contains(&name) {
            self.drop_attribute(
                descriptor,
                attribute,
                &format!("record field {name} is already taken"),
            );
            return;
        }
        match self.plan(descriptor, attribute, source_type) {
            Ok((field_type, conversion)) => {
                debug!(
                    probe = %descriptor.id,
                    attribute = %attribute.name,
                    field_type = %field_type,
                    "record field"
                );
                names.insert(name.clone());
                fields.push(RecordField {
                    name,
                    source_type: source_type.clone(),
                    field_type,
                    source,
                    conversion,
                    metadata: FieldMetadata::from(attribute),
                });
            }
            Err(err) => self.drop_attribute(descriptor, attribute, &err.to_string()),
        }
    }

    fn plan(
        &self,
        descriptor: &ProbeDescriptor,
        attribute: &AttributeBinding,
        ty: &JavaType,
    ) -> Result<(JavaType, Conversion), ProbeError> {
        if let Some(reference) = &attribute.converter {
            if descriptor.config.allow_converter {
                match self.converters.resolve(reference, ty, self.hierarchy) {
                    Ok(method) => {
                        return Ok((method.return_type.clone(), Conversion::Converter(method)))
                    }
                    Err(err) => warn!(
                        probe = %descriptor.id,
                        attribute = %attribute.name,
                        error = %err,
                        "converter unusable, applying default type policy"
                    ),
                }
            } else {
                debug!(
                    probe = %descriptor.id,
                    attribute = %attribute.name,
                    "converters not allowed, ignoring converter"
                );
            }
        }

        if is_recordable(ty) {
            Ok((ty.clone(), Conversion::None))
        } else if descriptor.config.allow_to_string {
            Ok((JavaType::string(), Conversion::Stringify))
        } else {
            Err(ProbeError::UnsupportedAttributeType {
                attribute: attribute.name.clone(),
                type_name: ty.to_string(),
            })
        }
    }

    fn drop_attribute(&self, descriptor: &ProbeDescriptor, attribute: &AttributeBinding, reason: &str) {
        warn!(
            probe = %descriptor.id,
            class = %descriptor.class_name,
            attribute = %attribute.name,
            reason,
            "dropping attribute"
        );
    }
}
