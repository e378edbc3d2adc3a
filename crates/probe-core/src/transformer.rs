//! Class transformation.
//!
//! [`ClassTransformer::transform`] is the load-time entry point: given the
//! bytes of a class that has pending probes, it rewrites every probed method
//! and generates one event class per probe. A transform either applies all of
//! the class's probes or none of them.

use anyhow::Context;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use probe_agent_types::{to_internal_name, ProbeDescriptor};
use probe_classfile::{ClassFile, MethodBody, MethodContext};
use probe_resolver::{ClassHierarchy, ClassInfo, OverlayHierarchy};

use crate::advisor::{AdviceTarget, MethodAdvisor};
use crate::config::TransformConfig;
use crate::converter::ConverterRegistry;
use crate::errors::ProbeError;
use crate::record::generate_record_class;
use crate::registry::ProbeDefinitionRegistry;
use crate::synthesizer::{EventRecordSynthesizer, SynthesizedEventRecord};

/// An event class produced by a transform. The host must define it in the
/// same loader as the instrumented class.
#[derive(Debug, Clone)]
pub struct GeneratedRecord {
    /// Internal name of the event class
    pub class_name: String,
    pub class_bytes: Vec<u8>,
    pub record: SynthesizedEventRecord,
}

#[derive(Debug, Clone)]
pub enum TransformOutcome {
    Transformed {
        class_bytes: Vec<u8>,
        records: Vec<GeneratedRecord>,
    },
    /// Keep the original bytes.
    Unchanged,
}

impl TransformOutcome {
    pub fn is_transformed(&self) -> bool {
        matches!(self, TransformOutcome::Transformed { .. })
    }
}

pub struct ClassTransformer {
    registry: Arc<ProbeDefinitionRegistry>,
    converters: RwLock<ConverterRegistry>,
    config: TransformConfig,
}

impl ClassTransformer {
    pub fn new(registry: Arc<ProbeDefinitionRegistry>, config: TransformConfig) -> Self {
        Self {
            registry,
            converters: RwLock::new(ConverterRegistry::new()),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ProbeDefinitionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Make a converter method available to probe attributes.
    pub fn register_converter(&self, class: &str, name: &str, descriptor: &str) -> anyhow::Result<()> {
        self.converters.write().register(class, name, descriptor)
    }

    /// Make every public static converter of a class file available.
    pub fn register_converter_class(&self, bytes: &[u8]) -> anyhow::Result<usize> {
        self.converters.write().register_class_file(bytes)
    }

    /// Transform `class_name`, falling back to the original bytes on any
    /// failure.
    pub fn transform(
        &self,
        class_name: &str,
        class_bytes: &[u8],
        hierarchy: &dyn ClassHierarchy,
    ) -> TransformOutcome {
        match self.try_transform(class_name, class_bytes, hierarchy) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(class = %class_name, error = %err, "class left uninstrumented");
                TransformOutcome::Unchanged
            }
        }
    }

    /// Like [`transform`](Self::transform), but reports why a class could not
    /// be instrumented.
    pub fn try_transform(
        &self,
        class_name: &str,
        class_bytes: &[u8],
        hierarchy: &dyn ClassHierarchy,
    ) -> Result<TransformOutcome, ProbeError> {
        let class_name = to_internal_name(class_name);
        if self.registry.is_revert_instrumentation() {
            debug!(class = %class_name, "reverting instrumentation");
            return Ok(TransformOutcome::Unchanged);
        }
        if !self.registry.has_pending(&class_name) {
            return Ok(TransformOutcome::Unchanged);
        }
        let probes = self.registry.probes_for(&class_name);

        let class_format = |err: anyhow::Error| ProbeError::ClassFormat {
            class: class_name.clone(),
            reason: format!("{err:#}"),
        };
        let mut class = ClassFile::parse(class_bytes).map_err(class_format)?;
        let parsed_name = class.this_class_name().map_err(class_format)?;
        if parsed_name != class_name {
            return Err(ProbeError::ClassFormat {
                class: class_name.clone(),
                reason: format!("bytes define {parsed_name}"),
            });
        }

        let this_class = ClassInfo::from_class_file(&class).map_err(class_format)?;
        let hierarchy = OverlayHierarchy::new(hierarchy, this_class);
        let converters = self.converters.read();
        let synthesizer = EventRecordSynthesizer::new(&hierarchy, &converters);

        let mut records = Vec::with_capacity(probes.len());
        for probe in &probes {
            let record = self.instrument(&mut class, probe, &synthesizer)?;
            let Some(record) = record else {
                return Ok(TransformOutcome::Unchanged);
            };
            let class_bytes = generate_record_class(&record, &self.config).map_err(class_format)?;
            records.push(GeneratedRecord {
                class_name: record.class_name.clone(),
                class_bytes,
                record,
            });
        }

        let class_bytes = class.to_bytes().map_err(class_format)?;
        self.registry.mark_applied(&class_name, &probes);
        info!(
            class = %class_name,
            probes = probes.len(),
            "instrumented class"
        );
        Ok(TransformOutcome::Transformed {
            class_bytes,
            records,
        })
    }

    /// Rewrite the method `probe` targets. `None` when the method cannot be
    /// instrumented at all.
    fn instrument(
        &self,
        class: &mut ClassFile,
        probe: &ProbeDescriptor,
        synthesizer: &EventRecordSynthesizer<'_>,
    ) -> Result<Option<SynthesizedEventRecord>, ProbeError> {
        let class_name = probe.class_name.as_str();
        let method = &probe.method;
        let class_format = |err: anyhow::Error| ProbeError::ClassFormat {
            class: class_name.to_string(),
            reason: format!("{err:#}"),
        };

        let Some(index) = class.find_method(&method.name, &method.descriptor) else {
            warn!(probe = %probe.id, class = %class_name, method = %method, "target method not found");
            return Ok(None);
        };
        let info = &class.methods[index];
        if method.name.starts_with('<') || info.is_abstract() || info.is_native() {
            warn!(probe = %probe.id, class = %class_name, method = %method, "method cannot be instrumented");
            return Ok(None);
        }
        let is_static = info.is_static();
        let method_type = method
            .method_type()
            .map_err(|err| ProbeError::spec_for(&probe.id, err.to_string()))?;
        let code = class
            .method_code(index)
            .map_err(class_format)?
            .map(|attribute| attribute.info.clone())
            .with_context(|| format!("{method} has no Code attribute"))
            .map_err(class_format)?;

        let chains = synthesizer.resolve_fields(probe);
        let record = synthesizer.synthesize(probe, &method_type, is_static, &chains);

        let ctx = MethodContext {
            class_name,
            method_name: &method.name,
            descriptor: &method.descriptor,
            is_static,
        };
        let mut body = MethodBody::decode(&code, &class.constant_pool, ctx).map_err(class_format)?;
        let target = AdviceTarget {
            class_name,
            method_name: &method.name,
            method_type: &method_type,
            is_static,
            stack_maps: class.uses_stack_maps(),
            use_rethrow: probe.config.use_rethrow,
            emit_on_exception: probe.config.emit_on_exception,
        };
        MethodAdvisor::new(target, &record, &self.config).apply(&mut body, &mut class.constant_pool)?;

        let code = body.encode(&mut class.constant_pool).map_err(class_format)?;
        let position = class
            .attribute_position(&class.methods[index].attributes, probe_classfile::attribute_names::CODE)
            .context("Code attribute disappeared")
            .map_err(class_format)?;
        class.methods[index].attributes[position] = code;

        debug!(
            probe = %probe.id,
            class = %class_name,
            method = %method,
            event = %record.class_name,
            fields = record.fields.len(),
            "rewrote method"
        );
        Ok(Some(record))
    }
}
