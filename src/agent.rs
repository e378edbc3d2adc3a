//! The agent facade.
//!
//! [`ProbeAgent`] owns the probe registry and the class transformer and
//! exposes the control operations a host wires to its management surface:
//! define probes, inspect them, clear them, and transform classes as they
//! load.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use probe_agent_core::{
    ClassTransformer, ProbeDefinitionRegistry, ProbeError, TransformConfig, TransformOutcome,
};
use probe_agent_types::ProbeDescriptor;
use probe_resolver::ClassHierarchy;

pub struct ProbeAgent {
    transformer: ClassTransformer,
}

impl Default for ProbeAgent {
    fn default() -> Self {
        Self::new(TransformConfig::default())
    }
}

impl ProbeAgent {
    pub fn new(config: TransformConfig) -> Self {
        let registry = Arc::new(ProbeDefinitionRegistry::new());
        Self {
            transformer: ClassTransformer::new(registry, config),
        }
    }

    /// Agent configured from `PROBE_AGENT_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(TransformConfig::from_env())
    }

    pub fn registry(&self) -> &ProbeDefinitionRegistry {
        self.transformer.registry()
    }

    pub fn transformer(&self) -> &ClassTransformer {
        &self.transformer
    }

    /// Add the probes of `document` to the ones already defined.
    pub fn load_probes(&self, document: &str) -> Result<Vec<Arc<ProbeDescriptor>>, ProbeError> {
        self.registry().load(document)
    }

    /// Replace every probe with the ones in `document`. Returns the classes
    /// the host has to retransform.
    pub fn define_event_probes(&self, document: &str) -> Result<BTreeSet<String>, ProbeError> {
        let registry = self.registry();
        let reconfiguration = registry.reconfigure(document)?;
        registry.set_revert_instrumentation(false);
        info!(
            probes = reconfiguration.probes.len(),
            classes = reconfiguration.affected_classes.len(),
            "event probes defined"
        );
        Ok(reconfiguration.affected_classes)
    }

    /// Drop every probe. Returns the classes that were instrumented.
    pub fn clear_all_probes(&self) -> Vec<String> {
        let registry = self.registry();
        let classes = registry.clear_all();
        registry.set_current_configuration(String::new());
        classes
    }

    /// Text of the last probe document applied.
    pub fn current_configuration(&self) -> String {
        self.registry().current_configuration()
    }

    /// Every probe with its pending state, as JSON.
    pub fn retrieve_event_probes(&self) -> serde_json::Result<String> {
        self.registry().snapshot_json()
    }

    /// While set, transforms return the original bytes.
    pub fn set_revert_instrumentation(&self, revert: bool) {
        self.registry().set_revert_instrumentation(revert);
    }

    pub fn register_converter(&self, class: &str, name: &str, descriptor: &str) -> anyhow::Result<()> {
        self.transformer.register_converter(class, name, descriptor)
    }

    pub fn register_converter_class(&self, bytes: &[u8]) -> anyhow::Result<usize> {
        self.transformer.register_converter_class(bytes)
    }

    pub fn has_pending(&self, class_name: &str) -> bool {
        self.registry().has_pending(&probe_agent_types::to_internal_name(class_name))
    }

    /// Load-time hook: instrument `class_name` if it has pending probes.
    pub fn transform(
        &self,
        class_name: &str,
        class_bytes: &[u8],
        hierarchy: &dyn ClassHierarchy,
    ) -> TransformOutcome {
        self.transformer.transform(class_name, class_bytes, hierarchy)
    }
}
