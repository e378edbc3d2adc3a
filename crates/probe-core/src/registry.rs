//! Probe definition registry.
//!
//! Holds every known probe, keyed by target class, as an immutable snapshot
//! behind an `RwLock<Arc<_>>`. Readers clone the `Arc` and never block
//! writers for longer than the pointer swap; writers build a complete new
//! map and publish it in one step, so a class's probe list is always either
//! entirely old or entirely new.
//!
//! Each registered probe carries a pending flag. It starts set and is
//! cleared by [`ProbeDefinitionRegistry::mark_applied`] once the class has
//! been transformed.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use probe_agent_types::ProbeDescriptor;

use crate::errors::ProbeError;
use crate::parser::{parse_document, ProbeDocument};

#[derive(Debug)]
struct RegisteredProbe {
    descriptor: Arc<ProbeDescriptor>,
    pending: AtomicBool,
}

impl RegisteredProbe {
    fn new(descriptor: ProbeDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor: Arc::new(descriptor),
            pending: AtomicBool::new(true),
        })
    }

    fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

type ClassProbes = BTreeMap<String, Vec<Arc<RegisteredProbe>>>;

#[derive(Debug, Default)]
struct Snapshot {
    classes: ClassProbes,
}

/// Outcome of [`ProbeDefinitionRegistry::reconfigure`].
#[derive(Debug, Clone, Default)]
pub struct Reconfiguration {
    /// Probes accepted from the new document
    pub probes: Vec<Arc<ProbeDescriptor>>,
    /// Classes that gained, lost or changed probes and need retransforming
    pub affected_classes: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct ProbeDefinitionRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
    configuration: RwLock<String>,
    revert_instrumentation: AtomicBool,
}

impl ProbeDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded from a document.
    pub fn from_document(text: &str) -> Result<Self, ProbeError> {
        let registry = Self::new();
        registry.load(text)?;
        Ok(registry)
    }

    /// Add the probes of `text` to those already registered. Returns the
    /// probes that were accepted.
    pub fn load(&self, text: &str) -> Result<Vec<Arc<ProbeDescriptor>>, ProbeError> {
        let document = parse_document(text)?;

        let mut guard = self.snapshot.write();
        let mut classes = guard.classes.clone();
        let accepted = Self::admit(document, &mut classes, |_| {});
        *guard = Arc::new(Snapshot { classes });
        drop(guard);

        *self.configuration.write() = text.to_string();
        info!(accepted = accepted.len(), "loaded probe definitions");
        Ok(accepted)
    }

    /// Replace the whole configuration with `text`. Every class named in the
    /// document ends up with exactly the document's valid probes for it;
    /// classes not named are dropped.
    pub fn modify(&self, text: &str) -> Result<Vec<Arc<ProbeDescriptor>>, ProbeError> {
        Ok(self.reconfigure(text)?.probes)
    }

    /// Like [`modify`](Self::modify), also reporting which classes changed.
    /// A class whose probe list is unchanged keeps its applied state.
    pub fn reconfigure(&self, text: &str) -> Result<Reconfiguration, ProbeError> {
        let document = parse_document(text)?;

        let mut guard = self.snapshot.write();
        let previous = guard.clone();
        let mut classes = ClassProbes::new();
        let mut named = BTreeSet::new();
        let probes = Self::admit(document, &mut classes, |class| {
            named.insert(class.to_string());
        });

        let mut affected = BTreeSet::new();
        for class in &named {
            let old = previous.classes.get(class);
            let new = classes.get(class);
            match (old, new) {
                (Some(old), Some(new)) if same_descriptors(old, new) => {
                    classes.insert(class.clone(), old.clone());
                }
                (None, None) => {}
                _ => {
                    affected.insert(class.clone());
                }
            }
        }
        for class in previous.classes.keys() {
            if !named.contains(class) {
                affected.insert(class.clone());
            }
        }

        *guard = Arc::new(Snapshot { classes });
        drop(guard);

        *self.configuration.write() = text.to_string();
        info!(
            accepted = probes.len(),
            affected = affected.len(),
            "reconfigured probe definitions"
        );
        Ok(Reconfiguration {
            probes,
            affected_classes: affected,
        })
    }

    /// Validate each parsed probe against `classes` and add the valid ones.
    fn admit(
        document: ProbeDocument,
        classes: &mut ClassProbes,
        mut on_class: impl FnMut(&str),
    ) -> Vec<Arc<ProbeDescriptor>> {
        let mut accepted = Vec::new();
        for probe in document.probes {
            let probe = match probe {
                Ok(probe) => probe,
                Err(err) => {
                    warn!(error = %err, "skipping probe definition");
                    continue;
                }
            };
            on_class(&probe.class_name);

            let entries = classes.entry(probe.class_name.clone()).or_default();
            let event_class = probe.event_class_name();
            if entries
                .iter()
                .any(|e| e.descriptor.event_class_name() == event_class)
            {
                let err = ProbeError::DuplicateEventName {
                    probe: probe.id.clone(),
                    class: probe.class_name.clone(),
                    event_class,
                };
                warn!(error = %err, "skipping probe definition");
                continue;
            }

            debug!(probe = %probe, "registered probe");
            let registered = RegisteredProbe::new(probe);
            accepted.push(registered.descriptor.clone());
            entries.push(registered);
        }
        classes.retain(|_, entries| !entries.is_empty());
        accepted
    }

    /// Empty the registry, returning the classes that had probes.
    pub fn clear_all(&self) -> Vec<String> {
        let previous = std::mem::take(&mut *self.snapshot.write());
        let classes: Vec<String> = previous.classes.keys().cloned().collect();
        info!(classes = classes.len(), "cleared all probe definitions");
        classes
    }

    pub fn has_pending(&self, class_name: &str) -> bool {
        self.current()
            .classes
            .get(class_name)
            .is_some_and(|entries| entries.iter().any(|e| e.is_pending()))
    }

    pub fn probes_for(&self, class_name: &str) -> Vec<Arc<ProbeDescriptor>> {
        self.current()
            .classes
            .get(class_name)
            .map(|entries| entries.iter().map(|e| e.descriptor.clone()).collect())
            .unwrap_or_default()
    }

    /// Clear the pending flag of the `applied` definitions on `class_name`.
    /// Entries are matched by identity: a definition registered after
    /// `applied` was read from [`probes_for`](Self::probes_for) stays pending.
    pub fn mark_applied(&self, class_name: &str, applied: &[Arc<ProbeDescriptor>]) {
        let snapshot = self.current();
        let Some(entries) = snapshot.classes.get(class_name) else {
            return;
        };
        for entry in entries {
            if applied.iter().any(|a| Arc::ptr_eq(a, &entry.descriptor)) {
                entry.pending.store(false, Ordering::Release);
            } else if entry.is_pending() {
                debug!(
                    class = %class_name,
                    id = %entry.descriptor.id,
                    "definition registered during transform stays pending"
                );
            }
        }
    }

    pub fn class_names(&self) -> Vec<String> {
        self.current().classes.keys().cloned().collect()
    }

    /// Text of the last document applied.
    pub fn current_configuration(&self) -> String {
        self.configuration.read().clone()
    }

    pub fn set_current_configuration(&self, text: impl Into<String>) {
        *self.configuration.write() = text.into();
    }

    pub fn set_revert_instrumentation(&self, revert: bool) {
        self.revert_instrumentation.store(revert, Ordering::Release);
    }

    pub fn is_revert_instrumentation(&self) -> bool {
        self.revert_instrumentation.load(Ordering::Acquire)
    }

    /// JSON view of every registered probe and its pending state.
    pub fn snapshot_json(&self) -> serde_json::Result<String> {
        let snapshot = self.current();
        let view = RegistryView {
            revert_instrumentation: self.is_revert_instrumentation(),
            classes: snapshot
                .classes
                .iter()
                .map(|(class, entries)| {
                    let probes = entries
                        .iter()
                        .map(|e| ProbeView {
                            pending: e.is_pending(),
                            descriptor: &e.descriptor,
                        })
                        .collect();
                    (class.as_str(), probes)
                })
                .collect(),
        };
        serde_json::to_string_pretty(&view)
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }
}

fn same_descriptors(old: &[Arc<RegisteredProbe>], new: &[Arc<RegisteredProbe>]) -> bool {
    old.len() == new.len()
        && old
            .iter()
            .zip(new)
            .all(|(a, b)| a.descriptor == b.descriptor)
}

#[derive(Serialize)]
struct RegistryView<'a> {
    revert_instrumentation: bool,
    classes: BTreeMap<&'a str, Vec<ProbeView<'a>>>,
}

#[derive(Serialize)]
struct ProbeView<'a> {
    pending: bool,
    #[serde(flatten)]
    descriptor: &'a ProbeDescriptor,
}

impl fmt::Display for ProbeDefinitionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (class, entries) in &self.current().classes {
            writeln!(f, "Transformations for class: {class}")?;
            for entry in entries {
                writeln!(f, "\t{}", entry.descriptor)?;
            }
        }
        Ok(())
    }
}
