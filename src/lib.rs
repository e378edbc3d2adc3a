//! Probe Agent
//!
//! Declarative load-time instrumentation for JVM classes:
//!
//! - **Probe documents**: XML descriptions of which methods to probe and which
//!   values (arguments, fields, return values) to capture
//! - **Reference chains**: dotted field expressions resolved against the class
//!   hierarchy and checked for accessibility
//! - **Event classes**: one generated class per probe, extending the
//!   configured event base class
//! - **Method rewriting**: probed methods create, fill and commit an event on
//!   every invocation
//!
//! See [`ProbeAgent`] for the host-facing entry point.

pub mod agent;
pub mod logging;

pub use agent::ProbeAgent;
pub use logging::init_logging;

pub use probe_agent_core::{
    ClassTransformer, GeneratedRecord, ProbeDefinitionRegistry, ProbeError, TransformConfig,
    TransformOutcome,
};
pub use probe_agent_types::{ProbeDescriptor, ProbeConfig};
pub use probe_resolver::{ClassHierarchy, ClassInfo, InMemoryHierarchy};
