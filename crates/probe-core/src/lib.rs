//! Probe processing: from probe documents to instrumented classes.
//!
//! - [`parser`] and [`registry`]: probe documents and the live probe set
//! - [`synthesizer`] and [`record`]: event record layout and event classes
//! - [`advisor`]: method body rewriting
//! - [`converter`]: user-supplied value converters
//! - [`transformer`]: the per-class transform entry point
//!
//! ## Example
//!
//! ```ignore
//! use probe_agent_core::{ClassTransformer, ProbeDefinitionRegistry, TransformConfig};
//!
//! let registry = Arc::new(ProbeDefinitionRegistry::from_document(&xml)?);
//! let transformer = ClassTransformer::new(registry, TransformConfig::from_env());
//! match transformer.transform("com/x/Demo", &bytes, &hierarchy) {
//!     TransformOutcome::Transformed { class_bytes, records } => { /* define records, then the class */ }
//!     TransformOutcome::Unchanged => {}
//! }
//! ```

pub mod advisor;
pub mod config;
pub mod converter;
pub mod errors;
pub mod parser;
pub mod record;
pub mod registry;
pub mod synthesizer;
pub mod transformer;

pub use advisor::{AdviceTarget, MethodAdvisor};
pub use config::{EventAnnotations, TransformConfig};
pub use converter::{ConverterMethod, ConverterRegistry};
pub use errors::ProbeError;
pub use parser::{parse_document, ProbeDocument};
pub use record::generate_record_class;
pub use registry::{ProbeDefinitionRegistry, Reconfiguration};
pub use synthesizer::{
    AttributeSource, Conversion, EventRecordSynthesizer, FieldMetadata, RecordField,
    SynthesizedEventRecord,
};
pub use transformer::{ClassTransformer, GeneratedRecord, TransformOutcome};
