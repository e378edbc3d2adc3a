//! Symbolic field access for probe expressions.
//!
//! - [`hierarchy`]: the class metadata the host supplies, plus supertype and
//!   nest lookups
//! - [`access`]: whether the instrumented class may read a field
//! - [`expression`]: dotted expressions resolved into reference chains
//! - [`chain`]: the resolved chain and its normalization

pub mod access;
pub mod chain;
pub mod error;
pub mod expression;
pub mod hierarchy;

pub use access::AccessibilityVerifier;
pub use chain::{OuterLink, ReferenceChainElement, ResolvedReferenceChain};
pub use error::ResolveError;
pub use expression::ReferenceChainResolver;
pub use hierarchy::{
    find_field, is_assignable_to, is_subclass_of, ClassHierarchy, ClassInfo, FieldMember,
    InMemoryHierarchy, LoaderId, ModuleDescriptor, ModuleExport, OverlayHierarchy, APP_LOADER,
};
