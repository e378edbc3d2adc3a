//! Shared types for the probe-agent workspace.
//!
//! This crate holds the data model every other crate agrees on:
//!
//! - [`descriptor`]: JVM field/method descriptors ([`JavaType`], [`MethodType`])
//!   and class-name helpers
//! - [`probe`]: probe descriptors and the attribute bindings they capture
//! - [`env_utils`]: environment variable parsing for configuration overrides

pub mod descriptor;
pub mod env_utils;
pub mod probe;

pub use descriptor::{
    identifier_part, is_valid_class_name, is_valid_identifier, package_of, simple_name_of,
    to_internal_name, DescriptorError, JavaType, MethodType, CLASS_INTERNAL_NAME,
    OBJECT_INTERNAL_NAME, STRING_INTERNAL_NAME, THREAD_INTERNAL_NAME, THROWABLE_INTERNAL_NAME,
};
pub use probe::{
    AttributeBinding, FieldBinding, MethodTarget, ParameterBinding, ProbeConfig, ProbeDescriptor,
    ReturnBinding, DEFAULT_CLASS_PREFIX,
};
