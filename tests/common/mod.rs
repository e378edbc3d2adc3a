#![allow(unused_imports)]
//! Shared test utilities for integration tests.
//!
//! # Modules
//!
//! - `assertions`: Result and error-message assertions
//! - `classes`: Builder for small class files with hand-written bytecode
//! - `interpreter`: A minimal bytecode interpreter that runs instrumented
//!   methods and records the events they commit

pub mod assertions;
pub mod classes;
pub mod interpreter;

pub use assertions::{assert_err, assert_error_contains, assert_ok};
pub use classes::ClassBuilder;
pub use interpreter::{CommittedEvent, Interpreter, Value};
