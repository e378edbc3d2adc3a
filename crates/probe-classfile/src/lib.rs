//! JVM class-file codec for the probe agent.
//!
//! The codec covers what load-time instrumentation needs and nothing more:
//!
//! - [`class_file`]: parse and write whole classes, with attributes kept raw
//! - [`constant_pool`]: typed constant pool with deduplicating append helpers
//! - [`code`]: method bodies decoded into label-based instruction lists
//! - [`instruction`]: instruction model, opcode table and per-instruction codec
//! - [`stack_map`]: StackMapTable frames, expanded to explicit form
//! - [`analysis`]: stack depth verification of rewritten bodies
//!
//! ## Example
//!
//! ```ignore
//! use probe_classfile::{ClassFile, MethodBody, MethodContext};
//!
//! let mut class = ClassFile::parse(&bytes)?;
//! let index = class.find_method("run", "()V").unwrap();
//! let code = class.method_code(index)?.unwrap();
//! let body = MethodBody::decode(&code.info, &class.constant_pool, ctx)?;
//! let attr = body.encode(&mut class.constant_pool)?;
//! ```

pub mod analysis;
pub mod bytes;
pub mod class_file;
pub mod code;
pub mod constant_pool;
pub mod instruction;
pub mod stack_map;

pub use analysis::verify_stack;
pub use class_file::{access, attribute_names, AttributeInfo, ClassFile, MemberInfo};
pub use code::{CodeItem, ExceptionHandler, LineNumber, LocalVariable, MethodBody, MethodContext};
pub use constant_pool::{Constant, ConstantPool, MemberRef};
pub use instruction::{opcodes, Instruction, Label};
pub use stack_map::{initial_locals, Frame, VerificationType};
