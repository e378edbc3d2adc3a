//! A minimal bytecode interpreter for instrumented test methods.
//!
//! It understands exactly the instructions that test method bodies and the
//! method advisor emit. Event objects are plain heap objects: `begin` and
//! `end` are recorded, `commit` snapshots the object's fields into
//! [`Interpreter::committed`]. Static calls go to host functions registered
//! with [`Interpreter::native`].

use std::collections::HashMap;
use std::sync::Arc;

use probe_agent_types::{JavaType, MethodType};
use probe_classfile::instruction::opcodes::*;
use probe_classfile::{ClassFile, CodeItem, Instruction, Label, MethodBody, MethodContext};

const IADD: u8 = 0x60;
const LADD: u8 = 0x61;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
    Ref(usize),
    /// Second slot of a long or double, or an unset local
    Top,
    Void,
}

impl Value {
    fn is_wide(&self) -> bool {
        matches!(self, Value::Long(_) | Value::Double(_))
    }

    fn zero(ty: &JavaType) -> Self {
        match ty {
            JavaType::Long => Value::Long(0),
            JavaType::Float => Value::Float(0.0),
            JavaType::Double => Value::Double(0.0),
            JavaType::Object(_) | JavaType::Array(_) => Value::Null,
            _ => Value::Int(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommittedEvent {
    pub class_name: String,
    pub fields: HashMap<String, Value>,
}

#[derive(Debug, Default)]
struct Object {
    class_name: String,
    fields: HashMap<String, Value>,
}

type Native = Box<dyn Fn(&[Value]) -> Value>;

#[derive(Default)]
pub struct Interpreter {
    classes: HashMap<String, Arc<ClassFile>>,
    heap: Vec<Object>,
    statics: HashMap<(String, String), Value>,
    natives: HashMap<String, Native>,
    /// `Owner.method` of every `begin` and `end` call, in order
    pub lifecycle: Vec<String>,
    pub committed: Vec<CommittedEvent>,
    /// How often each native ran, by `owner.name`
    pub native_calls: HashMap<String, usize>,
}

#[allow(dead_code)]
impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, class_bytes: &[u8]) {
        let class = ClassFile::parse(class_bytes).unwrap();
        let name = class.this_class_name().unwrap().to_string();
        self.classes.insert(name, Arc::new(class));
    }

    /// Host implementation of the static method `owner.name`.
    pub fn native(&mut self, owner: &str, name: &str, f: impl Fn(&[Value]) -> Value + 'static) {
        self.natives.insert(format!("{owner}.{name}"), Box::new(f));
    }

    pub fn alloc(&mut self, class_name: &str) -> Value {
        self.heap.push(Object {
            class_name: class_name.to_string(),
            fields: HashMap::new(),
        });
        Value::Ref(self.heap.len() - 1)
    }

    pub fn set_field(&mut self, object: &Value, name: &str, value: Value) {
        let Value::Ref(index) = object else {
            panic!("set_field on {object:?}");
        };
        self.heap[*index].fields.insert(name.to_string(), value);
    }

    pub fn set_static(&mut self, owner: &str, name: &str, value: Value) {
        self.statics.insert((owner.to_string(), name.to_string()), value);
    }

    /// Run `class.name descriptor`. Instance methods take the receiver as
    /// the first argument. `Err` carries an uncaught thrown value.
    pub fn invoke(
        &mut self,
        class_name: &str,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Value, Value> {
        let class = self
            .classes
            .get(class_name)
            .cloned()
            .unwrap_or_else(|| panic!("class {class_name} not defined"));
        let index = class
            .find_method(name, descriptor)
            .unwrap_or_else(|| panic!("{class_name}.{name}{descriptor} not found"));
        let is_static = class.methods[index].is_static();
        let code = class.method_code(index).unwrap().expect("method has code");
        let ctx = MethodContext {
            class_name,
            method_name: name,
            descriptor,
            is_static,
        };
        let body = MethodBody::decode(&code.info, &class.constant_pool, ctx).unwrap();

        let mut locals = vec![Value::Top; body.max_locals as usize];
        let mut slot = 0;
        for arg in args {
            let wide = arg.is_wide();
            locals[slot] = arg;
            slot += if wide { 2 } else { 1 };
        }
        self.run(&class, &body, locals)
    }

    fn run(&mut self, class: &ClassFile, body: &MethodBody, mut locals: Vec<Value>) -> Result<Value, Value> {
        let pool = &class.constant_pool;
        let positions: HashMap<Label, usize> = body
            .items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item {
                CodeItem::Label(label) => Some((*label, i)),
                CodeItem::Insn(_) => None,
            })
            .collect();
        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0usize;

        loop {
            let insn = match &body.items[pc] {
                CodeItem::Label(_) => {
                    pc += 1;
                    continue;
                }
                CodeItem::Insn(insn) => insn,
            };
            let mut next = pc + 1;
            let mut thrown = None;

            match insn {
                Instruction::Simple(op) => match *op {
                    NOP => {}
                    ACONST_NULL => stack.push(Value::Null),
                    0x02..=0x08 => stack.push(Value::Int(*op as i32 - ICONST_0 as i32)),
                    LCONST_0 => push(&mut stack, Value::Long(0)),
                    FCONST_0 => stack.push(Value::Float(0.0)),
                    DCONST_0 => push(&mut stack, Value::Double(0.0)),
                    POP => {
                        stack.pop();
                    }
                    POP2 => {
                        stack.pop();
                        stack.pop();
                    }
                    DUP => {
                        let top = stack.last().cloned().unwrap();
                        stack.push(top);
                    }
                    DUP2 => {
                        let n = stack.len();
                        let pair = stack[n - 2..].to_vec();
                        stack.extend(pair);
                    }
                    DUP_X2 => {
                        let top = stack.pop().unwrap();
                        let at = stack.len() - 2;
                        stack.insert(at, top.clone());
                        stack.push(top);
                    }
                    SWAP => {
                        let n = stack.len();
                        stack.swap(n - 1, n - 2);
                    }
                    IADD => match (pop(&mut stack), pop(&mut stack)) {
                        (Value::Int(b), Value::Int(a)) => stack.push(Value::Int(a.wrapping_add(b))),
                        other => panic!("iadd on {other:?}"),
                    },
                    LADD => match (pop(&mut stack), pop(&mut stack)) {
                        (Value::Long(b), Value::Long(a)) => {
                            push(&mut stack, Value::Long(a.wrapping_add(b)))
                        }
                        other => panic!("ladd on {other:?}"),
                    },
                    IRETURN | LRETURN | FRETURN | DRETURN | ARETURN => return Ok(pop(&mut stack)),
                    RETURN => return Ok(Value::Void),
                    ATHROW => thrown = Some(pop(&mut stack)),
                    other => panic!("unsupported opcode 0x{other:02x}"),
                },
                Instruction::Local { opcode, index } => {
                    let index = *index as usize;
                    match *opcode {
                        ILOAD | FLOAD | ALOAD => stack.push(locals[index].clone()),
                        LLOAD | DLOAD => push(&mut stack, locals[index].clone()),
                        ISTORE | FSTORE | ASTORE => locals[index] = pop(&mut stack),
                        LSTORE | DSTORE => {
                            locals[index] = pop(&mut stack);
                            locals[index + 1] = Value::Top;
                        }
                        other => panic!("unsupported local opcode 0x{other:02x}"),
                    }
                }
                Instruction::Field { opcode, index } => {
                    let member = pool.member_ref(*index).unwrap();
                    let ty = JavaType::parse(member.descriptor).unwrap();
                    let key = (member.owner.to_string(), member.name.to_string());
                    match *opcode {
                        GETSTATIC => {
                            let value = self.statics.get(&key).cloned().unwrap_or_else(|| Value::zero(&ty));
                            push(&mut stack, value);
                        }
                        PUTSTATIC => {
                            let value = pop(&mut stack);
                            self.statics.insert(key, value);
                        }
                        GETFIELD => match pop(&mut stack) {
                            Value::Ref(object) => {
                                let value = self.heap[object]
                                    .fields
                                    .get(member.name)
                                    .cloned()
                                    .unwrap_or_else(|| Value::zero(&ty));
                                push(&mut stack, value);
                            }
                            other => panic!("getfield {} on {other:?}", member.name),
                        },
                        PUTFIELD => {
                            let value = pop(&mut stack);
                            match pop(&mut stack) {
                                Value::Ref(object) => {
                                    self.heap[object].fields.insert(member.name.to_string(), value);
                                }
                                other => panic!("putfield {} on {other:?}", member.name),
                            }
                        }
                        other => panic!("unsupported field opcode 0x{other:02x}"),
                    }
                }
                Instruction::Invoke { opcode, index } => {
                    let member = pool.member_ref(*index).unwrap();
                    let method_type = MethodType::parse(member.descriptor).unwrap();
                    let mut args: Vec<Value> = method_type.params.iter().map(|_| pop(&mut stack)).collect();
                    args.reverse();
                    let receiver = (*opcode != INVOKESTATIC).then(|| pop(&mut stack));

                    match (*opcode, member.name) {
                        (INVOKESPECIAL, "<init>") => {}
                        (INVOKEVIRTUAL, "begin" | "end") => {
                            self.lifecycle.push(format!("{}.{}", member.owner, member.name));
                        }
                        (INVOKEVIRTUAL, "commit") => {
                            let Some(Value::Ref(object)) = receiver else {
                                panic!("commit on {receiver:?}");
                            };
                            let object = &self.heap[object];
                            self.committed.push(CommittedEvent {
                                class_name: object.class_name.clone(),
                                fields: object.fields.clone(),
                            });
                        }
                        (INVOKESTATIC, name) => {
                            let key = format!("{}.{}", member.owner, name);
                            let native = self
                                .natives
                                .get(&key)
                                .unwrap_or_else(|| panic!("no native for {key}"));
                            let result = native(&args);
                            *self.native_calls.entry(key).or_default() += 1;
                            if method_type.ret != JavaType::Void {
                                push(&mut stack, result);
                            }
                        }
                        (op, name) => panic!("unsupported invoke 0x{op:02x} {}.{name}", member.owner),
                    }
                }
                Instruction::Type { opcode: NEW, index } => {
                    let class_name = pool.class_name(*index).unwrap().to_string();
                    let object = self.alloc(&class_name);
                    stack.push(object);
                }
                Instruction::Branch { opcode, target } => {
                    let taken = match *opcode {
                        GOTO => true,
                        IFNULL => pop(&mut stack) == Value::Null,
                        IFNONNULL => pop(&mut stack) != Value::Null,
                        other => panic!("unsupported branch 0x{other:02x}"),
                    };
                    if taken {
                        next = positions[target];
                    }
                }
                other => panic!("unsupported instruction {other:?}"),
            }

            if let Some(exception) = thrown {
                let handler = body.exception_table.iter().find(|h| {
                    positions[&h.start] <= pc && pc < positions[&h.end]
                });
                match handler {
                    Some(handler) => {
                        stack.clear();
                        stack.push(exception);
                        next = positions[&handler.handler];
                    }
                    None => return Err(exception),
                }
            }
            pc = next;
        }
    }
}

/// Push a value, padding longs and doubles to two slots.
fn push(stack: &mut Vec<Value>, value: Value) {
    let wide = value.is_wide();
    stack.push(value);
    if wide {
        stack.push(Value::Top);
    }
}

/// Pop one value, consuming both slots of a long or double.
fn pop(stack: &mut Vec<Value>) -> Value {
    match stack.pop().expect("operand stack underflow") {
        Value::Top => stack.pop().expect("operand stack underflow"),
        value => value,
    }
}
