//! Method body rewriting.
//!
//! The advisor splices three pieces into an instrumented method:
//!
//! - on entry: create the event, store every parameter and field attribute
//!   into it, call `begin` and keep it in a fresh local
//! - before every return: capture the return value (when bound), then call
//!   `end` and `commit`
//! - with rethrow or emit-on-exception enabled: a catch-all handler around
//!   the original body that commits the event, then rethrows (rethrow) or
//!   returns the zero value of the return type (emit-on-exception alone)
//! - otherwise: a commit before every `athrow`
//!
//! Field chains are read hop by hop. Every intermediate reference is checked
//! for null; a null hop records the zero value of the leaf type instead of
//! throwing. A converter is never called with null: a null reference handed
//! to one records the zero value of the converted type.

use anyhow::{Context, Result};
use tracing::debug;

use probe_agent_types::{JavaType, MethodType, OBJECT_INTERNAL_NAME, THROWABLE_INTERNAL_NAME};
use probe_classfile::instruction::opcodes::*;
use probe_classfile::{
    initial_locals, verify_stack, CodeItem, ConstantPool, ExceptionHandler, Frame, Instruction,
    MethodBody, VerificationType,
};
use probe_resolver::{ReferenceChainElement, ResolvedReferenceChain};

use crate::config::TransformConfig;
use crate::errors::ProbeError;
use crate::synthesizer::{AttributeSource, Conversion, RecordField, SynthesizedEventRecord};

/// The method being rewritten.
#[derive(Debug, Clone, Copy)]
pub struct AdviceTarget<'a> {
    pub class_name: &'a str,
    pub method_name: &'a str,
    pub method_type: &'a MethodType,
    pub is_static: bool,
    /// Whether inserted branches need StackMapTable frames
    pub stack_maps: bool,
    pub use_rethrow: bool,
    pub emit_on_exception: bool,
}

pub struct MethodAdvisor<'a> {
    target: AdviceTarget<'a>,
    record: &'a SynthesizedEventRecord,
    config: &'a TransformConfig,
}

impl<'a> MethodAdvisor<'a> {
    pub fn new(
        target: AdviceTarget<'a>,
        record: &'a SynthesizedEventRecord,
        config: &'a TransformConfig,
    ) -> Self {
        Self {
            target,
            record,
            config,
        }
    }

    /// Rewrite `body` in place and recompute its `max_stack`.
    pub fn apply(&self, body: &mut MethodBody, pool: &mut ConstantPool) -> Result<(), ProbeError> {
        let target = &self.target;
        self.rewrite(body, pool)
            .map_err(|err| ProbeError::ClassFormat {
                class: target.class_name.to_string(),
                reason: format!("{err:#}"),
            })?;
        let max_stack = verify_stack(body, pool).map_err(|err| ProbeError::BytecodeVerification {
            class: target.class_name.to_string(),
            method: format!("{}{}", target.method_name, target.method_type.descriptor()),
            reason: format!("{err:#}"),
        })?;
        body.max_stack = max_stack;
        debug!(
            class = %target.class_name,
            method = %target.method_name,
            event = %self.record.class_name,
            max_stack,
            max_locals = body.max_locals,
            "advised method"
        );
        Ok(())
    }

    fn rewrite(&self, body: &mut MethodBody, pool: &mut ConstantPool) -> Result<()> {
        let target = &self.target;
        let event_slot = body.max_locals;
        body.max_locals = event_slot
            .checked_add(1)
            .context("no local slot left for the event")?;

        let event_type = VerificationType::object(&self.record.class_name);
        if target.stack_maps {
            // The event local is live from the end of the entry code on.
            for frame in body.frames.values_mut() {
                frame.set_local(event_slot, event_type.clone());
            }
        }

        let mut entry = Vec::new();
        self.emit_entry(body, pool, event_slot, &mut entry)?;
        let catch_all = (target.use_rethrow || target.emit_on_exception).then(|| {
            let start = body.new_label();
            entry.push(CodeItem::Label(start));
            (start, body.new_label(), body.new_label())
        });
        body.insert_items(0, entry);

        let returns_value = target.method_type.ret != JavaType::Void;
        let mut items = Vec::with_capacity(body.items.len());
        for item in std::mem::take(&mut body.items) {
            if let CodeItem::Insn(insn) = &item {
                if insn.is_return() {
                    self.emit_exit(body, pool, event_slot, returns_value, &mut items)?;
                } else if insn.is_throw() && catch_all.is_none() {
                    self.emit_commit(pool, event_slot, &mut items)?;
                }
            }
            items.push(item);
        }
        body.items = items;

        if let Some((start, end, handler)) = catch_all {
            body.items.push(CodeItem::Label(end));
            body.items.push(CodeItem::Label(handler));
            if target.stack_maps {
                let mut frame = Frame::new(event_locals(event_slot, event_type), Vec::new());
                frame.stack.push(VerificationType::object(THROWABLE_INTERNAL_NAME));
                body.frames.insert(handler, frame);
            }
            let mut handler_code = Vec::new();
            self.emit_commit(pool, event_slot, &mut handler_code)?;
            if target.use_rethrow {
                op(&mut handler_code, ATHROW);
            } else {
                // Swallow the exception.
                op(&mut handler_code, POP);
                let ret = &target.method_type.ret;
                if returns_value {
                    op(&mut handler_code, zero_opcode(ret));
                }
                op(&mut handler_code, return_opcode(ret));
            }
            body.items.extend(handler_code);
            body.exception_table.push(ExceptionHandler {
                start,
                end,
                handler,
                catch_type: pool.add_class(THROWABLE_INTERNAL_NAME)?,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Entry
    // =========================================================================

    fn emit_entry(
        &self,
        body: &mut MethodBody,
        pool: &mut ConstantPool,
        event_slot: u16,
        items: &mut Vec<CodeItem>,
    ) -> Result<()> {
        let record = &self.record.class_name;
        let entry_locals = initial_locals(
            self.target.class_name,
            self.target.method_name,
            self.target.method_type,
            self.target.is_static,
        );

        insn(
            items,
            Instruction::Type {
                opcode: NEW,
                index: pool.add_class(record)?,
            },
        );
        op(items, DUP);
        op(items, DUP);
        invoke(pool, items, INVOKESPECIAL, record, "<init>", "()V")?;

        for field in &self.record.fields {
            match &field.source {
                AttributeSource::Parameter { slot, .. } => {
                    op(items, DUP);
                    insn(items, Instruction::local(load_opcode(&field.source_type), *slot));
                    let event_type = VerificationType::object(record);
                    let below = vec![event_type.clone(), event_type.clone(), event_type];
                    self.emit_guarded_conversion(body, pool, field, &entry_locals, below, items)?;
                }
                AttributeSource::Field { chain } => {
                    op(items, DUP);
                    self.emit_chain(body, pool, field, chain, &entry_locals, items)?;
                }
                AttributeSource::ReturnValue => continue,
            }
            self.emit_put(pool, field, items)?;
        }

        invoke(pool, items, INVOKEVIRTUAL, record, "begin", "()V")?;
        insn(items, Instruction::local(ASTORE, event_slot));
        Ok(())
    }

    /// Push the converted leaf value of `chain`. Entered with
    /// `[event, event, event]` on the stack.
    fn emit_chain(
        &self,
        body: &mut MethodBody,
        pool: &mut ConstantPool,
        field: &RecordField,
        chain: &ResolvedReferenceChain,
        entry_locals: &[VerificationType],
        items: &mut Vec<CodeItem>,
    ) -> Result<()> {
        let mut loads = Vec::new();
        for element in chain.elements() {
            match element {
                ReferenceChainElement::ThisReference { .. } => {
                    loads.push(Instruction::local(ALOAD, 0));
                }
                ReferenceChainElement::FieldReference {
                    owner,
                    name,
                    field_type,
                    ..
                } => {
                    let opcode = if element.is_static() { GETSTATIC } else { GETFIELD };
                    let index = pool.add_field_ref(owner, name, &field_type.descriptor())?;
                    loads.push(Instruction::Field { opcode, index });
                }
                ReferenceChainElement::QualifiedThisReference { links, .. } => {
                    for link in links {
                        let index = pool.add_field_ref(&link.owner, &link.name, &link.descriptor())?;
                        loads.push(Instruction::Field {
                            opcode: GETFIELD,
                            index,
                        });
                    }
                }
            }
        }
        if loads.is_empty() {
            loads.push(Instruction::local(ALOAD, 0));
        }

        // The receiver is never null. Other hops are checked, and so is a
        // reference leaf handed to a converter.
        let last = loads.len() - 1;
        let guard_leaf = matches!(field.conversion, Conversion::Converter(_)) && field.source_type.is_reference();
        let needs_check = |i: usize, load: &Instruction| {
            (i < last || guard_leaf) && !matches!(load, Instruction::Local { .. })
        };
        let null_path = loads
            .iter()
            .enumerate()
            .any(|(i, load)| needs_check(i, load))
            .then(|| (body.new_label(), body.new_label()));

        for (i, load) in loads.iter().enumerate() {
            insn(items, load.clone());
            if let (Some((on_null, _)), true) = (null_path, needs_check(i, load)) {
                op(items, DUP);
                insn(items, Instruction::jump(IFNULL, on_null));
            }
        }

        self.emit_conversion(pool, &field.conversion, items)?;

        let Some((on_null, resume)) = null_path else {
            return Ok(());
        };
        let written = &field.field_type;
        let event_type = VerificationType::object(&self.record.class_name);
        let base_stack = vec![event_type.clone(), event_type.clone(), event_type];

        insn(items, Instruction::jump(GOTO, resume));
        items.push(CodeItem::Label(on_null));
        op(items, POP);
        op(items, zero_opcode(written));
        items.push(CodeItem::Label(resume));

        if self.target.stack_maps {
            let written_type = VerificationType::from_java_type(written)
                .with_context(|| format!("chain {chain} has no value"))?;
            let mut null_stack = base_stack.clone();
            null_stack.push(VerificationType::object(OBJECT_INTERNAL_NAME));
            let mut resume_stack = base_stack;
            resume_stack.push(written_type);
            body.frames.insert(on_null, Frame::new(entry_locals.to_vec(), null_stack));
            body.frames.insert(resume, Frame::new(entry_locals.to_vec(), resume_stack));
        }
        Ok(())
    }

    // =========================================================================
    // Exit
    // =========================================================================

    fn emit_exit(
        &self,
        body: &mut MethodBody,
        pool: &mut ConstantPool,
        event_slot: u16,
        returns_value: bool,
        items: &mut Vec<CodeItem>,
    ) -> Result<()> {
        if let (true, Some(field)) = (returns_value, self.record.return_field()) {
            if field.source_type.is_wide() {
                op(items, DUP2);
                insn(items, Instruction::local(ALOAD, event_slot));
                op(items, DUP_X2);
                op(items, POP);
                self.emit_conversion(pool, &field.conversion, items)?;
            } else {
                op(items, DUP);
                insn(items, Instruction::local(ALOAD, event_slot));
                op(items, SWAP);
                // Only the returned value and the event are live here.
                let event_type = VerificationType::object(&self.record.class_name);
                let locals = event_locals(event_slot, event_type.clone());
                let below = match VerificationType::from_java_type(&self.target.method_type.ret) {
                    Some(returned) => vec![returned, event_type],
                    None => vec![event_type],
                };
                self.emit_guarded_conversion(body, pool, field, &locals, below, items)?;
            }
            self.emit_put(pool, field, items)?;
        }
        self.emit_commit(pool, event_slot, items)
    }

    fn emit_commit(&self, pool: &mut ConstantPool, event_slot: u16, items: &mut Vec<CodeItem>) -> Result<()> {
        let record = &self.record.class_name;
        insn(items, Instruction::local(ALOAD, event_slot));
        invoke(pool, items, INVOKEVIRTUAL, record, "end", "()V")?;
        insn(items, Instruction::local(ALOAD, event_slot));
        invoke(pool, items, INVOKEVIRTUAL, record, "commit", "()V")
    }

    fn emit_conversion(
        &self,
        pool: &mut ConstantPool,
        conversion: &Conversion,
        items: &mut Vec<CodeItem>,
    ) -> Result<()> {
        match conversion {
            Conversion::None => {}
            Conversion::Stringify => invoke(
                pool,
                items,
                INVOKESTATIC,
                &self.config.stringify_owner,
                &self.config.stringify_method,
                TransformConfig::STRINGIFY_DESCRIPTOR,
            )?,
            Conversion::Converter(method) => {
                invoke(pool, items, INVOKESTATIC, &method.owner, &method.name, &method.descriptor)?
            }
        }
        Ok(())
    }

    /// Convert the value on top of the stack. A reference handed to a
    /// converter is checked first; null records the zero of the written
    /// type. `locals` and `below` describe the frame at the inserted
    /// branch targets.
    fn emit_guarded_conversion(
        &self,
        body: &mut MethodBody,
        pool: &mut ConstantPool,
        field: &RecordField,
        locals: &[VerificationType],
        below: Vec<VerificationType>,
        items: &mut Vec<CodeItem>,
    ) -> Result<()> {
        if !(matches!(field.conversion, Conversion::Converter(_)) && field.source_type.is_reference()) {
            return self.emit_conversion(pool, &field.conversion, items);
        }
        let (on_null, resume) = (body.new_label(), body.new_label());
        op(items, DUP);
        insn(items, Instruction::jump(IFNULL, on_null));
        self.emit_conversion(pool, &field.conversion, items)?;
        insn(items, Instruction::jump(GOTO, resume));
        items.push(CodeItem::Label(on_null));
        op(items, POP);
        op(items, zero_opcode(&field.field_type));
        items.push(CodeItem::Label(resume));

        if self.target.stack_maps {
            let source = VerificationType::from_java_type(&field.source_type)
                .with_context(|| format!("attribute {} has no value", field.name))?;
            let written = VerificationType::from_java_type(&field.field_type)
                .with_context(|| format!("attribute {} has no value", field.name))?;
            let mut null_stack = below.clone();
            null_stack.push(source);
            let mut resume_stack = below;
            resume_stack.push(written);
            body.frames.insert(on_null, Frame::new(locals.to_vec(), null_stack));
            body.frames.insert(resume, Frame::new(locals.to_vec(), resume_stack));
        }
        Ok(())
    }

    /// Store the value on top of the stack into the event below it.
    fn emit_put(&self, pool: &mut ConstantPool, field: &RecordField, items: &mut Vec<CodeItem>) -> Result<()> {
        let index = pool.add_field_ref(&self.record.class_name, &field.name, &field.field_type.descriptor())?;
        insn(items, Instruction::Field { opcode: PUTFIELD, index });
        Ok(())
    }
}

fn insn(items: &mut Vec<CodeItem>, instruction: Instruction) {
    items.push(CodeItem::Insn(instruction));
}

fn op(items: &mut Vec<CodeItem>, opcode: u8) {
    insn(items, Instruction::Simple(opcode));
}

fn invoke(
    pool: &mut ConstantPool,
    items: &mut Vec<CodeItem>,
    opcode: u8,
    owner: &str,
    name: &str,
    descriptor: &str,
) -> Result<()> {
    let index = pool.add_method_ref(owner, name, descriptor)?;
    insn(items, Instruction::Invoke { opcode, index });
    Ok(())
}

fn load_opcode(ty: &JavaType) -> u8 {
    match ty {
        JavaType::Long => LLOAD,
        JavaType::Float => FLOAD,
        JavaType::Double => DLOAD,
        JavaType::Object(_) | JavaType::Array(_) => ALOAD,
        _ => ILOAD,
    }
}

fn return_opcode(ty: &JavaType) -> u8 {
    match ty {
        JavaType::Void => RETURN,
        JavaType::Long => LRETURN,
        JavaType::Float => FRETURN,
        JavaType::Double => DRETURN,
        JavaType::Object(_) | JavaType::Array(_) => ARETURN,
        _ => IRETURN,
    }
}

/// Locals with every slot unknown except the event.
fn event_locals(event_slot: u16, event_type: VerificationType) -> Vec<VerificationType> {
    let mut frame = Frame::default();
    frame.set_local(event_slot, event_type);
    frame.locals
}

fn zero_opcode(ty: &JavaType) -> u8 {
    match ty {
        JavaType::Long => LCONST_0,
        JavaType::Float => FCONST_0,
        JavaType::Double => DCONST_0,
        JavaType::Object(_) | JavaType::Array(_) => ACONST_NULL,
        _ => ICONST_0,
    }
}
