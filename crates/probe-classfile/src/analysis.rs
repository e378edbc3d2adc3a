//! Operand stack depth analysis.
//!
//! Walks every reachable path of a [`MethodBody`] and checks that the stack
//! depth is the same whenever two paths meet, that exception handlers are
//! entered with exactly the thrown value, that every stack map frame agrees
//! with the computed depth and that local accesses stay within `max_locals`.
//! The result is the `max_stack` the body needs.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;

use probe_agent_types::{JavaType, MethodType};

use crate::code::{CodeItem, MethodBody};
use crate::constant_pool::ConstantPool;
use crate::instruction::opcodes::*;
use crate::instruction::{Instruction, Label};

/// Verify stack consistency and return the maximum stack depth.
pub fn verify_stack(body: &MethodBody, pool: &ConstantPool) -> Result<u16> {
    let positions: HashMap<Label, usize> = body
        .items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| match item {
            CodeItem::Label(label) => Some((*label, i)),
            CodeItem::Insn(_) => None,
        })
        .collect();
    let position = |label: Label| -> Result<usize> {
        positions
            .get(&label)
            .copied()
            .ok_or_else(|| anyhow!("label {:?} is not placed", label))
    };

    let mut depth_at: Vec<Option<u16>> = vec![None; body.items.len()];
    let mut worklist: Vec<(usize, u16)> = vec![(0, 0)];
    for handler in &body.exception_table {
        position(handler.start)?;
        position(handler.end)?;
        worklist.push((position(handler.handler)?, 1));
    }

    let mut max_depth = 0u16;
    while let Some((start, entry_depth)) = worklist.pop() {
        let mut index = start;
        let mut depth = entry_depth;
        loop {
            let item = body
                .items
                .get(index)
                .ok_or_else(|| anyhow!("execution falls off the end of the code"))?;
            match depth_at[index] {
                Some(known) if known == depth => break,
                Some(known) => bail!(
                    "stack depth mismatch at item {}: {} vs {}",
                    index,
                    known,
                    depth
                ),
                None => depth_at[index] = Some(depth),
            }
            max_depth = max_depth.max(depth);

            match item {
                CodeItem::Label(label) => {
                    if let Some(frame) = body.frames.get(label) {
                        if frame.stack_slots() != depth {
                            bail!(
                                "frame at {:?} has {} stack slot(s), flow has {}",
                                label,
                                frame.stack_slots(),
                                depth
                            );
                        }
                        if frame.local_slots() > body.max_locals {
                            bail!(
                                "frame at {:?} has {} local slot(s), max_locals is {}",
                                label,
                                frame.local_slots(),
                                body.max_locals
                            );
                        }
                    }
                }
                CodeItem::Insn(insn) => {
                    check_locals(insn, body.max_locals)?;
                    let (pops, pushes) = stack_effect(insn, pool)
                        .with_context(|| format!("stack effect of {:?}", insn))?;
                    if depth < pops {
                        bail!("stack underflow at item {} ({:?})", index, insn);
                    }
                    depth = depth - pops + pushes;
                    max_depth = max_depth.max(depth);

                    let is_subroutine_call = matches!(insn.opcode(), JSR | JSR_W);
                    for target in insn.targets() {
                        let target_depth = if is_subroutine_call { depth + 1 } else { depth };
                        max_depth = max_depth.max(target_depth);
                        worklist.push((position(target)?, target_depth));
                    }
                    if !insn.falls_through() {
                        break;
                    }
                }
            }
            index += 1;
        }
    }
    Ok(max_depth)
}

fn check_locals(insn: &Instruction, max_locals: u16) -> Result<()> {
    let (index, width) = match insn {
        Instruction::Local { opcode, index } => {
            let width = match *opcode {
                LLOAD | DLOAD | LSTORE | DSTORE => 2,
                _ => 1,
            };
            (*index as u32, width)
        }
        Instruction::Iinc { index, .. } => (*index as u32, 1),
        _ => return Ok(()),
    };
    if index + width > max_locals as u32 {
        bail!("local {} out of bounds (max_locals {})", index, max_locals);
    }
    Ok(())
}

/// Words popped and pushed by `insn`.
pub fn stack_effect(insn: &Instruction, pool: &ConstantPool) -> Result<(u16, u16)> {
    Ok(match insn {
        Instruction::Simple(op) => simple_effect(*op)?,
        Instruction::Bipush(_) | Instruction::Sipush(_) | Instruction::Ldc(_) => (0, 1),
        Instruction::Ldc2(_) => (0, 2),
        Instruction::Local { opcode, .. } => match *opcode {
            ILOAD | FLOAD | ALOAD => (0, 1),
            LLOAD | DLOAD => (0, 2),
            ISTORE | FSTORE | ASTORE => (1, 0),
            LSTORE | DSTORE => (2, 0),
            _ => (0, 0),
        },
        Instruction::Iinc { .. } => (0, 0),
        Instruction::Branch { opcode, .. } => match *opcode {
            0x99..=0x9e | IFNULL | IFNONNULL => (1, 0),
            0x9f..=IF_ACMPNE => (2, 0),
            _ => (0, 0),
        },
        Instruction::BranchWide { .. } => (0, 0),
        Instruction::TableSwitch { .. } | Instruction::LookupSwitch { .. } => (1, 0),
        Instruction::Field { opcode, index } => {
            let member = pool.member_ref(*index)?;
            let size = JavaType::parse(member.descriptor)?.slot_size();
            match *opcode {
                GETSTATIC => (0, size),
                PUTSTATIC => (size, 0),
                GETFIELD => (1, size),
                _ => (1 + size, 0),
            }
        }
        Instruction::Invoke { opcode, index } => {
            let member = pool.member_ref(*index)?;
            let method = MethodType::parse(member.descriptor)?;
            let receiver = u16::from(*opcode != INVOKESTATIC);
            (method.arg_slots(true) + receiver, method.ret.slot_size())
        }
        Instruction::InvokeInterface { index, .. } => {
            let member = pool.member_ref(*index)?;
            let method = MethodType::parse(member.descriptor)?;
            (method.arg_slots(true) + 1, method.ret.slot_size())
        }
        Instruction::InvokeDynamic { index } => {
            let method = MethodType::parse(pool.dynamic_descriptor(*index)?)?;
            (method.arg_slots(true), method.ret.slot_size())
        }
        Instruction::Type { opcode, .. } => {
            if *opcode == NEW {
                (0, 1)
            } else {
                (1, 1)
            }
        }
        Instruction::NewArray { .. } => (1, 1),
        Instruction::MultiANewArray { dimensions, .. } => (*dimensions as u16, 1),
    })
}

fn simple_effect(op: u8) -> Result<(u16, u16)> {
    Ok(match op {
        NOP => (0, 0),
        ACONST_NULL..=0x08 | FCONST_0..=0x0d => (0, 1),
        LCONST_0 | 0x0a | DCONST_0 | 0x0f => (0, 2),
        // xaload
        0x2e | 0x30 | 0x32..=0x35 => (2, 1),
        0x2f | 0x31 => (2, 2),
        // xastore
        0x4f | 0x51 | 0x53..=0x56 => (3, 0),
        0x50 | 0x52 => (4, 0),
        POP => (1, 0),
        POP2 => (2, 0),
        DUP => (1, 2),
        DUP_X1 => (2, 3),
        DUP_X2 => (3, 4),
        DUP2 => (2, 4),
        DUP2_X1 => (3, 5),
        DUP2_X2 => (4, 6),
        SWAP => (2, 2),
        // add, sub, mul, div, rem in i/l/f/d order
        0x60..=0x73 => {
            if op % 2 == 0 {
                (2, 1)
            } else {
                (4, 2)
            }
        }
        0x74 | 0x76 => (1, 1),
        0x75 | 0x77 => (2, 2),
        // shifts: int shifts, long shifted by int
        0x78 | 0x7a | 0x7c => (2, 1),
        0x79 | 0x7b | 0x7d => (3, 2),
        // and, or, xor
        0x7e | 0x80 | 0x82 => (2, 1),
        0x7f | 0x81 | 0x83 => (4, 2),
        // conversions
        0x85 | 0x87 | 0x8c | 0x8d => (1, 2),
        0x86 | 0x8b | 0x91..=0x93 => (1, 1),
        0x88 | 0x89 | 0x8e | 0x90 => (2, 1),
        0x8a | 0x8f => (2, 2),
        // comparisons
        0x94 | 0x97 | 0x98 => (4, 1),
        0x95 | 0x96 => (2, 1),
        IRETURN | FRETURN | ARETURN => (1, 0),
        LRETURN | DRETURN => (2, 0),
        RETURN => (0, 0),
        ARRAYLENGTH => (1, 1),
        ATHROW | MONITORENTER | MONITOREXIT => (1, 0),
        other => bail!("opcode 0x{:02x} is not a simple instruction", other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::ExceptionHandler;
    use crate::stack_map::{Frame, VerificationType};
    use std::collections::BTreeMap;

    fn body(items: Vec<CodeItem>, max_locals: u16) -> MethodBody {
        let mut body = empty_body();
        body.items = items;
        body.max_locals = max_locals;
        body
    }

    fn empty_body() -> MethodBody {
        // Decode the smallest valid body (`return`) and replace its items.
        let pool = ConstantPool::new();
        let info = [0, 0, 0, 0, 0, 0, 0, 1, RETURN, 0, 0, 0, 0];
        let ctx = crate::code::MethodContext {
            class_name: "A",
            method_name: "m",
            descriptor: "()V",
            is_static: true,
        };
        let mut body = MethodBody::decode(&info, &pool, ctx).unwrap();
        body.frames = BTreeMap::new();
        body
    }

    fn insn(i: Instruction) -> CodeItem {
        CodeItem::Insn(i)
    }

    #[test]
    fn test_straight_line_max_stack() {
        let items = vec![
            CodeItem::Label(Label(0)),
            insn(Instruction::Simple(LCONST_0)),
            insn(Instruction::Simple(DUP2)),
            insn(Instruction::Simple(0x61)), // ladd
            insn(Instruction::Simple(LRETURN)),
        ];
        let max = verify_stack(&body(items, 0), &ConstantPool::new()).unwrap();
        assert_eq!(max, 4);
    }

    #[test]
    fn test_merge_with_different_depths_fails() {
        let join = Label(100);
        let items = vec![
            CodeItem::Label(Label(0)),
            insn(Instruction::Simple(ICONST_0)),
            insn(Instruction::jump(IFEQ, join)),
            insn(Instruction::Simple(ICONST_0)),
            CodeItem::Label(join),
            insn(Instruction::Simple(RETURN)),
        ];
        let err = verify_stack(&body(items, 0), &ConstantPool::new()).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn test_frame_stack_must_match_flow() {
        let target = Label(100);
        let items = vec![
            CodeItem::Label(Label(0)),
            insn(Instruction::Simple(ACONST_NULL)),
            CodeItem::Label(target),
            insn(Instruction::Simple(ARETURN)),
        ];
        let mut b = body(items, 0);
        b.frames.insert(target, Frame::new(vec![], vec![]));
        assert!(verify_stack(&b, &ConstantPool::new()).is_err());

        b.frames
            .insert(target, Frame::new(vec![], vec![VerificationType::Null]));
        assert_eq!(verify_stack(&b, &ConstantPool::new()).unwrap(), 1);
    }

    #[test]
    fn test_handler_entered_with_one_word() {
        let (start, end, handler) = (Label(0), Label(1), Label(2));
        let items = vec![
            CodeItem::Label(start),
            insn(Instruction::Simple(RETURN)),
            CodeItem::Label(end),
            CodeItem::Label(handler),
            insn(Instruction::Simple(ATHROW)),
        ];
        let mut b = body(items, 0);
        b.exception_table.push(ExceptionHandler {
            start,
            end,
            handler,
            catch_type: 0,
        });
        assert_eq!(verify_stack(&b, &ConstantPool::new()).unwrap(), 1);
    }

    #[test]
    fn test_local_out_of_bounds() {
        let items = vec![
            CodeItem::Label(Label(0)),
            insn(Instruction::local(LLOAD, 1)),
            insn(Instruction::Simple(LRETURN)),
        ];
        assert!(verify_stack(&body(items.clone(), 2), &ConstantPool::new()).is_err());
        assert!(verify_stack(&body(items, 3), &ConstantPool::new()).is_ok());
    }

    #[test]
    fn test_invoke_effect_uses_descriptor() {
        let mut pool = ConstantPool::new();
        let index = pool.add_method_ref("A", "m", "(JI)D").unwrap();
        let virtual_call = Instruction::Invoke {
            opcode: INVOKEVIRTUAL,
            index,
        };
        assert_eq!(stack_effect(&virtual_call, &pool).unwrap(), (4, 2));
        let static_call = Instruction::Invoke {
            opcode: INVOKESTATIC,
            index,
        };
        assert_eq!(stack_effect(&static_call, &pool).unwrap(), (3, 2));
    }

    #[test]
    fn test_fall_off_end_is_rejected() {
        let items = vec![CodeItem::Label(Label(0)), insn(Instruction::Simple(NOP))];
        assert!(verify_stack(&body(items, 0), &ConstantPool::new()).is_err());
    }
}
