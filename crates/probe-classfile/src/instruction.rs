//! JVM instructions with symbolic branch targets.
//!
//! Branches refer to [`Label`]s instead of byte offsets so that code can be
//! inserted anywhere in a method. Local variable instructions are kept in
//! their long form (`iload 2`) and the compact or `wide` encoding is picked
//! when the method is written back.

use anyhow::{anyhow, bail, Result};

use crate::bytes::{ByteReader, ByteWriter};

/// Opcode values used by the codec and by generated code.
pub mod opcodes {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_0: u8 = 0x03;
    pub const LCONST_0: u8 = 0x09;
    pub const FCONST_0: u8 = 0x0b;
    pub const DCONST_0: u8 = 0x0e;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const DLOAD: u8 = 0x18;
    pub const ALOAD: u8 = 0x19;
    pub const ILOAD_0: u8 = 0x1a;
    pub const ALOAD_3: u8 = 0x2d;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const FSTORE: u8 = 0x38;
    pub const DSTORE: u8 = 0x39;
    pub const ASTORE: u8 = 0x3a;
    pub const ISTORE_0: u8 = 0x3b;
    pub const ASTORE_3: u8 = 0x4e;
    pub const POP: u8 = 0x57;
    pub const POP2: u8 = 0x58;
    pub const DUP: u8 = 0x59;
    pub const DUP_X1: u8 = 0x5a;
    pub const DUP_X2: u8 = 0x5b;
    pub const DUP2: u8 = 0x5c;
    pub const DUP2_X1: u8 = 0x5d;
    pub const DUP2_X2: u8 = 0x5e;
    pub const SWAP: u8 = 0x5f;
    pub const IINC: u8 = 0x84;
    pub const IFEQ: u8 = 0x99;
    pub const IFNE: u8 = 0x9a;
    pub const IF_ACMPNE: u8 = 0xa6;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const RET: u8 = 0xa9;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const LRETURN: u8 = 0xad;
    pub const FRETURN: u8 = 0xae;
    pub const DRETURN: u8 = 0xaf;
    pub const ARETURN: u8 = 0xb0;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const PUTSTATIC: u8 = 0xb3;
    pub const GETFIELD: u8 = 0xb4;
    pub const PUTFIELD: u8 = 0xb5;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const INVOKEDYNAMIC: u8 = 0xba;
    pub const NEW: u8 = 0xbb;
    pub const NEWARRAY: u8 = 0xbc;
    pub const ANEWARRAY: u8 = 0xbd;
    pub const ARRAYLENGTH: u8 = 0xbe;
    pub const ATHROW: u8 = 0xbf;
    pub const CHECKCAST: u8 = 0xc0;
    pub const INSTANCEOF: u8 = 0xc1;
    pub const MONITORENTER: u8 = 0xc2;
    pub const MONITOREXIT: u8 = 0xc3;
    pub const WIDE: u8 = 0xc4;
    pub const MULTIANEWARRAY: u8 = 0xc5;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

use opcodes::*;

/// A position in a method body. Labels created while decoding use the original
/// byte offset as their id; new labels are allocated above the code length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// An instruction without operands, by opcode
    Simple(u8),
    Bipush(i8),
    Sipush(i16),
    /// Single-word constant; `ldc` or `ldc_w` depending on the index
    Ldc(u16),
    /// `ldc2_w`
    Ldc2(u16),
    /// `xload`, `xstore` or `ret`, always with the long-form opcode
    Local { opcode: u8, index: u16 },
    Iinc { index: u16, delta: i16 },
    /// `if*`, `goto`, `jsr` with a 16-bit offset
    Branch { opcode: u8, target: Label },
    /// `goto_w`, `jsr_w`
    BranchWide { opcode: u8, target: Label },
    TableSwitch {
        default: Label,
        low: i32,
        high: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
    /// `getstatic`, `putstatic`, `getfield`, `putfield`
    Field { opcode: u8, index: u16 },
    /// `invokevirtual`, `invokespecial`, `invokestatic`
    Invoke { opcode: u8, index: u16 },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic { index: u16 },
    /// `new`, `anewarray`, `checkcast`, `instanceof`
    Type { opcode: u8, index: u16 },
    NewArray { atype: u8 },
    MultiANewArray { index: u16, dimensions: u8 },
}

impl Instruction {
    pub fn local(opcode: u8, index: u16) -> Self {
        Instruction::Local { opcode, index }
    }

    pub fn jump(opcode: u8, target: Label) -> Self {
        Instruction::Branch { opcode, target }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::Simple(op) => *op,
            Instruction::Bipush(_) => BIPUSH,
            Instruction::Sipush(_) => SIPUSH,
            Instruction::Ldc(_) => LDC,
            Instruction::Ldc2(_) => LDC2_W,
            Instruction::Local { opcode, .. } => *opcode,
            Instruction::Iinc { .. } => IINC,
            Instruction::Branch { opcode, .. } | Instruction::BranchWide { opcode, .. } => *opcode,
            Instruction::TableSwitch { .. } => TABLESWITCH,
            Instruction::LookupSwitch { .. } => LOOKUPSWITCH,
            Instruction::Field { opcode, .. }
            | Instruction::Invoke { opcode, .. }
            | Instruction::Type { opcode, .. } => *opcode,
            Instruction::InvokeInterface { .. } => INVOKEINTERFACE,
            Instruction::InvokeDynamic { .. } => INVOKEDYNAMIC,
            Instruction::NewArray { .. } => NEWARRAY,
            Instruction::MultiANewArray { .. } => MULTIANEWARRAY,
        }
    }

    /// All labels this instruction may transfer control to.
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Instruction::Branch { target, .. } | Instruction::BranchWide { target, .. } => {
                vec![*target]
            }
            Instruction::TableSwitch {
                default, targets, ..
            } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
            Instruction::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, l)| *l))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Instruction::Simple(op) if (IRETURN..=RETURN).contains(op))
    }

    pub fn is_throw(&self) -> bool {
        matches!(self, Instruction::Simple(ATHROW))
    }

    /// Whether execution can continue with the next instruction.
    pub fn falls_through(&self) -> bool {
        match self {
            Instruction::Simple(op) => !((IRETURN..=RETURN).contains(op) || *op == ATHROW),
            Instruction::Branch { opcode, .. } | Instruction::BranchWide { opcode, .. } => {
                *opcode != GOTO && *opcode != GOTO_W
            }
            Instruction::Local { opcode, .. } => *opcode != RET,
            Instruction::TableSwitch { .. } | Instruction::LookupSwitch { .. } => false,
            _ => true,
        }
    }

    /// Encoded size when placed at byte `offset`.
    pub fn size_at(&self, offset: u32) -> u32 {
        match self {
            Instruction::Simple(_) => 1,
            Instruction::Bipush(_) | Instruction::NewArray { .. } => 2,
            Instruction::Sipush(_)
            | Instruction::Ldc2(_)
            | Instruction::Branch { .. }
            | Instruction::Field { .. }
            | Instruction::Invoke { .. }
            | Instruction::Type { .. } => 3,
            Instruction::Ldc(index) => {
                if *index <= u8::MAX as u16 {
                    2
                } else {
                    3
                }
            }
            Instruction::Local { opcode, index } => {
                if *opcode != RET && *index <= 3 {
                    1
                } else if *index <= u8::MAX as u16 {
                    2
                } else {
                    4
                }
            }
            Instruction::Iinc { index, delta } => {
                if *index <= u8::MAX as u16 && i8::try_from(*delta).is_ok() {
                    3
                } else {
                    6
                }
            }
            Instruction::BranchWide { .. }
            | Instruction::InvokeInterface { .. }
            | Instruction::InvokeDynamic { .. } => 5,
            Instruction::MultiANewArray { .. } => 4,
            Instruction::TableSwitch { targets, .. } => {
                1 + switch_padding(offset) + 12 + 4 * targets.len() as u32
            }
            Instruction::LookupSwitch { pairs, .. } => {
                1 + switch_padding(offset) + 8 + 8 * pairs.len() as u32
            }
        }
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Decode the instruction starting at `offset` of `code`. Branch targets
    /// become labels named after the absolute target offset.
    pub fn decode(code: &[u8], offset: u32) -> Result<(Instruction, u32)> {
        let mut reader = ByteReader::new(code);
        reader.skip(offset as usize)?;
        let op = reader.read_u8()?;
        let target = |rel: i32| -> Result<Label> {
            let abs = offset as i64 + rel as i64;
            if abs < 0 || abs >= code.len() as i64 {
                bail!("branch at {} targets {} outside code", offset, abs);
            }
            Ok(Label(abs as u32))
        };

        let insn = match op {
            0x00..=0x0f | 0x2e..=0x35 | 0x4f..=0x83 | 0x85..=0x98 | 0xac..=0xb1 | 0xbe | 0xbf
            | 0xc2 | 0xc3 => Instruction::Simple(op),
            BIPUSH => Instruction::Bipush(reader.read_i8()?),
            SIPUSH => Instruction::Sipush(reader.read_i16()?),
            LDC => Instruction::Ldc(reader.read_u8()? as u16),
            LDC_W => Instruction::Ldc(reader.read_u16()?),
            LDC2_W => Instruction::Ldc2(reader.read_u16()?),
            ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Instruction::Local {
                opcode: op,
                index: reader.read_u8()? as u16,
            },
            ILOAD_0..=ALOAD_3 => Instruction::Local {
                opcode: ILOAD + (op - ILOAD_0) / 4,
                index: ((op - ILOAD_0) % 4) as u16,
            },
            ISTORE_0..=ASTORE_3 => Instruction::Local {
                opcode: ISTORE + (op - ISTORE_0) / 4,
                index: ((op - ISTORE_0) % 4) as u16,
            },
            IINC => Instruction::Iinc {
                index: reader.read_u8()? as u16,
                delta: reader.read_i8()? as i16,
            },
            IFEQ..=JSR | IFNULL | IFNONNULL => Instruction::Branch {
                opcode: op,
                target: target(reader.read_i16()? as i32)?,
            },
            GOTO_W | JSR_W => Instruction::BranchWide {
                opcode: op,
                target: target(reader.read_i32()?)?,
            },
            TABLESWITCH => {
                reader.skip(switch_padding(offset) as usize)?;
                let default = target(reader.read_i32()?)?;
                let low = reader.read_i32()?;
                let high = reader.read_i32()?;
                if high < low {
                    bail!("tableswitch at {} has high {} < low {}", offset, high, low);
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if count * 4 > reader.remaining() {
                    bail!("tableswitch at {} overruns code", offset);
                }
                let targets = (0..count)
                    .map(|_| target(reader.read_i32()?))
                    .collect::<Result<Vec<_>>>()?;
                Instruction::TableSwitch {
                    default,
                    low,
                    high,
                    targets,
                }
            }
            LOOKUPSWITCH => {
                reader.skip(switch_padding(offset) as usize)?;
                let default = target(reader.read_i32()?)?;
                let npairs = reader.read_i32()?;
                if npairs < 0 || npairs as usize * 8 > reader.remaining() {
                    bail!("lookupswitch at {} has bad pair count {}", offset, npairs);
                }
                let pairs = (0..npairs)
                    .map(|_| Ok((reader.read_i32()?, target(reader.read_i32()?)?)))
                    .collect::<Result<Vec<_>>>()?;
                Instruction::LookupSwitch { default, pairs }
            }
            GETSTATIC..=PUTFIELD => Instruction::Field {
                opcode: op,
                index: reader.read_u16()?,
            },
            INVOKEVIRTUAL..=INVOKESTATIC => Instruction::Invoke {
                opcode: op,
                index: reader.read_u16()?,
            },
            INVOKEINTERFACE => {
                let index = reader.read_u16()?;
                let count = reader.read_u8()?;
                reader.skip(1)?;
                Instruction::InvokeInterface { index, count }
            }
            INVOKEDYNAMIC => {
                let index = reader.read_u16()?;
                reader.skip(2)?;
                Instruction::InvokeDynamic { index }
            }
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Instruction::Type {
                opcode: op,
                index: reader.read_u16()?,
            },
            NEWARRAY => Instruction::NewArray {
                atype: reader.read_u8()?,
            },
            MULTIANEWARRAY => Instruction::MultiANewArray {
                index: reader.read_u16()?,
                dimensions: reader.read_u8()?,
            },
            WIDE => {
                let inner = reader.read_u8()?;
                match inner {
                    IINC => Instruction::Iinc {
                        index: reader.read_u16()?,
                        delta: reader.read_i16()?,
                    },
                    ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Instruction::Local {
                        opcode: inner,
                        index: reader.read_u16()?,
                    },
                    other => bail!("invalid wide opcode 0x{:02x} at {}", other, offset),
                }
            }
            other => bail!("unsupported opcode 0x{:02x} at {}", other, offset),
        };

        let size = reader.position() as u32 - offset;
        Ok((insn, size))
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Encode at byte `offset`; `resolve` maps labels to final offsets.
    pub fn encode(
        &self,
        offset: u32,
        resolve: &dyn Fn(Label) -> Result<u32>,
        out: &mut ByteWriter,
    ) -> Result<()> {
        let relative = |label: Label| -> Result<i32> {
            Ok(resolve(label)? as i32 - offset as i32)
        };

        match self {
            Instruction::Simple(op) => out.write_u8(*op),
            Instruction::Bipush(v) => {
                out.write_u8(BIPUSH);
                out.write_i8(*v);
            }
            Instruction::Sipush(v) => {
                out.write_u8(SIPUSH);
                out.write_i16(*v);
            }
            Instruction::Ldc(index) => {
                if *index <= u8::MAX as u16 {
                    out.write_u8(LDC);
                    out.write_u8(*index as u8);
                } else {
                    out.write_u8(LDC_W);
                    out.write_u16(*index);
                }
            }
            Instruction::Ldc2(index) => {
                out.write_u8(LDC2_W);
                out.write_u16(*index);
            }
            Instruction::Local { opcode, index } => {
                if *opcode != RET && *index <= 3 {
                    let short = match opcode {
                        ILOAD..=ALOAD => ILOAD_0 + (opcode - ILOAD) * 4,
                        ISTORE..=ASTORE => ISTORE_0 + (opcode - ISTORE) * 4,
                        other => bail!("opcode 0x{:02x} is not a local access", other),
                    };
                    out.write_u8(short + *index as u8);
                } else if *index <= u8::MAX as u16 {
                    out.write_u8(*opcode);
                    out.write_u8(*index as u8);
                } else {
                    out.write_u8(WIDE);
                    out.write_u8(*opcode);
                    out.write_u16(*index);
                }
            }
            Instruction::Iinc { index, delta } => match i8::try_from(*delta) {
                Ok(small) if *index <= u8::MAX as u16 => {
                    out.write_u8(IINC);
                    out.write_u8(*index as u8);
                    out.write_i8(small);
                }
                _ => {
                    out.write_u8(WIDE);
                    out.write_u8(IINC);
                    out.write_u16(*index);
                    out.write_i16(*delta);
                }
            },
            Instruction::Branch { opcode, target } => {
                let rel = relative(*target)?;
                let rel = i16::try_from(rel).map_err(|_| {
                    anyhow!("branch offset {} at {} exceeds 16-bit range", rel, offset)
                })?;
                out.write_u8(*opcode);
                out.write_i16(rel);
            }
            Instruction::BranchWide { opcode, target } => {
                out.write_u8(*opcode);
                out.write_i32(relative(*target)?);
            }
            Instruction::TableSwitch {
                default,
                low,
                high,
                targets,
            } => {
                out.write_u8(TABLESWITCH);
                for _ in 0..switch_padding(offset) {
                    out.write_u8(0);
                }
                out.write_i32(relative(*default)?);
                out.write_i32(*low);
                out.write_i32(*high);
                for target in targets {
                    out.write_i32(relative(*target)?);
                }
            }
            Instruction::LookupSwitch { default, pairs } => {
                out.write_u8(LOOKUPSWITCH);
                for _ in 0..switch_padding(offset) {
                    out.write_u8(0);
                }
                out.write_i32(relative(*default)?);
                out.write_i32(pairs.len() as i32);
                for (key, target) in pairs {
                    out.write_i32(*key);
                    out.write_i32(relative(*target)?);
                }
            }
            Instruction::Field { opcode, index }
            | Instruction::Invoke { opcode, index }
            | Instruction::Type { opcode, index } => {
                out.write_u8(*opcode);
                out.write_u16(*index);
            }
            Instruction::InvokeInterface { index, count } => {
                out.write_u8(INVOKEINTERFACE);
                out.write_u16(*index);
                out.write_u8(*count);
                out.write_u8(0);
            }
            Instruction::InvokeDynamic { index } => {
                out.write_u8(INVOKEDYNAMIC);
                out.write_u16(*index);
                out.write_u16(0);
            }
            Instruction::NewArray { atype } => {
                out.write_u8(NEWARRAY);
                out.write_u8(*atype);
            }
            Instruction::MultiANewArray { index, dimensions } => {
                out.write_u8(MULTIANEWARRAY);
                out.write_u16(*index);
                out.write_u8(*dimensions);
            }
        }
        Ok(())
    }
}

/// Zero bytes between a switch opcode and its 4-byte aligned operands.
fn switch_padding(offset: u32) -> u32 {
    (4 - (offset + 1) % 4) % 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_one(insn: &Instruction, offset: u32) -> Vec<u8> {
        let mut out = ByteWriter::new();
        insn.encode(offset, &|l: Label| Ok(l.0), &mut out).unwrap();
        out.into_bytes()
    }

    #[test]
    fn test_short_and_wide_local_forms() {
        assert_eq!(encode_one(&Instruction::local(ALOAD, 0), 0), vec![0x2a]);
        assert_eq!(encode_one(&Instruction::local(ISTORE, 3), 0), vec![0x3e]);
        assert_eq!(encode_one(&Instruction::local(DLOAD, 7), 0), vec![DLOAD, 7]);
        assert_eq!(
            encode_one(&Instruction::local(ASTORE, 300), 0),
            vec![WIDE, ASTORE, 0x01, 0x2c]
        );
        assert_eq!(Instruction::local(ASTORE, 300).size_at(0), 4);
    }

    #[test]
    fn test_decode_short_forms_to_long_opcodes() {
        let code = [0x2b, 0x4c, 0xc4, 0x15, 0x01, 0x00];
        let (a, size) = Instruction::decode(&code, 0).unwrap();
        assert_eq!((a, size), (Instruction::local(ALOAD, 1), 1));
        let (b, _) = Instruction::decode(&code, 1).unwrap();
        assert_eq!(b, Instruction::local(ASTORE, 1));
        let (c, size) = Instruction::decode(&code, 2).unwrap();
        assert_eq!((c, size), (Instruction::local(ILOAD, 256), 4));
    }

    #[test]
    fn test_ldc_width_depends_on_index() {
        assert_eq!(encode_one(&Instruction::Ldc(5), 0), vec![LDC, 5]);
        assert_eq!(encode_one(&Instruction::Ldc(256), 0), vec![LDC_W, 1, 0]);
    }

    #[test]
    fn test_branch_out_of_range_is_an_error() {
        let insn = Instruction::jump(GOTO, Label(40_000));
        let mut out = ByteWriter::new();
        let err = insn.encode(0, &|l: Label| Ok(l.0), &mut out).unwrap_err();
        assert!(err.to_string().contains("16-bit"));
    }

    #[test]
    fn test_switch_padding_follows_offset() {
        let insn = Instruction::TableSwitch {
            default: Label(0),
            low: 0,
            high: 0,
            targets: vec![Label(0)],
        };
        assert_eq!(insn.size_at(0), 1 + 3 + 12 + 4);
        assert_eq!(insn.size_at(3), 1 + 12 + 4);
        let bytes = encode_one(&insn, 1);
        assert_eq!(bytes.len() as u32, insn.size_at(1));
        // Default target 0 relative to offset 1.
        assert_eq!(&bytes[3..7], &(-1i32).to_be_bytes());
    }

    #[test]
    fn test_decode_rejects_branch_outside_code() {
        let code = [GOTO, 0x00, 0x10];
        assert!(Instruction::decode(&code, 0).is_err());
    }

    #[test]
    fn test_control_flow_classification() {
        assert!(!Instruction::Simple(ATHROW).falls_through());
        assert!(Instruction::Simple(ATHROW).is_throw());
        assert!(Instruction::Simple(IRETURN).is_return());
        assert!(Instruction::jump(IFEQ, Label(4)).falls_through());
        assert!(!Instruction::jump(GOTO, Label(4)).falls_through());
        assert_eq!(Instruction::jump(IFNULL, Label(9)).targets(), vec![Label(9)]);
    }
}
