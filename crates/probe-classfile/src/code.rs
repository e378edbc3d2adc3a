//! Method bodies as editable instruction lists.
//!
//! [`MethodBody::decode`] turns a `Code` attribute into a flat list of
//! [`CodeItem`]s where every original instruction is preceded by a label named
//! after its byte offset. Exception ranges, stack map frames and debug tables
//! refer to labels, so inserting code never invalidates them.
//! [`MethodBody::encode`] lays the items out again and rebuilds every table.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use probe_agent_types::MethodType;

use crate::bytes::{ByteReader, ByteWriter};
use crate::class_file::{attribute_names, write_attributes, AttributeInfo};
use crate::constant_pool::ConstantPool;
use crate::instruction::{Instruction, Label};
use crate::stack_map::{decode_stack_map_table, encode_stack_map_table, initial_locals, Frame};

/// Largest `code_length` the class-file format allows.
const MAX_CODE_LENGTH: u32 = 65_535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeItem {
    Label(Label),
    Insn(Instruction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// Class constant of the caught type, 0 for any
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumber {
    pub start: Label,
    pub line: u16,
}

/// Entry of a LocalVariableTable or LocalVariableTypeTable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub start: Label,
    pub end: Label,
    pub name_index: u16,
    /// Descriptor (LocalVariableTable) or signature (LocalVariableTypeTable)
    pub type_index: u16,
    pub index: u16,
}

/// What the frame decoder needs to know about the enclosing method.
#[derive(Debug, Clone, Copy)]
pub struct MethodContext<'a> {
    pub class_name: &'a str,
    pub method_name: &'a str,
    pub descriptor: &'a str,
    pub is_static: bool,
}

#[derive(Debug, Clone)]
pub struct MethodBody {
    pub max_stack: u16,
    pub max_locals: u16,
    pub items: Vec<CodeItem>,
    pub exception_table: Vec<ExceptionHandler>,
    pub frames: BTreeMap<Label, Frame>,
    pub line_numbers: Vec<LineNumber>,
    pub local_variables: Vec<LocalVariable>,
    pub local_variable_types: Vec<LocalVariable>,
    /// Whether the decoded attribute carried a StackMapTable
    pub had_stack_map: bool,
    next_label: u32,
}

impl MethodBody {
    pub fn decode(info: &[u8], pool: &ConstantPool, ctx: MethodContext<'_>) -> Result<Self> {
        let mut reader = ByteReader::new(info);
        let max_stack = reader.read_u16()?;
        let max_locals = reader.read_u16()?;
        let code_length = reader.read_u32()?;
        if code_length == 0 || code_length > MAX_CODE_LENGTH {
            bail!("invalid code_length {}", code_length);
        }
        let code = reader.read_bytes(code_length as usize)?;

        let mut items = Vec::new();
        let mut starts = BTreeSet::new();
        let mut offset = 0u32;
        while offset < code_length {
            let (insn, size) =
                Instruction::decode(code, offset).with_context(|| format!("at offset {}", offset))?;
            starts.insert(offset);
            items.push(CodeItem::Label(Label(offset)));
            items.push(CodeItem::Insn(insn));
            offset += size;
        }
        items.push(CodeItem::Label(Label(code_length)));

        // Labels that may be referenced: instruction starts plus the end.
        let boundary = |offset: u32| starts.contains(&offset) || offset == code_length;
        let instruction_start = |offset: u32| -> Result<Label> {
            if starts.contains(&offset) {
                Ok(Label(offset))
            } else {
                Err(anyhow!("offset {} is not an instruction boundary", offset))
            }
        };

        for item in &items {
            if let CodeItem::Insn(insn) = item {
                for target in insn.targets() {
                    instruction_start(target.0).context("branch target")?;
                }
            }
        }

        let handler_count = reader.read_u16()?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            let start_pc = reader.read_u16()? as u32;
            let end_pc = reader.read_u16()? as u32;
            let handler_pc = reader.read_u16()? as u32;
            let catch_type = reader.read_u16()?;
            if !boundary(end_pc) || start_pc >= end_pc {
                bail!("invalid exception range {}..{}", start_pc, end_pc);
            }
            exception_table.push(ExceptionHandler {
                start: instruction_start(start_pc)?,
                end: Label(end_pc),
                handler: instruction_start(handler_pc)?,
                catch_type,
            });
        }

        let mut body = Self {
            max_stack,
            max_locals,
            items,
            exception_table,
            frames: BTreeMap::new(),
            line_numbers: Vec::new(),
            local_variables: Vec::new(),
            local_variable_types: Vec::new(),
            had_stack_map: false,
            next_label: code_length + 1,
        };

        let attribute_count = reader.read_u16()?;
        for _ in 0..attribute_count {
            let name_index = reader.read_u16()?;
            let len = reader.read_u32()? as usize;
            let data = reader.read_bytes(len)?;
            let name = pool.utf8(name_index)?;
            match name {
                attribute_names::STACK_MAP_TABLE => {
                    let method_type = MethodType::parse(ctx.descriptor)?;
                    let initial = initial_locals(
                        ctx.class_name,
                        ctx.method_name,
                        &method_type,
                        ctx.is_static,
                    );
                    for (offset, frame) in decode_stack_map_table(data, pool, initial)? {
                        body.frames.insert(instruction_start(offset)?, frame);
                    }
                    body.had_stack_map = true;
                }
                attribute_names::LINE_NUMBER_TABLE => {
                    let mut table = ByteReader::new(data);
                    for _ in 0..table.read_u16()? {
                        let start_pc = table.read_u16()? as u32;
                        let line = table.read_u16()?;
                        if starts.contains(&start_pc) {
                            body.line_numbers.push(LineNumber {
                                start: Label(start_pc),
                                line,
                            });
                        }
                    }
                }
                attribute_names::LOCAL_VARIABLE_TABLE | attribute_names::LOCAL_VARIABLE_TYPE_TABLE => {
                    let mut table = ByteReader::new(data);
                    let mut entries = Vec::new();
                    for _ in 0..table.read_u16()? {
                        let start_pc = table.read_u16()? as u32;
                        let length = table.read_u16()? as u32;
                        let name_index = table.read_u16()?;
                        let type_index = table.read_u16()?;
                        let index = table.read_u16()?;
                        if boundary(start_pc) && boundary(start_pc + length) {
                            entries.push(LocalVariable {
                                start: Label(start_pc),
                                end: Label(start_pc + length),
                                name_index,
                                type_index,
                                index,
                            });
                        }
                    }
                    if name == attribute_names::LOCAL_VARIABLE_TABLE {
                        body.local_variables = entries;
                    } else {
                        body.local_variable_types = entries;
                    }
                }
                // Type annotations carry bytecode offsets; they are not kept.
                other => debug!(attribute = other, "dropping code attribute"),
            }
        }
        if !reader.is_empty() {
            bail!("{} trailing byte(s) in Code attribute", reader.remaining());
        }
        Ok(body)
    }

    /// A fresh label not bound to any position yet.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Index in `items` where `label` is placed.
    pub fn position_of(&self, label: Label) -> Option<usize> {
        self.items
            .iter()
            .position(|item| matches!(item, CodeItem::Label(l) if *l == label))
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.items.iter().filter_map(|item| match item {
            CodeItem::Insn(insn) => Some(insn),
            CodeItem::Label(_) => None,
        })
    }

    /// Splice `items` in before position `index`.
    pub fn insert_items(&mut self, index: usize, items: Vec<CodeItem>) {
        self.items.splice(index..index, items);
    }

    /// Byte offset of every label under the current layout, plus the code length.
    pub fn layout(&self) -> Result<(HashMap<Label, u32>, u32)> {
        let mut offsets = HashMap::new();
        let mut offset = 0u32;
        for item in &self.items {
            match item {
                CodeItem::Label(label) => {
                    if offsets.insert(*label, offset).is_some() {
                        bail!("label {:?} placed twice", label);
                    }
                }
                CodeItem::Insn(insn) => offset += insn.size_at(offset),
            }
        }
        if offset == 0 || offset > MAX_CODE_LENGTH {
            bail!("method code length {} out of range", offset);
        }
        Ok((offsets, offset))
    }

    /// Encode the body as a `Code` attribute.
    pub fn encode(&self, pool: &mut ConstantPool) -> Result<AttributeInfo> {
        let (offsets, code_length) = self.layout()?;
        let resolve = |label: Label| -> Result<u32> {
            offsets
                .get(&label)
                .copied()
                .ok_or_else(|| anyhow!("unplaced label {:?}", label))
        };

        let mut code = ByteWriter::new();
        for item in &self.items {
            if let CodeItem::Insn(insn) = item {
                let offset = code.len() as u32;
                insn.encode(offset, &resolve, &mut code)
                    .with_context(|| format!("encoding {:?}", insn))?;
            }
        }

        let mut out = ByteWriter::new();
        out.write_u16(self.max_stack);
        out.write_u16(self.max_locals);
        out.write_u32(code_length);
        out.write_bytes(&code.into_bytes());

        out.write_len_u16(self.exception_table.len(), "exception handlers")?;
        for entry in &self.exception_table {
            let start = resolve(entry.start)?;
            let end = resolve(entry.end)?;
            if start >= end {
                bail!("empty exception range {}..{}", start, end);
            }
            out.write_u16(start as u16);
            out.write_u16(end as u16);
            out.write_u16(resolve(entry.handler)? as u16);
            out.write_u16(entry.catch_type);
        }

        let mut attributes = Vec::new();
        if !self.line_numbers.is_empty() {
            let mut table = ByteWriter::new();
            table.write_len_u16(self.line_numbers.len(), "line numbers")?;
            for entry in &self.line_numbers {
                table.write_u16(resolve(entry.start)? as u16);
                table.write_u16(entry.line);
            }
            attributes.push(AttributeInfo {
                name_index: pool.add_utf8(attribute_names::LINE_NUMBER_TABLE)?,
                info: table.into_bytes(),
            });
        }
        for (name, entries) in [
            (attribute_names::LOCAL_VARIABLE_TABLE, &self.local_variables),
            (attribute_names::LOCAL_VARIABLE_TYPE_TABLE, &self.local_variable_types),
        ] {
            if entries.is_empty() {
                continue;
            }
            let mut table = ByteWriter::new();
            table.write_len_u16(entries.len(), "local variables")?;
            for entry in entries {
                let start = resolve(entry.start)?;
                let end = resolve(entry.end)?;
                table.write_u16(start as u16);
                table.write_u16(end.saturating_sub(start) as u16);
                table.write_u16(entry.name_index);
                table.write_u16(entry.type_index);
                table.write_u16(entry.index);
            }
            attributes.push(AttributeInfo {
                name_index: pool.add_utf8(name)?,
                info: table.into_bytes(),
            });
        }
        if !self.frames.is_empty() {
            let mut placed: Vec<(u32, &Frame)> = Vec::with_capacity(self.frames.len());
            for (label, frame) in &self.frames {
                placed.push((resolve(*label)?, frame));
            }
            placed.sort_by_key(|(offset, _)| *offset);
            placed.dedup_by(|b, a| a.0 == b.0 && a.1 == b.1);
            let info = encode_stack_map_table(&placed, pool, &resolve)?;
            attributes.push(AttributeInfo {
                name_index: pool.add_utf8(attribute_names::STACK_MAP_TABLE)?,
                info,
            });
        }
        write_attributes(&attributes, &mut out)?;

        Ok(AttributeInfo {
            name_index: pool.add_utf8(attribute_names::CODE)?,
            info: out.into_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::opcodes::*;

    fn context() -> MethodContext<'static> {
        MethodContext {
            class_name: "com/x/Foo",
            method_name: "check",
            descriptor: "(I)I",
            is_static: true,
        }
    }

    /// `static int check(int x) { return x == 0 ? 1 : 2; }` with one frame.
    fn sample_code(pool: &mut ConstantPool) -> Vec<u8> {
        let smt = pool.add_utf8("StackMapTable").unwrap();
        let mut out = ByteWriter::new();
        out.write_u16(1);
        out.write_u16(1);
        let code = [
            0x1a, // iload_0
            IFNE, 0x00, 0x05, // ifne +5 -> 6
            0x04, // iconst_1
            IRETURN,
            0x05, // iconst_2
            IRETURN,
        ];
        out.write_u32(code.len() as u32);
        out.write_bytes(&code);
        out.write_u16(0);
        out.write_u16(1);
        out.write_u16(smt);
        // same_frame at offset 6
        out.write_u32(3);
        out.write_u16(1);
        out.write_u8(6);
        out.into_bytes()
    }

    #[test]
    fn test_decode_labels_every_instruction() {
        let mut pool = ConstantPool::new();
        let bytes = sample_code(&mut pool);
        let body = MethodBody::decode(&bytes, &pool, context()).unwrap();
        assert_eq!(body.instructions().count(), 6);
        assert!(body.position_of(Label(6)).is_some());
        assert!(body.position_of(Label(8)).is_some());
        assert!(body.frames.contains_key(&Label(6)));
        assert!(body.had_stack_map);
        assert_eq!(body.frames[&Label(6)].locals.len(), 1);
    }

    #[test]
    fn test_unchanged_body_encodes_to_same_code() {
        let mut pool = ConstantPool::new();
        let bytes = sample_code(&mut pool);
        let body = MethodBody::decode(&bytes, &pool, context()).unwrap();
        let attr = body.encode(&mut pool).unwrap();
        // Same instructions and branch offsets.
        assert_eq!(&attr.info[..16], &bytes[..16]);
    }

    #[test]
    fn test_inserted_code_moves_branches_and_frames() {
        let mut pool = ConstantPool::new();
        let bytes = sample_code(&mut pool);
        let mut body = MethodBody::decode(&bytes, &pool, context()).unwrap();
        body.insert_items(0, vec![CodeItem::Insn(Instruction::Simple(NOP))]);

        let attr = body.encode(&mut pool).unwrap();
        let reparsed = MethodBody::decode(&attr.info, &pool, context()).unwrap();
        let insns: Vec<_> = reparsed.instructions().cloned().collect();
        assert_eq!(insns[0], Instruction::Simple(NOP));
        assert_eq!(insns[2], Instruction::jump(IFNE, Label(7)));
        assert!(reparsed.frames.contains_key(&Label(7)));
    }

    #[test]
    fn test_new_labels_do_not_collide_with_offsets() {
        let mut pool = ConstantPool::new();
        let bytes = sample_code(&mut pool);
        let mut body = MethodBody::decode(&bytes, &pool, context()).unwrap();
        let label = body.new_label();
        assert!(label.0 > 8);
        assert_ne!(body.new_label(), label);
    }

    #[test]
    fn test_branch_into_instruction_is_rejected() {
        let pool = ConstantPool::new();
        let mut out = ByteWriter::new();
        out.write_u16(1);
        out.write_u16(0);
        let code = [GOTO, 0x00, 0x02, RETURN];
        out.write_u32(code.len() as u32);
        out.write_bytes(&code);
        out.write_u16(0);
        out.write_u16(0);
        let ctx = MethodContext {
            descriptor: "()V",
            ..context()
        };
        assert!(MethodBody::decode(&out.into_bytes(), &pool, ctx).is_err());
    }
}
