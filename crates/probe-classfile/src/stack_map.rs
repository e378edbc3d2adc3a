//! StackMapTable codec.
//!
//! Compressed frames (`same`, `chop`, `append`, ...) are expanded into explicit
//! [`Frame`]s on decode so that callers can edit locals freely. Frames are
//! always written back as `full_frame` entries.

use anyhow::{anyhow, bail, Result};

use probe_agent_types::{JavaType, MethodType};

use crate::bytes::{ByteReader, ByteWriter};
use crate::constant_pool::ConstantPool;
use crate::instruction::Label;

const ITEM_TOP: u8 = 0;
const ITEM_INTEGER: u8 = 1;
const ITEM_FLOAT: u8 = 2;
const ITEM_DOUBLE: u8 = 3;
const ITEM_LONG: u8 = 4;
const ITEM_NULL: u8 = 5;
const ITEM_UNINITIALIZED_THIS: u8 = 6;
const ITEM_OBJECT: u8 = 7;
const ITEM_UNINITIALIZED: u8 = 8;

const SAME_LOCALS_1_STACK_ITEM_EXTENDED: u8 = 247;
const SAME_FRAME_EXTENDED: u8 = 251;
const FULL_FRAME: u8 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Class or array type by internal name
    Object(String),
    /// Result of the `new` instruction at the label
    Uninitialized(Label),
}

impl VerificationType {
    pub fn from_java_type(ty: &JavaType) -> Option<Self> {
        match ty {
            JavaType::Void => None,
            JavaType::Long => Some(Self::Long),
            JavaType::Double => Some(Self::Double),
            JavaType::Float => Some(Self::Float),
            JavaType::Object(_) | JavaType::Array(_) => {
                ty.internal_name().map(VerificationType::Object)
            }
            _ => Some(Self::Integer),
        }
    }

    pub fn object(internal_name: &str) -> Self {
        VerificationType::Object(internal_name.to_string())
    }

    /// Local or stack slots taken by a value of this type.
    pub fn slot_size(&self) -> u16 {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }
}

/// An explicit frame: every local and every stack entry. Long and double take
/// one entry here and two slots at run time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub locals: Vec<VerificationType>,
    pub stack: Vec<VerificationType>,
}

impl Frame {
    pub fn new(locals: Vec<VerificationType>, stack: Vec<VerificationType>) -> Self {
        Self { locals, stack }
    }

    pub fn local_slots(&self) -> u16 {
        self.locals.iter().map(VerificationType::slot_size).sum()
    }

    pub fn stack_slots(&self) -> u16 {
        self.stack.iter().map(VerificationType::slot_size).sum()
    }

    /// Put `ty` in local `slot`, padding the gap with `Top`. Entries already at
    /// or beyond `slot` are replaced.
    pub fn set_local(&mut self, slot: u16, ty: VerificationType) {
        let mut used = 0u16;
        let mut keep = 0usize;
        for local in &self.locals {
            if used + local.slot_size() > slot {
                break;
            }
            used += local.slot_size();
            keep += 1;
        }
        self.locals.truncate(keep);
        while used < slot {
            self.locals.push(VerificationType::Top);
            used += 1;
        }
        self.locals.push(ty);
    }
}

/// Locals on method entry: the receiver (uninitialised inside constructors)
/// followed by the parameters.
pub fn initial_locals(
    class_name: &str,
    method_name: &str,
    method_type: &MethodType,
    is_static: bool,
) -> Vec<VerificationType> {
    let mut locals = Vec::with_capacity(method_type.params.len() + 1);
    if !is_static {
        if method_name == "<init>" && class_name != "java/lang/Object" {
            locals.push(VerificationType::UninitializedThis);
        } else {
            locals.push(VerificationType::object(class_name));
        }
    }
    locals.extend(
        method_type
            .params
            .iter()
            .filter_map(VerificationType::from_java_type),
    );
    locals
}

// =============================================================================
// Decoding
// =============================================================================

fn read_type(reader: &mut ByteReader<'_>, pool: &ConstantPool) -> Result<VerificationType> {
    let tag = reader.read_u8()?;
    Ok(match tag {
        ITEM_TOP => VerificationType::Top,
        ITEM_INTEGER => VerificationType::Integer,
        ITEM_FLOAT => VerificationType::Float,
        ITEM_DOUBLE => VerificationType::Double,
        ITEM_LONG => VerificationType::Long,
        ITEM_NULL => VerificationType::Null,
        ITEM_UNINITIALIZED_THIS => VerificationType::UninitializedThis,
        ITEM_OBJECT => VerificationType::object(pool.class_name(reader.read_u16()?)?),
        ITEM_UNINITIALIZED => VerificationType::Uninitialized(Label(reader.read_u16()? as u32)),
        other => bail!("unknown verification type tag {}", other),
    })
}

fn read_types(
    reader: &mut ByteReader<'_>,
    pool: &ConstantPool,
    count: usize,
) -> Result<Vec<VerificationType>> {
    (0..count).map(|_| read_type(reader, pool)).collect()
}

/// Expand a StackMapTable into `(offset, frame)` pairs in offset order.
pub fn decode_stack_map_table(
    info: &[u8],
    pool: &ConstantPool,
    initial: Vec<VerificationType>,
) -> Result<Vec<(u32, Frame)>> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u16()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut locals = initial;
    let mut offset: Option<u32> = None;

    for _ in 0..count {
        let frame_type = reader.read_u8()?;
        let (delta, stack) = match frame_type {
            0..=63 => (frame_type as u32, Vec::new()),
            64..=127 => ((frame_type - 64) as u32, vec![read_type(&mut reader, pool)?]),
            SAME_LOCALS_1_STACK_ITEM_EXTENDED => {
                let delta = reader.read_u16()? as u32;
                (delta, vec![read_type(&mut reader, pool)?])
            }
            248..=250 => {
                let delta = reader.read_u16()? as u32;
                let chop = (SAME_FRAME_EXTENDED - frame_type) as usize;
                if chop > locals.len() {
                    bail!("chop frame removes {} of {} locals", chop, locals.len());
                }
                locals.truncate(locals.len() - chop);
                (delta, Vec::new())
            }
            SAME_FRAME_EXTENDED => (reader.read_u16()? as u32, Vec::new()),
            252..=254 => {
                let delta = reader.read_u16()? as u32;
                let extra = (frame_type - SAME_FRAME_EXTENDED) as usize;
                locals.extend(read_types(&mut reader, pool, extra)?);
                (delta, Vec::new())
            }
            FULL_FRAME => {
                let delta = reader.read_u16()? as u32;
                let nlocals = reader.read_u16()? as usize;
                locals = read_types(&mut reader, pool, nlocals)?;
                let nstack = reader.read_u16()? as usize;
                (delta, read_types(&mut reader, pool, nstack)?)
            }
            other => bail!("reserved stack map frame type {}", other),
        };
        let at = match offset {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        offset = Some(at);
        frames.push((at, Frame::new(locals.clone(), stack)));
    }
    if !reader.is_empty() {
        bail!("{} trailing byte(s) in StackMapTable", reader.remaining());
    }
    Ok(frames)
}

// =============================================================================
// Encoding
// =============================================================================

fn write_type(
    ty: &VerificationType,
    out: &mut ByteWriter,
    pool: &mut ConstantPool,
    resolve: &dyn Fn(Label) -> Result<u32>,
) -> Result<()> {
    match ty {
        VerificationType::Top => out.write_u8(ITEM_TOP),
        VerificationType::Integer => out.write_u8(ITEM_INTEGER),
        VerificationType::Float => out.write_u8(ITEM_FLOAT),
        VerificationType::Double => out.write_u8(ITEM_DOUBLE),
        VerificationType::Long => out.write_u8(ITEM_LONG),
        VerificationType::Null => out.write_u8(ITEM_NULL),
        VerificationType::UninitializedThis => out.write_u8(ITEM_UNINITIALIZED_THIS),
        VerificationType::Object(name) => {
            out.write_u8(ITEM_OBJECT);
            out.write_u16(pool.add_class(name)?);
        }
        VerificationType::Uninitialized(label) => {
            let offset = resolve(*label)?;
            out.write_u8(ITEM_UNINITIALIZED);
            out.write_u16(
                u16::try_from(offset).map_err(|_| anyhow!("offset {} out of range", offset))?,
            );
        }
    }
    Ok(())
}

/// Encode frames, already sorted by strictly increasing offset, as full frames.
pub fn encode_stack_map_table(
    frames: &[(u32, &Frame)],
    pool: &mut ConstantPool,
    resolve: &dyn Fn(Label) -> Result<u32>,
) -> Result<Vec<u8>> {
    let mut out = ByteWriter::new();
    out.write_len_u16(frames.len(), "stack map frames")?;
    let mut previous: Option<u32> = None;
    for (offset, frame) in frames {
        let delta = match previous {
            None => *offset,
            Some(prev) if *offset > prev => offset - prev - 1,
            Some(prev) => bail!("stack map frame at {} does not follow {}", offset, prev),
        };
        previous = Some(*offset);

        out.write_u8(FULL_FRAME);
        out.write_u16(u16::try_from(delta).map_err(|_| anyhow!("frame delta {} too large", delta))?);
        out.write_len_u16(frame.locals.len(), "frame locals")?;
        for ty in &frame.locals {
            write_type(ty, &mut out, pool, resolve)?;
        }
        out.write_len_u16(frame.stack.len(), "frame stack entries")?;
        for ty in &frame.stack {
            write_type(ty, &mut out, pool, resolve)?;
        }
    }
    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(label: Label) -> Result<u32> {
        Ok(label.0)
    }

    #[test]
    fn test_initial_locals() {
        let mt = MethodType::parse("(JLjava/lang/String;[I)V").unwrap();
        let locals = initial_locals("com/x/Foo", "run", &mt, false);
        assert_eq!(
            locals,
            vec![
                VerificationType::object("com/x/Foo"),
                VerificationType::Long,
                VerificationType::object("java/lang/String"),
                VerificationType::object("[I"),
            ]
        );
        let ctor = initial_locals("com/x/Foo", "<init>", &MethodType::parse("()V").unwrap(), false);
        assert_eq!(ctor, vec![VerificationType::UninitializedThis]);
    }

    #[test]
    fn test_decode_compressed_frames() {
        let mut pool = ConstantPool::new();
        let string = pool.add_class("java/lang/String").unwrap();
        let mut out = ByteWriter::new();
        out.write_u16(4);
        // append_frame with one int at offset 5
        out.write_u8(252);
        out.write_u16(5);
        out.write_u8(ITEM_INTEGER);
        // same_locals_1_stack_item at offset 5 + 3 + 1
        out.write_u8(64 + 3);
        out.write_u8(ITEM_OBJECT);
        out.write_u16(string);
        // chop_frame removing one local
        out.write_u8(250);
        out.write_u16(0);
        // same_frame
        out.write_u8(2);

        let initial = vec![VerificationType::object("com/x/Foo")];
        let frames = decode_stack_map_table(&out.into_bytes(), &pool, initial.clone()).unwrap();
        let offsets: Vec<u32> = frames.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![5, 9, 10, 13]);
        assert_eq!(frames[0].1.locals.len(), 2);
        assert_eq!(frames[1].1.stack, vec![VerificationType::object("java/lang/String")]);
        assert_eq!(frames[2].1.locals, initial);
        assert!(frames[3].1.stack.is_empty());
    }

    #[test]
    fn test_full_frames_decode_back() {
        let mut pool = ConstantPool::new();
        let a = Frame::new(
            vec![VerificationType::object("com/x/Foo"), VerificationType::Double],
            vec![],
        );
        let b = Frame::new(
            vec![VerificationType::Top],
            vec![VerificationType::Uninitialized(Label(3))],
        );
        let bytes = encode_stack_map_table(&[(4, &a), (12, &b)], &mut pool, &identity).unwrap();
        let decoded = decode_stack_map_table(&bytes, &pool, vec![]).unwrap();
        assert_eq!(decoded, vec![(4, a), (12, b)]);
    }

    #[test]
    fn test_encode_rejects_unordered_frames() {
        let mut pool = ConstantPool::new();
        let frame = Frame::default();
        assert!(encode_stack_map_table(&[(4, &frame), (4, &frame)], &mut pool, &identity).is_err());
    }

    #[test]
    fn test_set_local_pads_with_top() {
        let mut frame = Frame::new(vec![VerificationType::object("A"), VerificationType::Long], vec![]);
        frame.set_local(5, VerificationType::object("Ev"));
        assert_eq!(frame.local_slots(), 6);
        assert_eq!(frame.locals[2], VerificationType::Top);
        assert_eq!(frame.locals[4], VerificationType::object("Ev"));

        let mut short = Frame::new(vec![VerificationType::Integer], vec![]);
        short.set_local(1, VerificationType::Null);
        assert_eq!(short.locals, vec![VerificationType::Integer, VerificationType::Null]);
    }
}
