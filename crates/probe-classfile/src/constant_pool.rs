//! Constant pool model.
//!
//! Entries keep their on-disk indices. Long and double constants take two
//! slots; the second one is stored as [`Constant::Unusable`] so that indices
//! stay aligned with the class file. New entries are appended through the
//! `add_*` helpers, which return the index of an existing equal entry when
//! there is one.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;

use crate::bytes::{ByteReader, ByteWriter};

// Tag values from the class-file format.
const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    /// Raw IEEE bits, so that entries can be compared and hashed
    Float(u32),
    Long(i64),
    /// Raw IEEE bits
    Double(u64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    FieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    MethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module {
        name_index: u16,
    },
    Package {
        name_index: u16,
    },
    /// Slot 0 and the upper half of long/double entries
    Unusable,
}

impl Constant {
    fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// A resolved field or method reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub owner: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    lookup: HashMap<Constant, u16>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
            lookup: HashMap::new(),
        }
    }

    /// The `constant_pool_count` value: number of slots including slot 0.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: u16) -> Result<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => {
                Err(anyhow!("invalid constant pool index {}", index))
            }
            Some(entry) => Ok(entry),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Utf8(s) => Ok(s),
            other => Err(anyhow!("constant {} is not Utf8: {:?}", index, other)),
        }
    }

    /// Internal name of a `CONSTANT_Class` entry.
    pub fn class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            other => Err(anyhow!("constant {} is not a Class: {:?}", index, other)),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            other => Err(anyhow!("constant {} is not NameAndType: {:?}", index, other)),
        }
    }

    /// Resolve a Fieldref, Methodref or InterfaceMethodref.
    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>> {
        match self.get(index)? {
            Constant::FieldRef {
                class_index,
                name_and_type_index,
            }
            | Constant::MethodRef {
                class_index,
                name_and_type_index,
            }
            | Constant::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => {
                let owner = self.class_name(*class_index)?;
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok(MemberRef {
                    owner,
                    name,
                    descriptor,
                })
            }
            other => Err(anyhow!("constant {} is not a member ref: {:?}", index, other)),
        }
    }

    /// Descriptor of an InvokeDynamic or Dynamic call site.
    pub fn dynamic_descriptor(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::InvokeDynamic {
                name_and_type_index,
                ..
            }
            | Constant::Dynamic {
                name_and_type_index,
                ..
            } => Ok(self.name_and_type(*name_and_type_index)?.1),
            other => Err(anyhow!("constant {} is not dynamic: {:?}", index, other)),
        }
    }

    // =========================================================================
    // Appending
    // =========================================================================

    /// Append `constant`, or return the index of an equal existing entry.
    pub fn add(&mut self, constant: Constant) -> Result<u16> {
        if let Some(&index) = self.lookup.get(&constant) {
            return Ok(index);
        }
        let width = if constant.is_wide() { 2 } else { 1 };
        let index = self.entries.len();
        if index + width > u16::MAX as usize {
            bail!("constant pool overflow ({} entries)", index);
        }
        let index = index as u16;
        self.lookup.insert(constant.clone(), index);
        self.entries.push(constant);
        if width == 2 {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    pub fn add_utf8(&mut self, value: &str) -> Result<u16> {
        self.add(Constant::Utf8(value.to_string()))
    }

    pub fn add_class(&mut self, internal_name: &str) -> Result<u16> {
        let name_index = self.add_utf8(internal_name)?;
        self.add(Constant::Class { name_index })
    }

    pub fn add_string(&mut self, value: &str) -> Result<u16> {
        let string_index = self.add_utf8(value)?;
        self.add(Constant::String { string_index })
    }

    pub fn add_integer(&mut self, value: i32) -> Result<u16> {
        self.add(Constant::Integer(value))
    }

    pub fn add_long(&mut self, value: i64) -> Result<u16> {
        self.add(Constant::Long(value))
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.add(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn add_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::FieldRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::MethodRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_interface_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::InterfaceMethodRef {
            class_index,
            name_and_type_index,
        })
    }

    // =========================================================================
    // Codec
    // =========================================================================

    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let count = reader.read_u16()? as usize;
        let mut pool = Self::new();
        while pool.entries.len() < count {
            let index = pool.entries.len();
            let constant = parse_constant(reader)
                .with_context(|| format!("constant pool entry {}", index))?;
            let wide = constant.is_wide();
            // Keep the first index for duplicates so lookups match javac output.
            pool.lookup.entry(constant.clone()).or_insert(index as u16);
            pool.entries.push(constant);
            if wide {
                pool.entries.push(Constant::Unusable);
            }
        }
        if pool.entries.len() != count {
            bail!("wide constant overflows constant_pool_count {}", count);
        }
        Ok(pool)
    }

    pub fn write(&self, out: &mut ByteWriter) -> Result<()> {
        out.write_len_u16(self.entries.len(), "constant pool entries")?;
        for entry in &self.entries[1..] {
            write_constant(entry, out)?;
        }
        Ok(())
    }
}

fn parse_constant(reader: &mut ByteReader<'_>) -> Result<Constant> {
    let tag = reader.read_u8()?;
    let constant = match tag {
        TAG_UTF8 => {
            let len = reader.read_u16()? as usize;
            Constant::Utf8(decode_modified_utf8(reader.read_bytes(len)?))
        }
        TAG_INTEGER => Constant::Integer(reader.read_i32()?),
        TAG_FLOAT => Constant::Float(reader.read_u32()?),
        TAG_LONG => Constant::Long(reader.read_u64()? as i64),
        TAG_DOUBLE => Constant::Double(reader.read_u64()?),
        TAG_CLASS => Constant::Class {
            name_index: reader.read_u16()?,
        },
        TAG_STRING => Constant::String {
            string_index: reader.read_u16()?,
        },
        TAG_FIELDREF => Constant::FieldRef {
            class_index: reader.read_u16()?,
            name_and_type_index: reader.read_u16()?,
        },
        TAG_METHODREF => Constant::MethodRef {
            class_index: reader.read_u16()?,
            name_and_type_index: reader.read_u16()?,
        },
        TAG_INTERFACE_METHODREF => Constant::InterfaceMethodRef {
            class_index: reader.read_u16()?,
            name_and_type_index: reader.read_u16()?,
        },
        TAG_NAME_AND_TYPE => Constant::NameAndType {
            name_index: reader.read_u16()?,
            descriptor_index: reader.read_u16()?,
        },
        TAG_METHOD_HANDLE => Constant::MethodHandle {
            reference_kind: reader.read_u8()?,
            reference_index: reader.read_u16()?,
        },
        TAG_METHOD_TYPE => Constant::MethodType {
            descriptor_index: reader.read_u16()?,
        },
        TAG_DYNAMIC => Constant::Dynamic {
            bootstrap_method_attr_index: reader.read_u16()?,
            name_and_type_index: reader.read_u16()?,
        },
        TAG_INVOKE_DYNAMIC => Constant::InvokeDynamic {
            bootstrap_method_attr_index: reader.read_u16()?,
            name_and_type_index: reader.read_u16()?,
        },
        TAG_MODULE => Constant::Module {
            name_index: reader.read_u16()?,
        },
        TAG_PACKAGE => Constant::Package {
            name_index: reader.read_u16()?,
        },
        other => bail!("unknown constant pool tag {}", other),
    };
    Ok(constant)
}

fn write_constant(constant: &Constant, out: &mut ByteWriter) -> Result<()> {
    match constant {
        Constant::Utf8(s) => {
            let bytes = encode_modified_utf8(s);
            out.write_u8(TAG_UTF8);
            out.write_len_u16(bytes.len(), "bytes in Utf8 constant")?;
            out.write_bytes(&bytes);
        }
        Constant::Integer(v) => {
            out.write_u8(TAG_INTEGER);
            out.write_i32(*v);
        }
        Constant::Float(bits) => {
            out.write_u8(TAG_FLOAT);
            out.write_u32(*bits);
        }
        Constant::Long(v) => {
            out.write_u8(TAG_LONG);
            out.write_u64(*v as u64);
        }
        Constant::Double(bits) => {
            out.write_u8(TAG_DOUBLE);
            out.write_u64(*bits);
        }
        Constant::Class { name_index } => {
            out.write_u8(TAG_CLASS);
            out.write_u16(*name_index);
        }
        Constant::String { string_index } => {
            out.write_u8(TAG_STRING);
            out.write_u16(*string_index);
        }
        Constant::FieldRef {
            class_index,
            name_and_type_index,
        } => {
            out.write_u8(TAG_FIELDREF);
            out.write_u16(*class_index);
            out.write_u16(*name_and_type_index);
        }
        Constant::MethodRef {
            class_index,
            name_and_type_index,
        } => {
            out.write_u8(TAG_METHODREF);
            out.write_u16(*class_index);
            out.write_u16(*name_and_type_index);
        }
        Constant::InterfaceMethodRef {
            class_index,
            name_and_type_index,
        } => {
            out.write_u8(TAG_INTERFACE_METHODREF);
            out.write_u16(*class_index);
            out.write_u16(*name_and_type_index);
        }
        Constant::NameAndType {
            name_index,
            descriptor_index,
        } => {
            out.write_u8(TAG_NAME_AND_TYPE);
            out.write_u16(*name_index);
            out.write_u16(*descriptor_index);
        }
        Constant::MethodHandle {
            reference_kind,
            reference_index,
        } => {
            out.write_u8(TAG_METHOD_HANDLE);
            out.write_u8(*reference_kind);
            out.write_u16(*reference_index);
        }
        Constant::MethodType { descriptor_index } => {
            out.write_u8(TAG_METHOD_TYPE);
            out.write_u16(*descriptor_index);
        }
        Constant::Dynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        } => {
            out.write_u8(TAG_DYNAMIC);
            out.write_u16(*bootstrap_method_attr_index);
            out.write_u16(*name_and_type_index);
        }
        Constant::InvokeDynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        } => {
            out.write_u8(TAG_INVOKE_DYNAMIC);
            out.write_u16(*bootstrap_method_attr_index);
            out.write_u16(*name_and_type_index);
        }
        Constant::Module { name_index } => {
            out.write_u8(TAG_MODULE);
            out.write_u16(*name_index);
        }
        Constant::Package { name_index } => {
            out.write_u8(TAG_PACKAGE);
            out.write_u16(*name_index);
        }
        // Upper halves of wide entries are implicit on disk.
        Constant::Unusable => {}
    }
    Ok(())
}

// =============================================================================
// Modified UTF-8
// =============================================================================

/// Decode the class-file flavour of UTF-8: NUL is two bytes and supplementary
/// characters are surrogate pairs of three bytes each. Unpaired surrogates are
/// replaced.
pub fn decode_modified_utf8(bytes: &[u8]) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 && i + 1 < bytes.len() {
            units.push((((b & 0x1F) as u16) << 6) | (bytes[i + 1] & 0x3F) as u16);
            i += 2;
        } else if b & 0xF0 == 0xE0 && i + 2 < bytes.len() {
            units.push(
                (((b & 0x0F) as u16) << 12)
                    | (((bytes[i + 1] & 0x3F) as u16) << 6)
                    | (bytes[i + 2] & 0x3F) as u16,
            );
            i += 3;
        } else {
            units.push(0xFFFD);
            i += 1;
        }
    }
    String::from_utf16_lossy(&units)
}

pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_deduplicates_entries() {
        let mut pool = ConstantPool::new();
        let a = pool.add_class("com/x/Foo").unwrap();
        let b = pool.add_class("com/x/Foo").unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.class_name(a).unwrap(), "com/x/Foo");

        let m1 = pool.add_method_ref("com/x/Foo", "bar", "()V").unwrap();
        let m2 = pool.add_method_ref("com/x/Foo", "bar", "()V").unwrap();
        assert_eq!(m1, m2);
        let member = pool.member_ref(m1).unwrap();
        assert_eq!(member.owner, "com/x/Foo");
        assert_eq!(member.name, "bar");
        assert_eq!(member.descriptor, "()V");
    }

    #[test]
    fn test_wide_constants_take_two_slots() {
        let mut pool = ConstantPool::new();
        let long_index = pool.add_long(42).unwrap();
        let next = pool.add_utf8("after").unwrap();
        assert_eq!(next, long_index + 2);
        assert!(pool.get(long_index + 1).is_err());
        assert!(pool.get(0).is_err());
    }

    #[test]
    fn test_parse_and_write_preserve_layout() {
        let mut pool = ConstantPool::new();
        pool.add_string("hello").unwrap();
        pool.add(Constant::Double(1.5f64.to_bits())).unwrap();
        pool.add_field_ref("A", "f", "I").unwrap();

        let mut out = ByteWriter::new();
        pool.write(&mut out).unwrap();
        let bytes = out.into_bytes();

        let parsed = ConstantPool::parse(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(parsed.count(), pool.count());
        assert_eq!(parsed.entries, pool.entries);
    }

    #[test]
    fn test_modified_utf8_special_cases() {
        let text = "a\0\u{e9}\u{1F600}";
        let encoded = encode_modified_utf8(text);
        // NUL is never a single zero byte; the emoji is two 3-byte surrogates.
        assert!(!encoded.contains(&0));
        assert_eq!(encoded.len(), 1 + 2 + 2 + 6);
        assert_eq!(decode_modified_utf8(&encoded), text);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let bytes = [0x00, 0x02, 0x63];
        let err = ConstantPool::parse(&mut ByteReader::new(&bytes)).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown constant pool tag"));
    }
}
