//! Class-file reader and writer.
//!
//! Only the structure the probe agent needs is modelled: the constant pool,
//! the class header, fields and methods. Attributes are kept as raw bytes and
//! written back unchanged unless a caller replaces them.

use anyhow::{anyhow, bail, Context, Result};

use crate::bytes::{ByteReader, ByteWriter};
use crate::constant_pool::ConstantPool;

const MAGIC: u32 = 0xCAFE_BABE;

/// Access flag bits shared by classes, fields and methods.
pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SUPER: u16 = 0x0020;
    pub const SYNCHRONIZED: u16 = 0x0020;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
    pub const SYNTHETIC: u16 = 0x1000;
    pub const ANNOTATION: u16 = 0x2000;
    pub const ENUM: u16 = 0x4000;
}

/// Attribute names the codec recognises.
pub mod attribute_names {
    pub const CODE: &str = "Code";
    pub const STACK_MAP_TABLE: &str = "StackMapTable";
    pub const LINE_NUMBER_TABLE: &str = "LineNumberTable";
    pub const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
    pub const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";
    pub const INNER_CLASSES: &str = "InnerClasses";
    pub const ENCLOSING_METHOD: &str = "EnclosingMethod";
    pub const NEST_HOST: &str = "NestHost";
    pub const RUNTIME_VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    pub name_index: u16,
    pub info: Vec<u8>,
}

/// A field or a method: both share the same on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

impl MemberInfo {
    pub fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & access::ABSTRACT != 0
    }

    pub fn is_native(&self) -> bool {
        self.access_flags & access::NATIVE != 0
    }

    pub fn name<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str> {
        pool.utf8(self.name_index)
    }

    pub fn descriptor<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str> {
        pool.utf8(self.descriptor_index)
    }
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    /// Zero for `java/lang/Object`
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<AttributeInfo>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.read_u32().context("reading magic")?;
        if magic != MAGIC {
            bail!("bad magic 0x{:08X}", magic);
        }
        let minor_version = reader.read_u16()?;
        let major_version = reader.read_u16()?;
        let constant_pool = ConstantPool::parse(&mut reader).context("reading constant pool")?;
        let access_flags = reader.read_u16()?;
        let this_class = reader.read_u16()?;
        let super_class = reader.read_u16()?;

        let interface_count = reader.read_u16()?;
        let interfaces = (0..interface_count)
            .map(|_| reader.read_u16())
            .collect::<Result<Vec<_>>>()?;

        let fields = parse_members(&mut reader).context("reading fields")?;
        let methods = parse_members(&mut reader).context("reading methods")?;
        let attributes = parse_attributes(&mut reader).context("reading class attributes")?;
        if !reader.is_empty() {
            bail!("{} trailing byte(s) after class attributes", reader.remaining());
        }

        let class = Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };
        class.this_class_name().context("resolving this_class")?;
        Ok(class)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = ByteWriter::new();
        out.write_u32(MAGIC);
        out.write_u16(self.minor_version);
        out.write_u16(self.major_version);
        self.constant_pool.write(&mut out)?;
        out.write_u16(self.access_flags);
        out.write_u16(self.this_class);
        out.write_u16(self.super_class);
        out.write_len_u16(self.interfaces.len(), "interfaces")?;
        for interface in &self.interfaces {
            out.write_u16(*interface);
        }
        write_members(&self.fields, &mut out)?;
        write_members(&self.methods, &mut out)?;
        write_attributes(&self.attributes, &mut out)?;
        Ok(out.into_bytes())
    }

    pub fn this_class_name(&self) -> Result<&str> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn super_class_name(&self) -> Result<Option<&str>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> Result<Vec<&str>> {
        self.interfaces
            .iter()
            .map(|i| self.constant_pool.class_name(*i))
            .collect()
    }

    /// Index of the method with the given name and descriptor.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods.iter().position(|m| {
            m.name(&self.constant_pool).ok() == Some(name)
                && m.descriptor(&self.constant_pool).ok() == Some(descriptor)
        })
    }

    /// Whether the class was compiled for a verifier that checks StackMapTable.
    pub fn uses_stack_maps(&self) -> bool {
        self.major_version >= 50
    }

    /// Host class from the `NestHost` attribute.
    pub fn nest_host_name(&self) -> Result<Option<&str>> {
        match self.attribute(&self.attributes, attribute_names::NEST_HOST) {
            Some(attr) => {
                let index = ByteReader::new(&attr.info).read_u16()?;
                self.constant_pool.class_name(index).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Directly enclosing class, from `InnerClasses` (member classes) or
    /// `EnclosingMethod` (local and anonymous classes).
    pub fn enclosing_class_name(&self) -> Result<Option<&str>> {
        if let Some(attr) = self.attribute(&self.attributes, attribute_names::INNER_CLASSES) {
            let mut reader = ByteReader::new(&attr.info);
            let count = reader.read_u16()?;
            for _ in 0..count {
                let inner = reader.read_u16()?;
                let outer = reader.read_u16()?;
                reader.skip(4)?;
                if inner == self.this_class && outer != 0 {
                    return self.constant_pool.class_name(outer).map(Some);
                }
            }
        }
        if let Some(attr) = self.attribute(&self.attributes, attribute_names::ENCLOSING_METHOD) {
            let index = ByteReader::new(&attr.info).read_u16()?;
            return self.constant_pool.class_name(index).map(Some);
        }
        Ok(None)
    }

    /// First attribute in `attributes` with the given name.
    pub fn attribute<'a>(
        &self,
        attributes: &'a [AttributeInfo],
        name: &str,
    ) -> Option<&'a AttributeInfo> {
        attributes
            .iter()
            .find(|a| self.constant_pool.utf8(a.name_index).ok() == Some(name))
    }

    pub fn attribute_position(&self, attributes: &[AttributeInfo], name: &str) -> Option<usize> {
        attributes
            .iter()
            .position(|a| self.constant_pool.utf8(a.name_index).ok() == Some(name))
    }

    /// `name` + `descriptor` of a member, for diagnostics.
    pub fn member_label(&self, member: &MemberInfo) -> String {
        let name = member.name(&self.constant_pool).unwrap_or("?");
        let descriptor = member.descriptor(&self.constant_pool).unwrap_or("?");
        format!("{}{}", name, descriptor)
    }

    pub fn method_code(&self, method_index: usize) -> Result<Option<&AttributeInfo>> {
        let method = self
            .methods
            .get(method_index)
            .ok_or_else(|| anyhow!("no method at index {}", method_index))?;
        Ok(self.attribute(&method.attributes, attribute_names::CODE))
    }
}

fn parse_attributes(reader: &mut ByteReader<'_>) -> Result<Vec<AttributeInfo>> {
    let count = reader.read_u16()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = reader.read_u16()?;
        let len = reader.read_u32()? as usize;
        let info = reader.read_bytes(len)?.to_vec();
        attributes.push(AttributeInfo { name_index, info });
    }
    Ok(attributes)
}

pub(crate) fn write_attributes(attributes: &[AttributeInfo], out: &mut ByteWriter) -> Result<()> {
    out.write_len_u16(attributes.len(), "attributes")?;
    for attr in attributes {
        out.write_u16(attr.name_index);
        let len = u32::try_from(attr.info.len())
            .map_err(|_| anyhow!("attribute of {} bytes is too large", attr.info.len()))?;
        out.write_u32(len);
        out.write_bytes(&attr.info);
    }
    Ok(())
}

fn parse_members(reader: &mut ByteReader<'_>) -> Result<Vec<MemberInfo>> {
    let count = reader.read_u16()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        members.push(MemberInfo {
            access_flags: reader.read_u16()?,
            name_index: reader.read_u16()?,
            descriptor_index: reader.read_u16()?,
            attributes: parse_attributes(reader)?,
        });
    }
    Ok(members)
}

fn write_members(members: &[MemberInfo], out: &mut ByteWriter) -> Result<()> {
    out.write_len_u16(members.len(), "members")?;
    for member in members {
        out.write_u16(member.access_flags);
        out.write_u16(member.name_index);
        out.write_u16(member.descriptor_index);
        write_attributes(&member.attributes, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_class() -> ClassFile {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class("com/x/Foo").unwrap();
        let super_class = pool.add_class("java/lang/Object").unwrap();
        let runnable = pool.add_class("java/lang/Runnable").unwrap();
        let name_index = pool.add_utf8("count").unwrap();
        let descriptor_index = pool.add_utf8("I").unwrap();
        ClassFile {
            minor_version: 0,
            major_version: 52,
            constant_pool: pool,
            access_flags: access::PUBLIC | access::SUPER,
            this_class,
            super_class,
            interfaces: vec![runnable],
            fields: vec![MemberInfo {
                access_flags: access::PRIVATE,
                name_index,
                descriptor_index,
                attributes: vec![],
            }],
            methods: vec![],
            attributes: vec![],
        }
    }

    #[test]
    fn test_header_names() {
        let class = minimal_class();
        assert_eq!(class.this_class_name().unwrap(), "com/x/Foo");
        assert_eq!(class.super_class_name().unwrap(), Some("java/lang/Object"));
        assert_eq!(class.interface_names().unwrap(), vec!["java/lang/Runnable"]);
        assert!(class.uses_stack_maps());
    }

    #[test]
    fn test_written_class_parses_back() {
        let class = minimal_class();
        let bytes = class.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
        let parsed = ClassFile::parse(&bytes).unwrap();
        assert_eq!(parsed.fields, class.fields);
        assert_eq!(parsed.fields[0].name(&parsed.constant_pool).unwrap(), "count");
    }

    #[test]
    fn test_rejects_bad_magic_and_trailing_bytes() {
        assert!(ClassFile::parse(&[0, 1, 2, 3]).is_err());

        let mut bytes = minimal_class().to_bytes().unwrap();
        bytes.push(0);
        let err = ClassFile::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_nest_host_and_enclosing_class() {
        let mut class = minimal_class();
        let outer = class.constant_pool.add_class("com/x/Outer").unwrap();
        let nest_host = class.constant_pool.add_utf8(attribute_names::NEST_HOST).unwrap();
        let inner_classes = class
            .constant_pool
            .add_utf8(attribute_names::INNER_CLASSES)
            .unwrap();
        class.attributes.push(AttributeInfo {
            name_index: nest_host,
            info: outer.to_be_bytes().to_vec(),
        });
        let mut info = ByteWriter::new();
        info.write_u16(1);
        info.write_u16(class.this_class);
        info.write_u16(outer);
        info.write_u16(0);
        info.write_u16(0);
        class.attributes.push(AttributeInfo {
            name_index: inner_classes,
            info: info.into_bytes(),
        });

        assert_eq!(class.nest_host_name().unwrap(), Some("com/x/Outer"));
        assert_eq!(class.enclosing_class_name().unwrap(), Some("com/x/Outer"));
    }
}
