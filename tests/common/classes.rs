//! Class files for tests.
//!
//! [`ClassBuilder`] assembles a class from fields and methods whose bodies are
//! raw bytecode. Method bodies must not reference the constant pool; probes
//! only need loads, arithmetic, returns and throws.

use probe_classfile::bytes::ByteWriter;
use probe_classfile::{access, attribute_names, AttributeInfo, ClassFile, ConstantPool, MemberInfo};
use probe_resolver::ClassInfo;

struct FieldSpec {
    access_flags: u16,
    name: String,
    descriptor: String,
}

struct MethodSpec {
    access_flags: u16,
    name: String,
    descriptor: String,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
}

pub struct ClassBuilder {
    name: String,
    super_name: String,
    major_version: u16,
    fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
}

#[allow(dead_code)]
impl ClassBuilder {
    /// A public class in internal form, extending `java/lang/Object`, with
    /// class file version 52 (stack maps required).
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            super_name: "java/lang/Object".to_string(),
            major_version: 52,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn extends(mut self, super_name: &str) -> Self {
        self.super_name = super_name.to_string();
        self
    }

    pub fn version(mut self, major_version: u16) -> Self {
        self.major_version = major_version;
        self
    }

    pub fn field(mut self, access_flags: u16, name: &str, descriptor: &str) -> Self {
        self.fields.push(FieldSpec {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        });
        self
    }

    pub fn method(
        mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
    ) -> Self {
        self.methods.push(MethodSpec {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            max_stack,
            max_locals,
            code: code.to_vec(),
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class(&self.name).unwrap();
        let super_class = pool.add_class(&self.super_name).unwrap();

        let fields = self
            .fields
            .iter()
            .map(|f| MemberInfo {
                access_flags: f.access_flags,
                name_index: pool.add_utf8(&f.name).unwrap(),
                descriptor_index: pool.add_utf8(&f.descriptor).unwrap(),
                attributes: Vec::new(),
            })
            .collect();

        let methods = self
            .methods
            .iter()
            .map(|m| {
                let mut attributes = Vec::new();
                if m.access_flags & (access::ABSTRACT | access::NATIVE) == 0 {
                    let mut code = ByteWriter::new();
                    code.write_u16(m.max_stack);
                    code.write_u16(m.max_locals);
                    code.write_u32(m.code.len() as u32);
                    code.write_bytes(&m.code);
                    code.write_u16(0);
                    code.write_u16(0);
                    attributes.push(AttributeInfo {
                        name_index: pool.add_utf8(attribute_names::CODE).unwrap(),
                        info: code.into_bytes(),
                    });
                }
                MemberInfo {
                    access_flags: m.access_flags,
                    name_index: pool.add_utf8(&m.name).unwrap(),
                    descriptor_index: pool.add_utf8(&m.descriptor).unwrap(),
                    attributes,
                }
            })
            .collect();

        ClassFile {
            minor_version: 0,
            major_version: self.major_version,
            constant_pool: pool,
            access_flags: access::PUBLIC | access::SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields,
            methods,
            attributes: Vec::new(),
        }
        .to_bytes()
        .unwrap()
    }

    /// Hierarchy entry for the built class.
    pub fn class_info(&self) -> ClassInfo {
        ClassInfo::from_class_file(&ClassFile::parse(&self.build()).unwrap()).unwrap()
    }
}
