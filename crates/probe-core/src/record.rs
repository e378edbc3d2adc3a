//! Event class generation.
//!
//! Each synthesized record becomes a small public class extending the
//! configured event base class: one public field per attribute, a no-arg
//! constructor and runtime-visible annotations carrying the event metadata.

use anyhow::{Context, Result};

use probe_agent_types::simple_name_of;
use probe_classfile::bytes::ByteWriter;
use probe_classfile::instruction::opcodes::{INVOKESPECIAL, RETURN};
use probe_classfile::{access, attribute_names, AttributeInfo, ClassFile, ConstantPool, MemberInfo};

use crate::config::TransformConfig;
use crate::synthesizer::{RecordField, SynthesizedEventRecord};

const ALOAD_0: u8 = 0x2a;
const SOURCE_FILE: &str = "SourceFile";

enum ElementValue {
    Str(String),
    Bool(bool),
    StrArray(Vec<String>),
}

struct Annotation {
    type_descriptor: String,
    elements: Vec<(&'static str, ElementValue)>,
}

impl Annotation {
    fn marker(type_descriptor: &str) -> Self {
        Self {
            type_descriptor: type_descriptor.to_string(),
            elements: Vec::new(),
        }
    }

    fn value(type_descriptor: &str, value: ElementValue) -> Self {
        Self {
            type_descriptor: type_descriptor.to_string(),
            elements: vec![("value", value)],
        }
    }
}

/// Produce the class file bytes for `record`.
pub fn generate_record_class(record: &SynthesizedEventRecord, config: &TransformConfig) -> Result<Vec<u8>> {
    let mut pool = ConstantPool::new();
    let this_class = pool.add_class(&record.class_name)?;
    let super_class = pool.add_class(&config.event_base_class)?;

    let mut fields = Vec::with_capacity(record.fields.len());
    for field in &record.fields {
        let annotations = field_annotations(field, config);
        let mut attributes = Vec::new();
        if !annotations.is_empty() {
            attributes.push(encode_annotations(&annotations, &mut pool)?);
        }
        fields.push(MemberInfo {
            access_flags: access::PUBLIC,
            name_index: pool.add_utf8(&field.name)?,
            descriptor_index: pool.add_utf8(&field.field_type.descriptor())?,
            attributes,
        });
    }

    let constructor = MemberInfo {
        access_flags: access::PUBLIC,
        name_index: pool.add_utf8("<init>")?,
        descriptor_index: pool.add_utf8("()V")?,
        attributes: vec![constructor_code(&config.event_base_class, &mut pool)?],
    };

    let mut source = ByteWriter::new();
    source.write_u16(pool.add_utf8(&format!("{}.java", simple_name_of(&record.class_name)))?);
    let attributes = vec![
        AttributeInfo {
            name_index: pool.add_utf8(SOURCE_FILE)?,
            info: source.into_bytes(),
        },
        encode_annotations(&class_annotations(record, config), &mut pool)?,
    ];

    let class = ClassFile {
        minor_version: 0,
        major_version: config.record_class_version,
        constant_pool: pool,
        access_flags: access::PUBLIC | access::SUPER,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields,
        methods: vec![constructor],
        attributes,
    };
    class
        .to_bytes()
        .with_context(|| format!("writing event class {}", record.class_name))
}

fn class_annotations(record: &SynthesizedEventRecord, config: &TransformConfig) -> Vec<Annotation> {
    let names = &config.annotations;
    let mut annotations = vec![
        Annotation::value(&names.name, ElementValue::Str(record.name.clone())),
        Annotation::value(&names.label, ElementValue::Str(record.label.clone())),
    ];
    if let Some(description) = &record.description {
        annotations.push(Annotation::value(
            &names.description,
            ElementValue::Str(description.clone()),
        ));
    }
    if let Some(path) = &record.path {
        let category: Vec<String> = path
            .split('/')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        if !category.is_empty() {
            annotations.push(Annotation::value(&names.category, ElementValue::StrArray(category)));
        }
    }
    annotations.push(Annotation::value(
        &names.stack_trace,
        ElementValue::Bool(record.record_stack_trace),
    ));
    annotations
}

fn field_annotations(field: &RecordField, config: &TransformConfig) -> Vec<Annotation> {
    let names = &config.annotations;
    let metadata = &field.metadata;
    let mut annotations = vec![Annotation::value(
        &names.label,
        ElementValue::Str(metadata.label.clone()),
    )];
    if let Some(description) = &metadata.description {
        annotations.push(Annotation::value(
            &names.description,
            ElementValue::Str(description.clone()),
        ));
    }
    if let Some(content_type) = &metadata.content_type {
        let internal = probe_agent_types::to_internal_name(content_type);
        annotations.push(Annotation::marker(&format!("L{internal};")));
    }
    if let Some(key) = &metadata.relation_key {
        annotations.push(Annotation::value(&names.relational, ElementValue::Str(key.clone())));
    }
    annotations
}

fn encode_annotations(annotations: &[Annotation], pool: &mut ConstantPool) -> Result<AttributeInfo> {
    let mut out = ByteWriter::new();
    out.write_len_u16(annotations.len(), "annotations")?;
    for annotation in annotations {
        out.write_u16(pool.add_utf8(&annotation.type_descriptor)?);
        out.write_len_u16(annotation.elements.len(), "annotation elements")?;
        for (name, value) in &annotation.elements {
            out.write_u16(pool.add_utf8(name)?);
            encode_element(value, pool, &mut out)?;
        }
    }
    Ok(AttributeInfo {
        name_index: pool.add_utf8(attribute_names::RUNTIME_VISIBLE_ANNOTATIONS)?,
        info: out.into_bytes(),
    })
}

fn encode_element(value: &ElementValue, pool: &mut ConstantPool, out: &mut ByteWriter) -> Result<()> {
    match value {
        ElementValue::Str(text) => {
            out.write_u8(b's');
            out.write_u16(pool.add_utf8(text)?);
        }
        ElementValue::Bool(flag) => {
            out.write_u8(b'Z');
            out.write_u16(pool.add_integer(i32::from(*flag))?);
        }
        ElementValue::StrArray(items) => {
            out.write_u8(b'[');
            out.write_len_u16(items.len(), "array elements")?;
            for item in items {
                encode_element(&ElementValue::Str(item.clone()), pool, out)?;
            }
        }
    }
    Ok(())
}

/// `aload_0; invokespecial <base>.<init>()V; return`
fn constructor_code(base: &str, pool: &mut ConstantPool) -> Result<AttributeInfo> {
    let init = pool.add_method_ref(base, "<init>", "()V")?;
    let code = [ALOAD_0, INVOKESPECIAL, (init >> 8) as u8, init as u8, RETURN];

    let mut out = ByteWriter::new();
    out.write_u16(1); // max_stack
    out.write_u16(1); // max_locals
    out.write_u32(code.len() as u32);
    out.write_bytes(&code);
    out.write_u16(0); // exception table
    out.write_u16(0); // attributes
    Ok(AttributeInfo {
        name_index: pool.add_utf8(attribute_names::CODE)?,
        info: out.into_bytes(),
    })
}
