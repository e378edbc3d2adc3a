//! Probe document parsing.
//!
//! Documents are XML. The outer structure is lenient: `config` and `event`
//! elements are found at any depth, so wrapper elements such as `events`,
//! `parameters` and `fields` are optional. A `config` block sets global
//! defaults for the events that follow it.
//!
//! Malformed XML fails the whole document. A malformed event fails only that
//! event; its error is returned in place of the descriptor.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

use probe_agent_types::{
    is_valid_class_name, to_internal_name, AttributeBinding, FieldBinding, MethodTarget,
    MethodType, ParameterBinding, ProbeConfig, ProbeDescriptor, ReturnBinding,
    DEFAULT_CLASS_PREFIX,
};

use crate::errors::ProbeError;

const EVENT: &str = "event";
const CONFIG: &str = "config";
const METHOD: &str = "method";
const PARAMETER: &str = "parameter";
const PARAMETERS: &str = "parameters";
const FIELD: &str = "field";
const FIELDS: &str = "fields";
const RETURN_VALUE: &str = "returnvalue";

const KEY_CLASS: &str = "class";
const KEY_LABEL: &str = "label";
const KEY_DESCRIPTION: &str = "description";
const KEY_PATH: &str = "path";
const KEY_STACK_TRACE: &str = "stacktrace";
const KEY_RETHROW: &str = "rethrow";
const KEY_EMIT_ON_EXCEPTION: &str = "emitonexception";
const KEY_CLASS_PREFIX: &str = "classprefix";
const KEY_ALLOW_TO_STRING: &str = "allowtostring";
const KEY_ALLOW_CONVERTER: &str = "allowconverter";

/// Result of parsing one document: one entry per `event`, in document order.
#[derive(Debug, Default)]
pub struct ProbeDocument {
    pub probes: Vec<Result<ProbeDescriptor, ProbeError>>,
}

pub fn parse_document(text: &str) -> Result<ProbeDocument, ProbeError> {
    let root = parse_tree(text)?;
    let mut defaults = GlobalDefaults::new();
    let mut document = ProbeDocument::default();
    collect(&root, &mut defaults, &mut document);
    Ok(document)
}

fn collect(element: &XmlElement, defaults: &mut GlobalDefaults, document: &mut ProbeDocument) {
    match element.name.as_str() {
        EVENT => document.probes.push(parse_event(element, defaults)),
        CONFIG => defaults.apply(element),
        _ => {
            for child in &element.children {
                collect(child, defaults, document);
            }
        }
    }
}

// =============================================================================
// Global Defaults
// =============================================================================

struct GlobalDefaults {
    values: HashMap<String, String>,
}

impl GlobalDefaults {
    fn new() -> Self {
        let values = [
            (KEY_CLASS_PREFIX, DEFAULT_CLASS_PREFIX),
            // Both coercions are opt-in.
            (KEY_ALLOW_TO_STRING, "false"),
            (KEY_ALLOW_CONVERTER, "false"),
            (KEY_RETHROW, "false"),
            (KEY_EMIT_ON_EXCEPTION, "false"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { values }
    }

    fn apply(&mut self, config: &XmlElement) {
        for entry in &config.children {
            self.values.insert(entry.name.clone(), entry.text().to_string());
        }
    }
}

// =============================================================================
// Events
// =============================================================================

fn parse_event(event: &XmlElement, defaults: &GlobalDefaults) -> Result<ProbeDescriptor, ProbeError> {
    let id = event
        .attribute("id")
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProbeError::spec("event without an id"))?
        .to_string();
    let fail = |message: String| ProbeError::spec_for(&id, message);

    let mut values: HashMap<String, String> = event
        .children
        .iter()
        .filter(|c| c.children.is_empty())
        .map(|c| (c.name.clone(), c.text().to_string()))
        .collect();
    for (key, value) in &defaults.values {
        values.entry(key.clone()).or_insert_with(|| value.clone());
    }
    let value = |key: &str| values.get(key).map(String::as_str).filter(|v| !v.is_empty());

    let class_name = value(KEY_CLASS).ok_or_else(|| fail("event without a class".into()))?;
    if !is_valid_class_name(class_name) {
        return Err(fail(format!("'{class_name}' is not a valid class name")));
    }

    let method = event
        .child(METHOD)
        .ok_or_else(|| fail("event without a method".into()))?;
    let method_name = method
        .child("name")
        .map(XmlElement::text)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| fail("method without a name".into()))?;
    let method_descriptor = method
        .child("descriptor")
        .map(XmlElement::text)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| fail(format!("method {method_name} without a descriptor")))?;
    MethodType::parse(method_descriptor).map_err(|e| fail(e.to_string()))?;

    let mut probe = ProbeDescriptor::new(
        id.clone(),
        to_internal_name(class_name),
        MethodTarget::new(method_name, method_descriptor),
    );

    for parameter in method.nested(PARAMETERS, PARAMETER) {
        let index = parameter
            .attribute("index")
            .map(str::trim)
            .ok_or_else(|| fail("parameter without an index".into()))?;
        let index = index
            .parse::<usize>()
            .map_err(|_| fail(format!("parameter index '{index}' is not a number")))?;
        probe.parameters.push(ParameterBinding {
            index,
            attribute: parse_attribute(parameter, PARAMETER).map_err(&fail)?,
        });
    }

    if let Some(return_value) = method.child(RETURN_VALUE) {
        probe.return_value = Some(ReturnBinding {
            attribute: parse_attribute(return_value, RETURN_VALUE).map_err(&fail)?,
        });
    }

    for field in event.nested(FIELDS, FIELD) {
        let expression = field
            .child("expression")
            .map(XmlElement::text)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| fail("field without an expression".into()))?;
        probe.fields.push(FieldBinding {
            expression: expression.to_string(),
            attribute: parse_attribute(field, FIELD).map_err(&fail)?,
        });
    }

    probe.config = ProbeConfig {
        allow_to_string: parse_bool(value(KEY_ALLOW_TO_STRING)),
        allow_converter: parse_bool(value(KEY_ALLOW_CONVERTER)),
        use_rethrow: parse_bool(value(KEY_RETHROW)),
        emit_on_exception: parse_bool(value(KEY_EMIT_ON_EXCEPTION)),
        record_stack_trace: value(KEY_STACK_TRACE).map_or(true, |v| parse_bool(Some(v))),
        event_label: value(KEY_LABEL).unwrap_or(&id).to_string(),
        event_path: value(KEY_PATH).map(str::to_string),
        event_description: value(KEY_DESCRIPTION).map(str::to_string),
        class_prefix: value(KEY_CLASS_PREFIX)
            .unwrap_or(DEFAULT_CLASS_PREFIX)
            .to_string(),
    };
    Ok(probe)
}

fn parse_attribute(element: &XmlElement, kind: &str) -> Result<AttributeBinding, String> {
    let text = |key: &str| {
        element
            .child(key)
            .map(XmlElement::text)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let name = text("name").ok_or_else(|| format!("{kind} without a name"))?;
    Ok(AttributeBinding {
        name,
        description: text("description"),
        content_type: text("contenttype"),
        relation_key: text("relationkey"),
        converter: text("converter"),
    })
}

fn parse_bool(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

// =============================================================================
// Element Tree
// =============================================================================

#[derive(Debug, Default)]
struct XmlElement {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<XmlElement>,
}

impl XmlElement {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, ProbeError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute
                .map_err(|e| ProbeError::spec(format!("bad attribute on <{name}>: {e}")))?;
            let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| ProbeError::spec(format!("bad attribute value on <{name}>: {e}")))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            ..Self::default()
        })
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Elements named `item`, either direct children or inside a `wrapper`.
    fn nested<'a>(&'a self, wrapper: &'a str, item: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        let direct = self.children.iter().filter(move |c| c.name == item);
        let wrapped = self
            .children
            .iter()
            .filter(move |c| c.name == wrapper)
            .flat_map(move |w| w.children.iter().filter(move |c| c.name == item));
        direct.chain(wrapped)
    }

    fn text(&self) -> &str {
        self.text.trim()
    }
}

fn parse_tree(text: &str) -> Result<XmlElement, ProbeError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    let mut attach = |element: XmlElement, stack: &mut Vec<XmlElement>| -> Result<(), ProbeError> {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None if root.is_none() => root = Some(element),
            None => return Err(ProbeError::spec("document has more than one root element")),
        }
        Ok(())
    };

    loop {
        let position = reader.buffer_position();
        let event = reader
            .read_event()
            .map_err(|e| ProbeError::spec(format!("malformed XML at byte {position}: {e}")))?;
        match event {
            Event::Start(start) => stack.push(XmlElement::from_start(&start)?),
            Event::Empty(start) => attach(XmlElement::from_start(&start)?, &mut stack)?,
            Event::End(_) => {
                let Some(element) = stack.pop() else {
                    return Err(ProbeError::spec("unbalanced closing tag"));
                };
                attach(element, &mut stack)?;
            }
            Event::Text(content) => {
                let content = content
                    .unescape()
                    .map_err(|e| ProbeError::spec(format!("bad text at byte {position}: {e}")))?;
                match stack.last_mut() {
                    Some(element) => element.text.push_str(&content),
                    None if content.trim().is_empty() => {}
                    None => return Err(ProbeError::spec("text outside the root element")),
                }
            }
            Event::CData(data) => {
                if let Some(element) = stack.last_mut() {
                    element.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(ProbeError::spec(format!("element <{}> is never closed", open.name)));
    }
    root.ok_or_else(|| ProbeError::spec("document has no root element"))
}
